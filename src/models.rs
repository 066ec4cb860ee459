// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Device-model authorisation for unlocked volumes.
//!
//! A [`KeyData`] carries the set of device models permitted to use it,
//! stored as identity digests and authenticated by an HMAC keyed with the
//! auxiliary key. After a volume is unlocked, the [`ModelChecker`] built
//! from the winning key data answers whether a given model is in that set.
//!
//! [`KeyData`]: crate::keydata::KeyData

use crate::keydata::{base64_bytes, base64_bytes_list, AuxiliaryKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// A device identity that can be checked against an authorised-models list.
///
/// Two models are the same model exactly when their identity digests are
/// equal; nothing else about the assertion is inspected here.
pub trait DeviceModel {
    /// Returns the stable identity digest of this model.
    fn identity_digest(&self) -> &[u8];
}

/// The authorised-models section of a [`KeyData`](crate::keydata::KeyData):
/// identity digests plus the MAC binding them to the auxiliary key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedModels {
    #[serde(with = "base64_bytes_list")]
    pub(crate) digests: Vec<Vec<u8>>,
    #[serde(with = "base64_bytes")]
    pub(crate) mac: Vec<u8>,
}

/// Errors from model authorisation checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelCheckError {
    /// The MAC over the authorised-models list does not verify under the
    /// held auxiliary key.
    #[error("invalid auxiliary key")]
    InvalidAuxiliaryKey,
}

/// Answers model-authorisation queries for an activated volume.
///
/// Immutable once constructed: it holds the auxiliary key and the
/// authorised-models section of the key data that unlocked the volume.
#[derive(Debug, Clone)]
pub struct ModelChecker {
    aux_key: AuxiliaryKey,
    models: AuthorizedModels,
}

impl ModelChecker {
    pub(crate) fn new(aux_key: AuxiliaryKey, models: AuthorizedModels) -> Self {
        ModelChecker { aux_key, models }
    }

    /// Reports whether `model` is in the authorised set.
    ///
    /// The MAC over the stored digest list is re-verified on every call;
    /// a mismatch yields [`ModelCheckError::InvalidAuxiliaryKey`] rather
    /// than a membership answer. Digest comparison is constant-time.
    pub fn is_model_authorized(&self, model: &dyn DeviceModel) -> Result<bool, ModelCheckError> {
        let expected = compute_models_mac(self.aux_key.as_bytes(), &self.models.digests);
        if !bool::from(expected.as_slice().ct_eq(&self.models.mac)) {
            return Err(ModelCheckError::InvalidAuxiliaryKey);
        }

        let digest = model.identity_digest();
        let mut found = Choice::from(0u8);
        for candidate in &self.models.digests {
            if candidate.len() == digest.len() {
                found |= candidate.as_slice().ct_eq(digest);
            }
        }
        Ok(bool::from(found))
    }
}

/// MAC over an ordered digest list, keyed by the auxiliary key.
///
/// Each digest is fed length-prefixed so the list boundary is part of the
/// authenticated message.
pub(crate) fn compute_models_mac(aux_key: &[u8], digests: &[Vec<u8>]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(aux_key).expect("HMAC accepts keys of any length");
    for digest in digests {
        mac.update(&(digest.len() as u32).to_le_bytes());
        mac.update(digest);
    }
    mac.finalize().into_bytes().to_vec()
}
