// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Platform-bound key data and the secrets recovered from it.
//!
//! A [`KeyData`] is the host-side record for one sealed disk-unlock key:
//! an identity, the name of the platform handler able to unseal it, the
//! sealed blob itself, and the set of device models authorised to use it.
//! The blob is opaque here; only the registered [platform handler]
//! understands it.
//!
//! Rewriting a `KeyData` through the serialise/deserialise path preserves
//! the identity, the sealed blob, and the authorised-models MAC.
//!
//! [platform handler]: crate::platform::PlatformKeyHandler

use crate::models::{compute_models_mac, AuthorizedModels, DeviceModel};
use crate::platform::{self, PlatformHandlerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The key that opens a LUKS2 keyslot on the encrypted volume.
///
/// Zeroised on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DiskUnlockKey(Vec<u8>);

impl DiskUnlockKey {
    /// Wraps raw key material.
    pub fn new(bytes: Vec<u8>) -> Self {
        DiskUnlockKey(bytes)
    }

    /// Returns the raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a zero-length key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for DiskUnlockKey {
    fn from(bytes: &[u8]) -> Self {
        DiskUnlockKey(bytes.to_vec())
    }
}

impl fmt::Debug for DiskUnlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiskUnlockKey({} bytes)", self.0.len())
    }
}

/// The companion secret recovered alongside a [`DiskUnlockKey`].
///
/// It keys the MAC over the authorised-models list carried in the
/// [`KeyData`] the pair was recovered from. Zeroised on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AuxiliaryKey(Vec<u8>);

impl AuxiliaryKey {
    /// Wraps raw key material.
    pub fn new(bytes: Vec<u8>) -> Self {
        AuxiliaryKey(bytes)
    }

    /// Returns the raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a zero-length key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for AuxiliaryKey {
    fn from(bytes: &[u8]) -> Self {
        AuxiliaryKey(bytes.to_vec())
    }
}

impl fmt::Debug for AuxiliaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuxiliaryKey({} bytes)", self.0.len())
    }
}

/// Identity of a [`KeyData`]: a name and a revision.
///
/// Rendered as `name@revision` in diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyId {
    /// Human-meaningful name of the key.
    pub name: String,
    /// Revision of the key under that name.
    pub revision: u32,
}

impl KeyId {
    /// Creates an identity from a name and revision.
    pub fn new(name: impl Into<String>, revision: u32) -> Self {
        KeyId {
            name: name.into(),
            revision,
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.revision)
    }
}

/// Errors produced when reading or writing a [`KeyData`].
#[derive(Debug, Error)]
pub enum KeyDataError {
    /// The serialised form could not be decoded.
    #[error("cannot decode key data: {0}")]
    Decode(#[source] serde_json::Error),

    /// The key data could not be encoded.
    #[error("cannot encode key data: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A sealed disk-unlock key bound to a platform device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyData {
    id: KeyId,
    platform_name: String,
    #[serde(with = "base64_bytes")]
    sealed_blob: Vec<u8>,
    authorized_models: AuthorizedModels,
}

impl KeyData {
    /// Creates key data for a blob sealed by the named platform.
    ///
    /// The authorised-models list starts out empty; populate it with
    /// [`KeyData::set_authorized_models`] once the auxiliary key is known.
    pub fn new(id: KeyId, platform_name: impl Into<String>, sealed_blob: Vec<u8>) -> Self {
        KeyData {
            id,
            platform_name: platform_name.into(),
            sealed_blob,
            authorized_models: AuthorizedModels::default(),
        }
    }

    /// Returns the identity of this key data.
    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// Returns the name of the platform that sealed the blob.
    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// Returns the sealed blob.
    pub fn sealed_blob(&self) -> &[u8] {
        &self.sealed_blob
    }

    pub(crate) fn authorized_models(&self) -> &AuthorizedModels {
        &self.authorized_models
    }

    /// Replaces the authorised-models list, re-MACing it under `aux_key`.
    ///
    /// This is the out-of-band write path: it must be driven with the same
    /// auxiliary key that the platform handler recovers from the sealed
    /// blob, otherwise later [`ModelChecker`] queries will report an
    /// invalid auxiliary key.
    ///
    /// [`ModelChecker`]: crate::models::ModelChecker
    pub fn set_authorized_models(&mut self, aux_key: &AuxiliaryKey, models: &[&dyn DeviceModel]) {
        let digests: Vec<Vec<u8>> = models.iter().map(|m| m.identity_digest().to_vec()).collect();
        let mac = compute_models_mac(aux_key.as_bytes(), &digests);
        self.authorized_models = AuthorizedModels { digests, mac };
    }

    /// Asks the registered platform handler to turn the sealed blob back
    /// into the `(DiskUnlockKey, AuxiliaryKey)` pair.
    ///
    /// # Errors
    ///
    /// Surfaces the handler's failure classification; an unregistered
    /// platform name is reported as an unavailable device.
    pub fn recover_keys(&self) -> Result<(DiskUnlockKey, AuxiliaryKey), PlatformHandlerError> {
        platform::recover_keys(self)
    }

    /// Serialises the key data to a writer as JSON.
    pub fn write_to<W: Write>(&self, w: W) -> Result<(), KeyDataError> {
        serde_json::to_writer(w, self).map_err(KeyDataError::Encode)
    }

    /// Deserialises key data previously written with [`KeyData::write_to`].
    pub fn read_from<R: Read>(r: R) -> Result<Self, KeyDataError> {
        serde_json::from_reader(r).map_err(KeyDataError::Decode)
    }
}

/// Serde adapter storing binary fields as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for lists of binary fields, each a base64 string.
pub(crate) mod base64_bytes_list {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = items.iter().map(|b| STANDARD.encode(b)).collect();
        serde::Serialize::serialize(&encoded, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(d)?;
        encoded
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
