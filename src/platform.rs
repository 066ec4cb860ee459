// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! The seam between key data and the hardware that sealed it.
//!
//! Everything this crate knows about the platform's secure device goes
//! through [`PlatformKeyHandler`]: give it a [`KeyData`] and it either
//! returns the `(DiskUnlockKey, AuxiliaryKey)` pair or a classified
//! failure. The classification is what drives the activation state
//! machine's fallback decisions: an unavailable or unprovisioned device
//! sends the caller to the recovery key, while a key the device rejects
//! only rules out that particular key data.
//!
//! Handlers register themselves under the platform name that their sealed
//! blobs carry, from an explicit init call early in program startup.

use crate::keydata::{AuxiliaryKey, DiskUnlockKey, KeyData};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

/// Classified failure from a platform key handler.
///
/// The variants map one-to-one onto the activation state machine's
/// fallback decisions, and their renderings are stable diagnostics.
#[derive(Debug, Error)]
pub enum PlatformHandlerError {
    /// The secure device is absent, locked out, or transiently rejecting
    /// operations. The caller should fall back to the recovery key.
    #[error("the platform's secure device is unavailable: {0}")]
    Unavailable(String),

    /// The secure device is present but has not been provisioned. The
    /// caller should fall back to the recovery key.
    #[error("the platform's secure device isn't properly initialized: {0}")]
    Uninitialized(String),

    /// The sealed blob decodes but does not yield a usable key. The caller
    /// should try the next key data rather than the recovery key.
    #[error("invalid key data: {0}")]
    InvalidKey(String),

    /// Any other failure, surfaced verbatim and not retried for this key
    /// data.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Capability to unseal key data bound to one platform.
pub trait PlatformKeyHandler: Send + Sync {
    /// Recovers the unlock and auxiliary keys from the sealed blob in
    /// `data`.
    ///
    /// # Errors
    ///
    /// Returns a [`PlatformHandlerError`] classifying the failure for the
    /// activation state machine.
    fn recover_keys(
        &self,
        data: &KeyData,
    ) -> Result<(DiskUnlockKey, AuxiliaryKey), PlatformHandlerError>;
}

type HandlerMap = HashMap<String, Arc<dyn PlatformKeyHandler>>;

fn registry() -> &'static RwLock<HandlerMap> {
    static REGISTRY: OnceLock<RwLock<HandlerMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers `handler` for key data carrying `platform_name`.
///
/// A later registration under the same name replaces the earlier one.
pub fn register_platform_key_handler(platform_name: &str, handler: Arc<dyn PlatformKeyHandler>) {
    match registry().write() {
        Ok(mut handlers) => {
            handlers.insert(platform_name.to_string(), handler);
        }
        Err(poisoned) => {
            poisoned.into_inner().insert(platform_name.to_string(), handler);
        }
    }
}

/// Recovers the key pair for `data` via the handler registered for its
/// platform name.
///
/// An unregistered platform is an unavailable device: the state machine
/// should treat it the same as absent hardware and fall back to recovery.
pub(crate) fn recover_keys(
    data: &KeyData,
) -> Result<(DiskUnlockKey, AuxiliaryKey), PlatformHandlerError> {
    let handler = {
        let handlers = match registry().read() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(data.platform_name()).cloned()
    };

    match handler {
        Some(handler) => handler.recover_keys(data),
        None => Err(PlatformHandlerError::Unavailable(format!(
            "no handler registered for platform \"{}\"",
            data.platform_name()
        ))),
    }
}
