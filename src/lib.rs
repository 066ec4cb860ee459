// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Bootvault - early-boot unlocking of LUKS2 encrypted volumes
//!
//! This library orchestrates the activation of LUKS2 full-disk-encryption
//! volumes on Linux, using disk-unlock keys sealed against a platform
//! secure device with fallback to a human-enterable recovery key.
//!
//! # Features
//!
//! - **Platform-sealed keys**: unlock keys recovered through a pluggable
//!   [`PlatformKeyHandler`] (TPM or similar secure element)
//! - **Recovery fallback**: interactive recovery-key entry with a retry
//!   budget when the platform path fails
//! - **Kernel keyring integration**: recovered keys published for later
//!   userspace under stable descriptions
//! - **Model authorisation**: MAC-protected list of device models allowed
//!   to use a sealed key
//! - **LUKS2 provisioning**: container format, recovery-key enrollment and
//!   primary-key rotation via the `cryptsetup` CLI
//! - **Memory safety**: key material zeroised as soon as activation no
//!   longer needs it
//!
//! # Example
//!
//! ```no_run
//! use bootvault::{ActivateVolumeOptions, KeyData, VolumeActivator};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key_data = KeyData::read_from(std::fs::File::open("/run/keydata")?)?;
//!
//! let options = ActivateVolumeOptions {
//!     recovery_key_tries: 3,
//!     ..Default::default()
//! };
//!
//! let activator = VolumeActivator::new();
//! let checker = activator.activate_volume_with_key_data(
//!     "data", "/dev/sda1", &key_data, &options,
//! )?;
//!
//! if let Some(checker) = checker {
//!     // The volume was unlocked with the platform-protected key; the
//!     // checker answers which device models were authorised to do so.
//!     let _ = checker;
//! }
//! # Ok(())
//! # }
//! ```

pub mod activate;
pub mod cryptsetup;
pub mod error;
pub mod keydata;
pub mod keyring;
pub mod models;
pub mod platform;
pub mod provision;
pub mod recovery;

// Re-export commonly used types
pub use activate::{ActivateVolumeOptions, VolumeActivator};
pub use cryptsetup::{AskPasswordError, AttachError, HelperPaths};
pub use error::{ActivateError, AttemptErrorKind, AttemptFailure};
pub use keydata::{AuxiliaryKey, DiskUnlockKey, KeyData, KeyDataError, KeyId};
pub use keyring::{
    add_key_to_user_keyring, get_auxiliary_key_from_kernel, get_disk_unlock_key_from_kernel,
    KeyPurpose, KeyringError,
};
pub use models::{DeviceModel, ModelCheckError, ModelChecker};
pub use platform::{register_platform_key_handler, PlatformHandlerError, PlatformKeyHandler};
pub use provision::{InitializeLuks2ContainerOptions, Luks2Provisioner, ProvisionError};
pub use recovery::{RecoveryKey, RecoveryKeyParseError, RECOVERY_KEY_SIZE};
