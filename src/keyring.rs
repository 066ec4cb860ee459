// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Publication of unlock keys to the kernel user keyring.
//!
//! After a successful activation the keys that unlocked the volume are
//! copied into the user keyring as `user`-type keys, so that later
//! userspace (running as the same user) can retrieve them without redoing
//! the platform recovery. Entries are addressed by a description derived
//! from the keyring prefix, the running process name, the key purpose and
//! the block device path.
//!
//! Retrieval only works from a process that possesses the user keyring
//! (normally via a link from its session keyring). Where that link is
//! missing, lookups fail with a [`KeyringError`]; that is an environment
//! property rather than a publication failure, and callers are expected
//! to tolerate it.

use crate::cryptsetup::process_name;
use crate::keydata::{AuxiliaryKey, DiskUnlockKey};
use libc::{c_char, c_long, syscall, SYS_add_key, SYS_keyctl, SYS_request_key};
use std::ffi::CString;
use std::fmt;
use std::io;
use thiserror::Error;
use zeroize::Zeroizing;

// Keyring constants from <linux/keyctl.h>. Defined here rather than taken
// from libc so older libc versions keep building.
const KEY_SPEC_USER_KEYRING: c_long = -4;
const KEYCTL_READ: c_long = 11;

const KEY_TYPE_USER: &[u8] = b"user\0";

/// Errors from kernel keyring operations.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// The derived description contains an interior NUL byte.
    #[error("invalid key description: {0:?}")]
    InvalidDescription(String),

    /// `add_key(2)` failed.
    #[error("cannot add key to user keyring: {0}")]
    AddKey(#[source] io::Error),

    /// `request_key(2)` found no matching key, or the process does not
    /// possess the user keyring.
    #[error("cannot find key in user keyring: {0}")]
    SearchKey(#[source] io::Error),

    /// The key was found but its payload could not be read.
    #[error("cannot read key from user keyring: {0}")]
    ReadKey(#[source] io::Error),
}

/// What a published key is for; the third field of the description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// The disk unlock key that opened a keyslot.
    Unlock,
    /// The auxiliary key recovered alongside it.
    Aux,
}

impl KeyPurpose {
    fn as_str(self) -> &'static str {
        match self {
            KeyPurpose::Unlock => "unlock",
            KeyPurpose::Aux => "aux",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn key_description(prefix: &str, purpose: KeyPurpose, device_path: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        prefix,
        process_name(),
        purpose.as_str(),
        device_path
    )
}

/// Publishes `key` into the user keyring for `device_path`.
///
/// An existing entry under the same description is replaced in place.
pub fn add_key_to_user_keyring(
    key: &[u8],
    device_path: &str,
    purpose: KeyPurpose,
    prefix: &str,
) -> Result<(), KeyringError> {
    let desc = key_description(prefix, purpose, device_path);
    let desc_c =
        CString::new(desc.as_str()).map_err(|_| KeyringError::InvalidDescription(desc.clone()))?;

    // SAFETY: all pointers reference live, NUL-terminated or
    // length-delimited buffers for the duration of the call.
    let serial = unsafe {
        syscall(
            SYS_add_key,
            KEY_TYPE_USER.as_ptr(),
            desc_c.as_ptr(),
            key.as_ptr(),
            key.len(),
            KEY_SPEC_USER_KEYRING,
        )
    };
    if serial < 0 {
        return Err(KeyringError::AddKey(io::Error::last_os_error()));
    }

    log::debug!("published {} key for {} to user keyring", purpose, device_path);
    Ok(())
}

fn read_key_from_user_keyring(
    prefix: &str,
    purpose: KeyPurpose,
    device_path: &str,
) -> Result<Zeroizing<Vec<u8>>, KeyringError> {
    let desc = key_description(prefix, purpose, device_path);
    let desc_c =
        CString::new(desc.as_str()).map_err(|_| KeyringError::InvalidDescription(desc.clone()))?;

    // SAFETY: type and description are NUL-terminated; no callout info.
    let serial = unsafe {
        syscall(
            SYS_request_key,
            KEY_TYPE_USER.as_ptr(),
            desc_c.as_ptr(),
            std::ptr::null::<c_char>(),
            KEY_SPEC_USER_KEYRING,
        )
    };
    if serial < 0 {
        return Err(KeyringError::SearchKey(io::Error::last_os_error()));
    }

    // First pass with a null buffer reports the payload size.
    // SAFETY: a null buffer with zero length is the documented size query.
    let size = unsafe { syscall(SYS_keyctl, KEYCTL_READ, serial, std::ptr::null_mut::<u8>(), 0usize) };
    if size < 0 {
        return Err(KeyringError::ReadKey(io::Error::last_os_error()));
    }

    let mut payload = Zeroizing::new(vec![0u8; size as usize]);
    // SAFETY: the buffer is valid for `payload.len()` bytes.
    let read = unsafe {
        syscall(
            SYS_keyctl,
            KEYCTL_READ,
            serial,
            payload.as_mut_ptr(),
            payload.len(),
        )
    };
    if read < 0 {
        return Err(KeyringError::ReadKey(io::Error::last_os_error()));
    }
    let read = (read as usize).min(payload.len());
    payload.truncate(read);

    Ok(payload)
}

/// Retrieves the disk unlock key published for `device_path`.
///
/// # Errors
///
/// Fails when no key was published under the derived description, or when
/// the calling process does not possess the user keyring.
pub fn get_disk_unlock_key_from_kernel(
    prefix: &str,
    device_path: &str,
) -> Result<DiskUnlockKey, KeyringError> {
    let payload = read_key_from_user_keyring(prefix, KeyPurpose::Unlock, device_path)?;
    Ok(DiskUnlockKey::new(payload.to_vec()))
}

/// Retrieves the auxiliary key published for `device_path`.
///
/// # Errors
///
/// Same failure modes as [`get_disk_unlock_key_from_kernel`].
pub fn get_auxiliary_key_from_kernel(
    prefix: &str,
    device_path: &str,
) -> Result<AuxiliaryKey, KeyringError> {
    let payload = read_key_from_user_keyring(prefix, KeyPurpose::Aux, device_path)?;
    Ok(AuxiliaryKey::new(payload.to_vec()))
}
