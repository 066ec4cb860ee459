// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Volume activation: platform-protected attempts with recovery fallback.
//!
//! Activation walks two phases. Phase one tries each supplied [`KeyData`]
//! in order: recover the key pair from the platform's secure device, then
//! attach the volume with it. The first key data that attaches wins, its
//! keys are published to the kernel keyring, and a [`ModelChecker`] bound
//! to it is returned. Every failure is recorded, not returned.
//!
//! Phase two runs only if phase one never attached: recovery keys are
//! taken from an optional byte source and then from the interactive
//! prompt, against a caller-set try budget. A malformed candidate costs a
//! try but no helper invocation. If the budget runs out, the terminal
//! error carries the bulletised phase-one records plus the last
//! recovery failure.
//!
//! All work happens on the caller's thread; each attach blocks until the
//! helper exits, and a failed attach leaves the volume inactive with no
//! keyring entries.

use crate::cryptsetup::{self, HelperPaths};
use crate::error::{ActivateError, AttemptFailure, Result};
use crate::keydata::KeyData;
use crate::keyring::{self, KeyPurpose};
use crate::models::ModelChecker;
use crate::recovery::RecoveryKey;
use std::io::{BufRead, BufReader, Read};

/// Caller-tunable knobs for volume activation.
#[derive(Debug, Clone, Default)]
pub struct ActivateVolumeOptions {
    /// Recovery-key attempts permitted once platform-protected activation
    /// has failed. Zero disables the fallback; negative is invalid.
    pub recovery_key_tries: i32,

    /// Extra options passed through to `systemd-cryptsetup`. A `tries=`
    /// entry is reserved and rejected.
    pub activate_options: Vec<String>,

    /// Prefix for kernel keyring descriptions. Used verbatim; empty
    /// leaves the process name as the only namespace.
    pub keyring_prefix: String,
}

/// Drives volume activation against a set of helper binaries.
///
/// The default construction uses the system helpers; tests inject mock
/// paths through [`VolumeActivator::with_helper_paths`].
#[derive(Debug, Clone)]
pub struct VolumeActivator {
    paths: HelperPaths,
}

impl Default for VolumeActivator {
    fn default() -> Self {
        VolumeActivator::new()
    }
}

impl VolumeActivator {
    /// Creates an activator using the system helper binaries.
    pub fn new() -> Self {
        VolumeActivator {
            paths: HelperPaths::default(),
        }
    }

    /// Creates an activator with explicit helper locations.
    pub fn with_helper_paths(paths: HelperPaths) -> Self {
        VolumeActivator { paths }
    }

    /// Activates `volume_name` using a single platform-protected key data,
    /// falling back to the recovery key per `options`.
    ///
    /// Returns `Some(ModelChecker)` when the key data unlocked the volume,
    /// `None` when the recovery key did (the recovery path carries no
    /// model authority).
    ///
    /// # Errors
    ///
    /// Fails fast on invalid options; otherwise only once both the
    /// platform attempt and the recovery fallback are exhausted, with a
    /// composite diagnostic covering every avenue.
    pub fn activate_volume_with_key_data(
        &self,
        volume_name: &str,
        source_device_path: &str,
        key_data: &KeyData,
        options: &ActivateVolumeOptions,
    ) -> Result<Option<ModelChecker>> {
        self.activate_volume_with_multiple_key_data(
            volume_name,
            source_device_path,
            std::slice::from_ref(key_data),
            options,
        )
    }

    /// Activates `volume_name` trying each key data in order, falling back
    /// to the recovery key per `options`.
    ///
    /// See [`VolumeActivator::activate_volume_with_key_data`] for the
    /// return-value and error contract.
    pub fn activate_volume_with_multiple_key_data(
        &self,
        volume_name: &str,
        source_device_path: &str,
        key_data: &[KeyData],
        options: &ActivateVolumeOptions,
    ) -> Result<Option<ModelChecker>> {
        validate_activate_options(options)?;
        if options.recovery_key_tries < 0 {
            return Err(ActivateError::InvalidRecoveryKeyTries);
        }

        let mut attempts: Vec<AttemptFailure> = Vec::new();

        for kd in key_data {
            let (unlock_key, aux_key) = match kd.recover_keys() {
                Ok(pair) => pair,
                Err(e) => {
                    attempts.push(AttemptFailure::from_recover_error(kd.id().clone(), &e));
                    continue;
                }
            };

            match cryptsetup::attach(
                &self.paths,
                volume_name,
                source_device_path,
                unlock_key.as_bytes(),
                &options.activate_options,
            ) {
                Ok(()) => {
                    publish_key(
                        unlock_key.as_bytes(),
                        source_device_path,
                        KeyPurpose::Unlock,
                        &options.keyring_prefix,
                    );
                    publish_key(
                        aux_key.as_bytes(),
                        source_device_path,
                        KeyPurpose::Aux,
                        &options.keyring_prefix,
                    );
                    return Ok(Some(ModelChecker::new(
                        aux_key,
                        kd.authorized_models().clone(),
                    )));
                }
                Err(e) => {
                    attempts.push(AttemptFailure::from_attach_error(kd.id().clone(), &e));
                }
            }
        }

        log::debug!(
            "no platform protected key activated {}, falling back to recovery key",
            source_device_path
        );

        match self.recovery_key_fallback(volume_name, source_device_path, None, options) {
            Ok(()) => Ok(None),
            Err(recovery_error) => Err(ActivateError::WithPlatformKeys {
                attempts,
                recovery_error: Box::new(recovery_error),
            }),
        }
    }

    /// Activates `volume_name` with recovery keys only.
    ///
    /// The optional `key_reader` supplies the first candidate: bytes up to
    /// the first LF or EOF, an empty read meaning no candidate. All later
    /// candidates come from the interactive prompt. Every candidate costs
    /// one try from the budget, whether or not it is well-formed.
    ///
    /// # Errors
    ///
    /// On budget exhaustion the last failure is returned, whether a decode
    /// error or a rejected attach.
    pub fn activate_volume_with_recovery_key(
        &self,
        volume_name: &str,
        source_device_path: &str,
        key_reader: Option<&mut dyn Read>,
        options: &ActivateVolumeOptions,
    ) -> Result<()> {
        validate_activate_options(options)?;
        if options.recovery_key_tries < 0 {
            return Err(ActivateError::InvalidRecoveryKeyTries);
        }

        let first_candidate = read_first_candidate(key_reader);
        self.recovery_key_fallback(volume_name, source_device_path, first_candidate, options)
    }

    /// Activates `volume_name` with a caller-supplied raw key.
    ///
    /// No recovery fallback is attempted and nothing is published to the
    /// keyring; this is the path for keys whose custody is managed
    /// entirely by the caller.
    pub fn activate_volume_with_key(
        &self,
        volume_name: &str,
        source_device_path: &str,
        key: &[u8],
        options: &ActivateVolumeOptions,
    ) -> Result<()> {
        validate_activate_options(options)?;

        cryptsetup::attach(
            &self.paths,
            volume_name,
            source_device_path,
            key,
            &options.activate_options,
        )?;
        Ok(())
    }

    fn recovery_key_fallback(
        &self,
        volume_name: &str,
        source_device_path: &str,
        mut first_candidate: Option<String>,
        options: &ActivateVolumeOptions,
    ) -> Result<()> {
        if options.recovery_key_tries == 0 {
            return Err(ActivateError::NoRecoveryKeyTriesPermitted);
        }

        let mut remaining = options.recovery_key_tries;
        let mut last_error = ActivateError::NoRecoveryKeyTriesPermitted;

        while remaining > 0 {
            remaining -= 1;

            let candidate = match first_candidate.take() {
                Some(candidate) => candidate,
                None => cryptsetup::ask_recovery_passphrase(&self.paths, source_device_path)?,
            };

            let key = match RecoveryKey::parse(&candidate) {
                Ok(key) => key,
                Err(e) => {
                    last_error = ActivateError::DecodeRecoveryKey(e);
                    continue;
                }
            };

            match cryptsetup::attach(
                &self.paths,
                volume_name,
                source_device_path,
                key.as_bytes(),
                &options.activate_options,
            ) {
                Ok(()) => {
                    publish_key(
                        key.as_bytes(),
                        source_device_path,
                        KeyPurpose::Unlock,
                        &options.keyring_prefix,
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_error = ActivateError::ActivateVolume(e);
                }
            }
        }

        Err(last_error)
    }
}

fn validate_activate_options(options: &ActivateVolumeOptions) -> Result<()> {
    if options
        .activate_options
        .iter()
        .any(|o| o.starts_with("tries="))
    {
        return Err(ActivateError::ReservedActivateOption);
    }
    Ok(())
}

/// Publication happens strictly after a successful attach. A keyring
/// failure does not undo the activation; it is logged and the caller side
/// simply won't find the key later, which environments without user
/// keyring possession already have to tolerate.
fn publish_key(key: &[u8], source_device_path: &str, purpose: KeyPurpose, prefix: &str) {
    if let Err(e) = keyring::add_key_to_user_keyring(key, source_device_path, purpose, prefix) {
        log::warn!(
            "cannot add {} key for {} to user keyring: {}",
            purpose,
            source_device_path,
            e
        );
    }
}

/// Reads the reader-supplied candidate: everything up to the first LF or
/// EOF, with a trailing LF trimmed. An empty result means "no source" and
/// does not consume a try. A read failure is treated the same way.
fn read_first_candidate(key_reader: Option<&mut dyn Read>) -> Option<String> {
    let reader = key_reader?;
    let mut line = Vec::new();
    if let Err(e) = BufReader::new(reader).read_until(b'\n', &mut line) {
        log::warn!("cannot read recovery key from supplied reader: {}", e);
        return None;
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}
