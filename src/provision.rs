// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! LUKS2 container provisioning through the `cryptsetup` CLI.
//!
//! These operations shape the on-disk container that activation later
//! opens: format a device as LUKS2 with the primary unlock key in slot 0,
//! enroll a recovery key alongside it, and rotate the primary key using
//! the recovery key when the sealed copy is lost. The LUKS2 layout
//! decisions (cipher, key size, PBKDF costs, slot priorities) are fixed
//! by argument construction here, never derived from the key material.
//!
//! Key bytes reach `cryptsetup` over stdin or a single-use FIFO; they are
//! never placed in argv or on the filesystem.

use crate::cryptsetup::{write_key_to_fifo, HelperPaths, KeyFifo};
use crate::recovery::RecoveryKey;
use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Minimum length of a LUKS2 primary key, in bytes.
const MIN_KEY_LEN: usize = 32;

/// Errors from LUKS2 provisioning operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The supplied primary key is too short.
    #[error("expected a key length of at least 256-bits (got {bits})")]
    KeyLength {
        /// Length of the rejected key, in bits.
        bits: usize,
    },

    /// The requested LUKS2 metadata area size is not supported.
    #[error("cannot set metadata size to {kib} KiB")]
    MetadataSize {
        /// The rejected size.
        kib: u32,
    },

    /// The requested LUKS2 keyslots area size is not supported.
    #[error("cannot set keyslots area size to {kib} KiB")]
    KeyslotsSize {
        /// The rejected size.
        kib: u32,
    },

    /// `cryptsetup` exited with a non-zero status.
    #[error("{} failed: exit status {status}", .program.display())]
    HelperFailed {
        /// Path the helper was invoked as.
        program: PathBuf,
        /// Its exit status.
        status: i32,
    },

    /// `cryptsetup` was terminated by a signal.
    #[error("{} terminated by signal", .program.display())]
    HelperSignaled {
        /// Path the helper was invoked as.
        program: PathBuf,
    },

    /// Spawning the helper or feeding it key material failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Layout options for [`Luks2Provisioner::initialize_container`].
///
/// A zero size leaves the corresponding `cryptsetup` default in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitializeLuks2ContainerOptions {
    /// Size of the LUKS2 metadata (header) area in KiB. Must be zero or a
    /// power of two between 16 and 4096.
    pub metadata_kib_size: u32,

    /// Size of the LUKS2 binary keyslots area in KiB. Must be zero or a
    /// multiple of 4 between 4 and 131072.
    pub keyslots_area_kib_size: u32,
}

impl InitializeLuks2ContainerOptions {
    fn validate(&self) -> Result<(), ProvisionError> {
        let metadata = self.metadata_kib_size;
        if metadata != 0 && !(metadata.is_power_of_two() && (16..=4096).contains(&metadata)) {
            return Err(ProvisionError::MetadataSize { kib: metadata });
        }

        let keyslots = self.keyslots_area_kib_size;
        if keyslots != 0 && !(keyslots % 4 == 0 && (4..=128 * 1024).contains(&keyslots)) {
            return Err(ProvisionError::KeyslotsSize { kib: keyslots });
        }

        Ok(())
    }
}

/// Provisions LUKS2 containers by driving the `cryptsetup` CLI.
#[derive(Debug, Clone)]
pub struct Luks2Provisioner {
    paths: HelperPaths,
}

impl Default for Luks2Provisioner {
    fn default() -> Self {
        Luks2Provisioner::new()
    }
}

impl Luks2Provisioner {
    /// Creates a provisioner using the system `cryptsetup`.
    pub fn new() -> Self {
        Luks2Provisioner {
            paths: HelperPaths::default(),
        }
    }

    /// Creates a provisioner with explicit helper locations.
    pub fn with_helper_paths(paths: HelperPaths) -> Self {
        Luks2Provisioner { paths }
    }

    /// Formats `device_path` as a LUKS2 container with `key` in slot 0.
    ///
    /// Slot 0 is configured with the `prefer` priority so later unlocks
    /// try the primary key first. The key must be at least 256 bits.
    ///
    /// # Errors
    ///
    /// Fails before spawning anything on a short key or invalid layout
    /// options; helper failures surface with their exit status.
    pub fn initialize_container(
        &self,
        device_path: &str,
        label: &str,
        key: &[u8],
        options: Option<&InitializeLuks2ContainerOptions>,
    ) -> Result<(), ProvisionError> {
        if key.len() < MIN_KEY_LEN {
            return Err(ProvisionError::KeyLength {
                bits: key.len() * 8,
            });
        }
        if let Some(options) = options {
            options.validate()?;
        }

        let mut args: Vec<OsString> = [
            "-q",
            "luksFormat",
            "--type",
            "luks2",
            "--key-file",
            "-",
            "--cipher",
            "aes-xts-plain64",
            "--key-size",
            "512",
            "--pbkdf",
            "argon2i",
            "--iter-time",
            "100",
            "--label",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(label.into());
        if let Some(options) = options {
            if options.metadata_kib_size != 0 {
                args.push("--luks2-metadata-size".into());
                args.push(format!("{}k", options.metadata_kib_size).into());
            }
            if options.keyslots_area_kib_size != 0 {
                args.push("--luks2-keyslots-size".into());
                args.push(format!("{}k", options.keyslots_area_kib_size).into());
            }
        }
        args.push(device_path.into());

        log::debug!("formatting {} as LUKS2 container {:?}", device_path, label);
        self.run_cryptsetup(&args, Some(key))?;

        self.run_cryptsetup(
            &["config", "--priority", "prefer", "--key-slot", "0", device_path],
            None,
        )
    }

    /// Adds `recovery_key` to the next free keyslot of `device_path`,
    /// authorising with `existing_key`.
    ///
    /// The recovery slot uses a deliberately expensive PBKDF benchmark so
    /// an attack on the human-enterable key stays costly.
    pub fn add_recovery_key(
        &self,
        device_path: &str,
        existing_key: &[u8],
        recovery_key: &RecoveryKey,
    ) -> Result<(), ProvisionError> {
        self.run_cryptsetup_with_key_fifo(
            |fifo| {
                let mut args: Vec<OsString> = vec![
                    "luksAddKey".into(),
                    "--key-file".into(),
                    fifo.as_os_str().to_os_string(),
                ];
                args.extend(
                    ["--pbkdf", "argon2i", "--iter-time", "5000"]
                        .into_iter()
                        .map(OsString::from),
                );
                args.push(device_path.into());
                args.push("-".into());
                args
            },
            existing_key,
            Some(recovery_key.as_bytes()),
        )
    }

    /// Replaces the slot-0 primary key of `device_path` with `new_key`,
    /// authorising with `recovery_key`.
    ///
    /// Three steps: kill slot 0, add the new key into slot 0 using the
    /// recovery key, and restore the `prefer` priority on slot 0. A
    /// failing step surfaces as-is; no compensating action is attempted,
    /// so the caller must treat a failure as leaving the container in an
    /// intermediate state.
    pub fn change_key_using_recovery_key(
        &self,
        device_path: &str,
        recovery_key: &RecoveryKey,
        new_key: &[u8],
    ) -> Result<(), ProvisionError> {
        if new_key.len() < MIN_KEY_LEN {
            return Err(ProvisionError::KeyLength {
                bits: new_key.len() * 8,
            });
        }

        self.run_cryptsetup(
            &["luksKillSlot", "--key-file", "-", device_path, "0"],
            Some(recovery_key.as_bytes()),
        )?;

        self.run_cryptsetup_with_key_fifo(
            |fifo| {
                let mut args: Vec<OsString> = vec![
                    "luksAddKey".into(),
                    "--key-file".into(),
                    fifo.as_os_str().to_os_string(),
                ];
                args.extend(
                    ["--pbkdf", "argon2i", "--iter-time", "100", "--key-slot", "0"]
                        .into_iter()
                        .map(OsString::from),
                );
                args.push(device_path.into());
                args.push("-".into());
                args
            },
            recovery_key.as_bytes(),
            Some(new_key),
        )?;

        self.run_cryptsetup(
            &["config", "--priority", "prefer", "--key-slot", "0", device_path],
            None,
        )
    }

    fn run_cryptsetup<I, S>(&self, args: I, stdin_data: Option<&[u8]>) -> Result<(), ProvisionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.paths.cryptsetup);
        cmd.args(args);
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn()?;
        if let Some(data) = stdin_data {
            feed_stdin(&mut child, data)?;
        }
        let status = child.wait()?;
        self.classify_exit(status.code())
    }

    /// Runs `cryptsetup` with one key delivered over a single-use FIFO
    /// (the `--key-file` argument) and an optional second key on stdin.
    fn run_cryptsetup_with_key_fifo(
        &self,
        build_args: impl FnOnce(&Path) -> Vec<OsString>,
        fifo_key: &[u8],
        stdin_data: Option<&[u8]>,
    ) -> Result<(), ProvisionError> {
        let fifo = KeyFifo::new(&self.paths.run_dir)?;
        let args = build_args(fifo.path());

        let mut cmd = Command::new(&self.paths.cryptsetup);
        cmd.args(&args);
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn()?;

        // The stdin pipe buffers key-sized writes, so feed it before the
        // FIFO open blocks on the helper.
        if let Some(data) = stdin_data {
            feed_stdin(&mut child, data)?;
        }

        let status = match write_key_to_fifo(&mut child, fifo.path(), fifo_key) {
            Ok(None) => child.wait()?,
            Ok(Some(status)) => status,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProvisionError::Io(e));
            }
        };
        self.classify_exit(status.code())
    }

    fn classify_exit(&self, code: Option<i32>) -> Result<(), ProvisionError> {
        match code {
            Some(0) => Ok(()),
            Some(status) => Err(ProvisionError::HelperFailed {
                program: self.paths.cryptsetup.clone(),
                status,
            }),
            None => Err(ProvisionError::HelperSignaled {
                program: self.paths.cryptsetup.clone(),
            }),
        }
    }
}

/// Writes key material to the child's stdin pipe. A child that exits
/// without reading its stdin produces a broken pipe, which is ignored so
/// the exit status stays the reported failure.
fn feed_stdin(child: &mut std::process::Child, data: &[u8]) -> io::Result<()> {
    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_key_is_rejected_before_spawning() {
        let provisioner = Luks2Provisioner::new();
        let err = provisioner
            .initialize_container("/dev/sda1", "data", &[0u8; 16], None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "expected a key length of at least 256-bits (got 128)"
        );

        let rk = RecoveryKey::from_bytes([0u8; 16]);
        let err = provisioner
            .change_key_using_recovery_key("/dev/sda1", &rk, &[0u8; 31])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "expected a key length of at least 256-bits (got 248)"
        );
    }

    #[test]
    fn test_metadata_size_validation() {
        for valid in [0u32, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096] {
            let options = InitializeLuks2ContainerOptions {
                metadata_kib_size: valid,
                ..Default::default()
            };
            assert!(options.validate().is_ok(), "size {} should be valid", valid);
        }

        for invalid in [1u32, 19, 500, 8192] {
            let options = InitializeLuks2ContainerOptions {
                metadata_kib_size: invalid,
                ..Default::default()
            };
            assert_eq!(
                options.validate().unwrap_err().to_string(),
                format!("cannot set metadata size to {} KiB", invalid)
            );
        }
    }

    #[test]
    fn test_keyslots_size_validation() {
        for valid in [0u32, 4, 16, 256, 8 * 1024, 128 * 1024] {
            let options = InitializeLuks2ContainerOptions {
                keyslots_area_kib_size: valid,
                ..Default::default()
            };
            assert!(options.validate().is_ok(), "size {} should be valid", valid);
        }

        for invalid in [1u32, 3, 41, 128 * 1024 + 4] {
            let options = InitializeLuks2ContainerOptions {
                keyslots_area_kib_size: invalid,
                ..Default::default()
            };
            assert_eq!(
                options.validate().unwrap_err().to_string(),
                format!("cannot set keyslots area size to {} KiB", invalid)
            );
        }
    }

    #[test]
    fn test_invalid_options_fail_before_any_subprocess() {
        // A provisioner pointing at a nonexistent binary only errors once
        // a subprocess is actually needed, so validation failures prove
        // nothing was spawned.
        let paths = HelperPaths {
            cryptsetup: PathBuf::from("/nonexistent/cryptsetup"),
            ..HelperPaths::default()
        };
        let provisioner = Luks2Provisioner::with_helper_paths(paths);

        let options = InitializeLuks2ContainerOptions {
            metadata_kib_size: 500,
            ..Default::default()
        };
        let err = provisioner
            .initialize_container("/dev/sda1", "data", &[0u8; 32], Some(&options))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::MetadataSize { kib: 500 }));
    }
}
