// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Drivers for the system cryptsetup helpers.
//!
//! Volume activation is delegated to `systemd-cryptsetup attach`, which
//! reads the key material from a named FIFO created for exactly one
//! attempt. The FIFO lives in a process-private directory under the
//! runtime dir and is removed on every exit path. Interactive recovery-key
//! entry goes through `systemd-ask-password`.
//!
//! Every attach forces `tries=1`; retry policy belongs to the activation
//! state machine, not the helper.

use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Locations of the external helpers and the runtime directory.
///
/// The defaults point at the system binaries; tests substitute mock
/// scripts and a scratch runtime dir.
#[derive(Debug, Clone)]
pub struct HelperPaths {
    /// `systemd-cryptsetup` binary used for volume activation.
    pub systemd_cryptsetup: PathBuf,
    /// `systemd-ask-password` binary used for interactive prompts.
    pub systemd_ask_password: PathBuf,
    /// `cryptsetup` binary used for container provisioning.
    pub cryptsetup: PathBuf,
    /// Directory under which per-attempt FIFO directories are created.
    pub run_dir: PathBuf,
}

impl Default for HelperPaths {
    fn default() -> Self {
        HelperPaths {
            systemd_cryptsetup: PathBuf::from("/lib/systemd/systemd-cryptsetup"),
            systemd_ask_password: PathBuf::from("systemd-ask-password"),
            cryptsetup: PathBuf::from("cryptsetup"),
            run_dir: PathBuf::from("/run"),
        }
    }
}

/// Errors from driving `systemd-cryptsetup attach`.
#[derive(Debug, Error)]
pub enum AttachError {
    /// The helper exited with a non-zero status. Status 5 means the key
    /// did not match any keyslot.
    #[error("{} failed: exit status {status}", .helper.display())]
    HelperFailed {
        /// Path the helper was invoked as.
        helper: PathBuf,
        /// Its exit status.
        status: i32,
    },

    /// The helper was terminated by a signal.
    #[error("{} terminated by signal", .helper.display())]
    HelperSignaled {
        /// Path the helper was invoked as.
        helper: PathBuf,
    },

    /// Creating the FIFO, spawning the helper, or feeding it the key
    /// failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AttachError {
    /// True when the helper reported that the key matched no keyslot.
    pub fn is_key_mismatch(&self) -> bool {
        matches!(self, AttachError::HelperFailed { status: 5, .. })
    }
}

/// Errors from driving `systemd-ask-password`.
#[derive(Debug, Error)]
pub enum AskPasswordError {
    /// The helper could not be executed.
    #[error("cannot execute systemd-ask-password: {0}")]
    Io(#[from] io::Error),

    /// The helper ran but did not exit cleanly.
    #[error("{} failed: {status}", .helper.display())]
    Failed {
        /// Path the helper was invoked as.
        helper: PathBuf,
        /// Its exit status.
        status: ExitStatus,
    },
}

/// Base name of the running process, used to namespace FIFO directories,
/// prompt identifiers and keyring descriptions.
pub(crate) fn process_name() -> String {
    match std::env::args().next() {
        Some(arg0) => Path::new(&arg0)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
        None => env!("CARGO_PKG_NAME").to_string(),
    }
}

/// A single-use named FIFO in a process-private runtime directory.
///
/// The directory and FIFO are created on construction and removed when the
/// guard drops, on every exit path.
pub(crate) struct KeyFifo {
    dir: PathBuf,
    path: PathBuf,
}

impl KeyFifo {
    pub(crate) fn new(run_dir: &Path) -> io::Result<Self> {
        let dir = run_dir.join(format!("{}.{}", process_name(), std::process::id()));
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;

        let path = dir.join("fifo");
        let _ = fs::remove_file(&path);
        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "FIFO path contains NUL"))?;
        // SAFETY: path_c is a valid NUL-terminated path.
        if unsafe { libc::mkfifo(path_c.as_ptr(), 0o600) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(KeyFifo { dir, path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KeyFifo {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

impl fmt::Debug for KeyFifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFifo").field("path", &self.path).finish()
    }
}

/// Writes `key` into the FIFO once, then closes it.
///
/// The write end of a FIFO cannot be opened until the child opens the read
/// end, so the open is retried non-blocking while the child is alive. If
/// the child exits without ever opening the FIFO, its exit status is
/// returned instead so the caller can classify the failure rather than
/// block forever.
pub(crate) fn write_key_to_fifo(
    child: &mut Child,
    fifo_path: &Path,
    key: &[u8],
) -> io::Result<Option<ExitStatus>> {
    loop {
        match fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(fifo_path)
        {
            Ok(mut writer) => {
                // SAFETY: the descriptor is owned by `writer`; restoring
                // blocking mode so write_all below behaves normally.
                unsafe {
                    let fd = writer.as_raw_fd();
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    if flags >= 0 {
                        libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
                    }
                }
                writer.write_all(key)?;
                return Ok(None);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if let Some(status) = child.try_wait()? {
                    return Ok(Some(status));
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
}

fn classify_exit(helper: &Path, status: ExitStatus) -> Result<(), AttachError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(AttachError::HelperFailed {
            helper: helper.to_path_buf(),
            status: code,
        }),
        None => Err(AttachError::HelperSignaled {
            helper: helper.to_path_buf(),
        }),
    }
}

/// Activates `volume_name` from `source_device_path` with `key`.
///
/// The key is handed to `systemd-cryptsetup attach` through a fresh FIFO
/// and `tries=1` is appended to the caller's option list, so the helper
/// makes exactly one attempt per invocation.
pub(crate) fn attach(
    paths: &HelperPaths,
    volume_name: &str,
    source_device_path: &str,
    key: &[u8],
    activate_options: &[String],
) -> Result<(), AttachError> {
    let mut options: Vec<String> = activate_options.to_vec();
    options.push("tries=1".to_string());
    let options = options.join(",");

    let fifo = KeyFifo::new(&paths.run_dir)?;

    log::debug!(
        "attaching {} from {} via {}",
        volume_name,
        source_device_path,
        paths.systemd_cryptsetup.display()
    );

    let mut child = Command::new(&paths.systemd_cryptsetup)
        .arg("attach")
        .arg(volume_name)
        .arg(source_device_path)
        .arg(fifo.path())
        .arg(&options)
        .spawn()?;

    let status = match write_key_to_fifo(&mut child, fifo.path(), key) {
        Ok(None) => child.wait()?,
        Ok(Some(status)) => status,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AttachError::Io(e));
        }
    };

    classify_exit(&paths.systemd_cryptsetup, status)
}

/// Prompts for a recovery key via `systemd-ask-password`.
///
/// Returns the first line of the helper's output, without the trailing
/// newline.
pub(crate) fn ask_recovery_passphrase(
    paths: &HelperPaths,
    source_device_path: &str,
) -> Result<String, AskPasswordError> {
    let id = format!("{}:{}", process_name(), source_device_path);
    let message = format!(
        "Please enter the recovery key for disk {}:",
        source_device_path
    );

    let output = Command::new(&paths.systemd_ask_password)
        .args(["--icon", "drive-harddisk", "--id"])
        .arg(&id)
        .arg(&message)
        .output()?;

    if !output.status.success() {
        return Err(AskPasswordError::Failed {
            helper: paths.systemd_ask_password.clone(),
            status: output.status,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.split('\n').next().unwrap_or_default().to_string())
}
