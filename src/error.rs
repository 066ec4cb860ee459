// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Activation error types and per-attempt diagnostics.
//!
//! The activation state machine never gives up on the first failure; it
//! accumulates one [`AttemptFailure`] per unsuccessful platform-protected
//! attempt and only renders them (bulletised, in attempt order) if the
//! recovery-key fallback also fails. The structured records are kept on
//! the error so callers and tests can inspect them field-wise instead of
//! parsing the composite message.

use crate::cryptsetup::{AskPasswordError, AttachError};
use crate::keydata::KeyId;
use crate::platform::PlatformHandlerError;
use crate::recovery::RecoveryKeyParseError;
use std::fmt;
use thiserror::Error;

/// Result alias for volume activation operations.
pub type Result<T, E = ActivateError> = std::result::Result<T, E>;

/// Classification of one failed activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptErrorKind {
    /// The platform's secure device was unavailable.
    PlatformUnavailable,
    /// The platform's secure device was not provisioned.
    PlatformUninitialized,
    /// The platform rejected the sealed key data.
    PlatformInvalidKey,
    /// Any other platform handler failure.
    PlatformOther,
    /// The recovered key matched no keyslot (helper exit status 5).
    AttachRejected,
    /// The attach helper failed for another reason.
    AttachFailed,
}

impl AttemptErrorKind {
    fn is_recover_failure(self) -> bool {
        matches!(
            self,
            AttemptErrorKind::PlatformUnavailable
                | AttemptErrorKind::PlatformUninitialized
                | AttemptErrorKind::PlatformInvalidKey
                | AttemptErrorKind::PlatformOther
        )
    }
}

/// One unsuccessful platform-protected activation attempt.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// Identity of the key data the attempt used.
    pub key_id: KeyId,
    /// What went wrong.
    pub kind: AttemptErrorKind,
    /// Human-readable cause, already rendered by its source.
    pub cause: String,
}

impl AttemptFailure {
    pub(crate) fn from_recover_error(key_id: KeyId, err: &PlatformHandlerError) -> Self {
        let kind = match err {
            PlatformHandlerError::Unavailable(_) => AttemptErrorKind::PlatformUnavailable,
            PlatformHandlerError::Uninitialized(_) => AttemptErrorKind::PlatformUninitialized,
            PlatformHandlerError::InvalidKey(_) => AttemptErrorKind::PlatformInvalidKey,
            PlatformHandlerError::Other(_) => AttemptErrorKind::PlatformOther,
        };
        AttemptFailure {
            key_id,
            kind,
            cause: err.to_string(),
        }
    }

    pub(crate) fn from_attach_error(key_id: KeyId, err: &AttachError) -> Self {
        let kind = if err.is_key_mismatch() {
            AttemptErrorKind::AttachRejected
        } else {
            AttemptErrorKind::AttachFailed
        };
        AttemptFailure {
            key_id,
            kind,
            cause: err.to_string(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_recover_failure() {
            write!(f, "{}: cannot recover key: {}", self.key_id, self.cause)
        } else {
            write!(f, "{}: cannot activate volume: {}", self.key_id, self.cause)
        }
    }
}

fn render_composite(attempts: &[AttemptFailure], recovery_error: &ActivateError) -> String {
    let mut out = String::from("cannot activate with platform protected keys:\n");
    for attempt in attempts {
        out.push_str(&format!("- {}\n", attempt));
    }
    out.push_str(&format!(
        "and activation with recovery key failed: {}",
        recovery_error
    ));
    out
}

/// Errors from volume activation.
#[derive(Debug, Error)]
pub enum ActivateError {
    /// `ActivateVolumeOptions::recovery_key_tries` was negative.
    #[error("invalid RecoveryKeyTries")]
    InvalidRecoveryKeyTries,

    /// The recovery fallback was reached with a try budget of zero.
    #[error("no recovery key tries permitted")]
    NoRecoveryKeyTriesPermitted,

    /// The caller's activate options contained a `tries=` entry, which is
    /// reserved for the driver.
    #[error("cannot specify the \"tries=\" option for systemd-cryptsetup")]
    ReservedActivateOption,

    /// An entered recovery key did not decode.
    #[error("cannot decode recovery key: {0}")]
    DecodeRecoveryKey(#[from] RecoveryKeyParseError),

    /// The attach helper rejected the key or failed outright.
    #[error("cannot activate volume: {0}")]
    ActivateVolume(#[from] AttachError),

    /// A recovery-key candidate could not be obtained from the prompt
    /// helper.
    #[error("cannot obtain recovery key: {0}")]
    ObtainRecoveryKey(#[from] AskPasswordError),

    /// Every avenue failed: all platform-protected attempts, then the
    /// recovery-key fallback.
    #[error("{}", render_composite(.attempts, .recovery_error))]
    WithPlatformKeys {
        /// The failed platform-protected attempts, in input order.
        attempts: Vec<AttemptFailure>,
        /// Why the recovery fallback failed.
        recovery_error: Box<ActivateError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_tokens() {
        assert_eq!(
            ActivateError::InvalidRecoveryKeyTries.to_string(),
            "invalid RecoveryKeyTries"
        );
        assert_eq!(
            ActivateError::NoRecoveryKeyTriesPermitted.to_string(),
            "no recovery key tries permitted"
        );
        assert_eq!(
            ActivateError::ReservedActivateOption.to_string(),
            "cannot specify the \"tries=\" option for systemd-cryptsetup"
        );
    }

    #[test]
    fn test_decode_wrapping() {
        let err = ActivateError::DecodeRecoveryKey(RecoveryKeyParseError::InsufficientCharacters);
        assert_eq!(
            err.to_string(),
            "cannot decode recovery key: incorrectly formatted: insufficient characters"
        );
    }

    #[test]
    fn test_attempt_failure_rendering() {
        let recover = AttemptFailure::from_recover_error(
            KeyId::new("foo", 2),
            &PlatformHandlerError::Unavailable("the platform device is unavailable".into()),
        );
        assert_eq!(recover.kind, AttemptErrorKind::PlatformUnavailable);
        assert_eq!(
            recover.to_string(),
            "foo@2: cannot recover key: the platform's secure device is unavailable: \
             the platform device is unavailable"
        );

        let attach = AttemptFailure::from_attach_error(
            KeyId::new("bar", 7),
            &AttachError::HelperFailed {
                helper: "/lib/systemd/systemd-cryptsetup".into(),
                status: 5,
            },
        );
        assert_eq!(attach.kind, AttemptErrorKind::AttachRejected);
        assert_eq!(
            attach.to_string(),
            "bar@7: cannot activate volume: /lib/systemd/systemd-cryptsetup failed: exit status 5"
        );
    }

    #[test]
    fn test_composite_rendering() {
        let err = ActivateError::WithPlatformKeys {
            attempts: vec![AttemptFailure::from_recover_error(
                KeyId::new("foo", 2),
                &PlatformHandlerError::Unavailable("the platform device is unavailable".into()),
            )],
            recovery_error: Box::new(ActivateError::NoRecoveryKeyTriesPermitted),
        };
        assert_eq!(
            err.to_string(),
            "cannot activate with platform protected keys:\n\
             - foo@2: cannot recover key: the platform's secure device is unavailable: \
             the platform device is unavailable\n\
             and activation with recovery key failed: no recovery key tries permitted"
        );
    }

    #[test]
    fn test_composite_preserves_attempt_order() {
        let err = ActivateError::WithPlatformKeys {
            attempts: vec![
                AttemptFailure::from_recover_error(
                    KeyId::new("foo", 2),
                    &PlatformHandlerError::Unavailable(
                        "the platform device is unavailable".into(),
                    ),
                ),
                AttemptFailure::from_recover_error(
                    KeyId::new("bar", 7),
                    &PlatformHandlerError::Unavailable(
                        "the platform device is unavailable".into(),
                    ),
                ),
            ],
            recovery_error: Box::new(ActivateError::NoRecoveryKeyTriesPermitted),
        };
        let rendered = err.to_string();
        let foo = rendered.find("- foo@2").unwrap();
        let bar = rendered.find("- bar@7").unwrap();
        assert!(foo < bar);
    }
}
