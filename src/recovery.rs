// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Bootvault Contributors
//! Recovery key representation and its human-enterable text form.
//!
//! A recovery key is a 128-bit secret that unlocks a volume independently
//! of the platform's secure device. Its text form is eight groups of five
//! decimal digits, each group encoding two bytes as a big-endian 16-bit
//! word:
//!
//! ```text
//! 61665-00531-54469-09783-47273-19035-40077-28287
//! ```
//!
//! Parsing accepts the canonical hyphenated form as well as the bare
//! 40-digit form, so a key can be typed with or without separators.

use rand::rngs::OsRng;
use rand_core::TryRngCore;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Number of bytes in a recovery key.
pub const RECOVERY_KEY_SIZE: usize = 16;

const GROUPS: usize = 8;
const GROUP_DIGITS: usize = 5;

/// Errors produced when decoding the text form of a recovery key.
///
/// All variants render under the stable `incorrectly formatted:` prefix so
/// callers can surface them to users verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryKeyParseError {
    /// Fewer than 40 decimal digits were supplied.
    #[error("incorrectly formatted: insufficient characters")]
    InsufficientCharacters,

    /// More than 40 decimal digits were supplied.
    #[error("incorrectly formatted: too many characters")]
    TooManyCharacters,

    /// A group contains something other than decimal digits. The offending
    /// 5-character group is reported.
    #[error("incorrectly formatted: invalid syntax: {0:?}")]
    InvalidSyntax(String),

    /// A group encodes a value outside the 16-bit range.
    #[error("incorrectly formatted: group {0:?} out of range")]
    OutOfRange(String),
}

/// A 128-bit volume recovery key.
///
/// The in-memory representation is zeroised on drop. The [`fmt::Display`]
/// implementation renders the canonical hyphenated form; [`FromStr`] and
/// [`RecoveryKey::parse`] accept both the hyphenated and the bare form.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; RECOVERY_KEY_SIZE]);

impl RecoveryKey {
    /// Creates a recovery key from raw bytes.
    pub fn from_bytes(bytes: [u8; RECOVERY_KEY_SIZE]) -> Self {
        RecoveryKey(bytes)
    }

    /// Generates a fresh recovery key from the operating system RNG.
    pub fn generate() -> std::io::Result<Self> {
        let mut bytes = [0u8; RECOVERY_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(RecoveryKey(bytes))
    }

    /// Returns the raw key material.
    pub fn as_bytes(&self) -> &[u8; RECOVERY_KEY_SIZE] {
        &self.0
    }

    /// Decodes the text form of a recovery key.
    ///
    /// Eight groups of five decimal digits are expected. A single `-` is
    /// permitted (but not required) between any two groups; the formatted
    /// key must not begin or end with one. Each group must encode a value
    /// in the 16-bit range.
    ///
    /// # Errors
    ///
    /// Returns a [`RecoveryKeyParseError`] describing the first defect
    /// encountered. Nothing about the partially parsed input is preserved
    /// on failure.
    pub fn parse(s: &str) -> Result<Self, RecoveryKeyParseError> {
        let mut rest = s.as_bytes();
        let mut out = [0u8; RECOVERY_KEY_SIZE];

        for i in 0..GROUPS {
            if rest.len() < GROUP_DIGITS {
                return Err(RecoveryKeyParseError::InsufficientCharacters);
            }
            let (group, tail) = rest.split_at(GROUP_DIGITS);

            let mut word: u32 = 0;
            for &b in group {
                if !b.is_ascii_digit() {
                    return Err(RecoveryKeyParseError::InvalidSyntax(
                        String::from_utf8_lossy(group).into_owned(),
                    ));
                }
                word = word * 10 + u32::from(b - b'0');
            }
            if word > u32::from(u16::MAX) {
                return Err(RecoveryKeyParseError::OutOfRange(
                    String::from_utf8_lossy(group).into_owned(),
                ));
            }

            out[i * 2..i * 2 + 2].copy_from_slice(&(word as u16).to_be_bytes());

            rest = tail;
            // Permit a separator between groups, but not a trailing one.
            if rest.len() > 1 && rest[0] == b'-' {
                rest = &rest[1..];
            }
        }

        if !rest.is_empty() {
            return Err(RecoveryKeyParseError::TooManyCharacters);
        }

        Ok(RecoveryKey(out))
    }
}

impl From<[u8; RECOVERY_KEY_SIZE]> for RecoveryKey {
    fn from(bytes: [u8; RECOVERY_KEY_SIZE]) -> Self {
        RecoveryKey(bytes)
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..GROUPS {
            if i > 0 {
                f.write_str("-")?;
            }
            let word = u16::from_be_bytes([self.0[i * 2], self.0[i * 2 + 1]]);
            write!(f, "{:05}", word)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of debug output.
        f.write_str("RecoveryKey(..)")
    }
}

impl FromStr for RecoveryKey {
    type Err = RecoveryKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecoveryKey::parse(s)
    }
}
