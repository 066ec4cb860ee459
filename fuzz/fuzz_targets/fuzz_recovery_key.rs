//! Fuzzing target for recovery key parsing
//!
//! Tests the text codec against arbitrary input. A successful parse must
//! round-trip through the canonical form.

#![no_main]

use bootvault::RecoveryKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(key) = RecoveryKey::parse(input) {
            // Anything that parses must render and re-parse identically
            let canonical = key.to_string();
            let reparsed = RecoveryKey::parse(&canonical).unwrap();
            assert_eq!(key, reparsed);
        }
    }
});
