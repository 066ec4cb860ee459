//! Fuzzing target for key data deserialization
//!
//! Key data is read from disk at early boot, so the decoder must hold up
//! against arbitrary byte sequences.

#![no_main]

use bootvault::KeyData;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(kd) = KeyData::read_from(data) {
        // If decoding succeeds, the accessors and the write path must not
        // panic, and a rewrite must decode to the same value.
        let _ = kd.id();
        let _ = kd.platform_name();
        let _ = kd.sealed_blob();

        let mut buf = Vec::new();
        kd.write_to(&mut buf).unwrap();
        let rewritten = KeyData::read_from(buf.as_slice()).unwrap();
        assert_eq!(kd, rewritten);
    }
});
