//! Fuzz target for the response decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_value_decode
//!
//! Whatever the daemon sends, decoding must return (value or error) without
//! panicking, and the jail extractor must cope with any decoded tree.

#![no_main]

use f2b_exporter_core::protocol::status::{parse_jail, parse_jail_names};
use f2b_exporter_core::protocol::value::decode;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = decode(data) {
        let _ = parse_jail_names(&value);
        let _ = parse_jail("fuzz", &value);
    }
});
