//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `AppConfig::parse()`. Any config that parses must
//! also survive the derived accessors the exporter calls at startup.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = f2b_exporter_config::AppConfig::parse(s) {
        assert!(config.web.socket_addr().is_ok());
        let _ = config.reconnect.max_interval();
        let _ = config.socket.read_timeout();
    }
});
