//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data)
        && let Ok(config) = llmlink_config::AppConfig::parse(s)
    {
        // Anything that validated must yield usable timings.
        assert!(!config.tunnel.heartbeat_interval().is_zero());
        assert!(config.tunnel.reconnect_base_delay() <= config.tunnel.reconnect_max_delay());
    }
});
