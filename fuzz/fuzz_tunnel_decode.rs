//! Fuzz target for tunnel frame decoding.
//!
//! Run with: cargo +nightly fuzz run fuzz_tunnel_decode
//!
//! Frames come straight off the relay socket, so decoding must never panic.
//! Whatever decodes must survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use llmlink_core::codec::{TunnelKind, decode_tunnel, encode_tunnel};

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(message) = decode_tunnel(frame) else {
        return;
    };
    assert!(!message.id.is_empty());
    if message.kind == TunnelKind::Request {
        let _ = message.relay_request();
    }
    let encoded = encode_tunnel(&message).expect("decoded message must encode");
    let again = decode_tunnel(&encoded).expect("encoded message must decode");
    assert_eq!(again.kind, message.kind);
    assert_eq!(again.id, message.id);
});
