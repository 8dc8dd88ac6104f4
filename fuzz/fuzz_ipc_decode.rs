//! Fuzz target for IPC line decoding.
//!
//! Run with: cargo +nightly fuzz run fuzz_ipc_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use llmlink_core::codec::{CodecError, decode_ipc, encode_ipc};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(message) = decode_ipc(line) {
        // Re-serialising can lengthen numbers (`1e2` becomes `100.0`).
        let encoded = match encode_ipc(&message) {
            Ok(encoded) => encoded,
            Err(CodecError::FrameTooLarge { .. }) => return,
            Err(e) => panic!("decoded message must encode: {e}"),
        };
        assert_eq!(encoded.matches('\n').count(), 1);
        assert_eq!(decode_ipc(&encoded).expect("round trip"), message);
    }
});
