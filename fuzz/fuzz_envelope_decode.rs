//! Fuzz target for the request envelope decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_envelope_decode
//!
//! This exercises `decode_request()` with arbitrary byte sequences to find
//! panics, hangs, or memory issues in the JSON envelope discrimination path.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // We don't care about the result — just that it doesn't panic
    let _ = loopbridge_core::ipc::envelope::decode_request(data);
    let _ = loopbridge_core::ipc::envelope::decode_response(data);
    let _ = loopbridge_core::ipc::envelope::peek_id(data);
});
