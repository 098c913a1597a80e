//! Fuzz target for the frame splitter.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_split
//!
//! Feeds arbitrary byte soup through `extract_frame()` until it stops
//! yielding, checking the splitter never panics and always consumes what
//! it returns.

#![no_main]

use libfuzzer_sys::fuzz_target;

use loopbridge_core::ipc::framing::extract_frame;

fuzz_target!(|data: &[u8]| {
    let mut buf = data.to_vec();
    let mut consumed = 0usize;
    while let Some(frame) = extract_frame(&mut buf) {
        consumed += frame.len() + 2;
        assert!(consumed <= data.len());
    }
});
