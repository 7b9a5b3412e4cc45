//! Fuzz target for `FrameHeader::from_bytes`.
//!
//! Should never panic: every malformed or truncated byte sequence must
//! return an `Err`, never a crash, overflow, or over-read.

#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_proto::FrameHeader;

fuzz_target!(|data: &[u8]| {
    let _ = FrameHeader::from_bytes(data, FrameHeader::DEFAULT_MAX_CIPHERTEXT_LENGTH);
});
