//! Fuzz target for `packet_proto::decode_tagged`, the `SerializableHeader`
//! + `MessageCatalog` dispatch path every inbound plaintext frame body goes
//! through after decryption.
//!
//! Should never panic: malformed bodies, truncated fields, and unknown type
//! tags must all surface as `Err`.

#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_proto::{MessageCatalog, decode_tagged};

fuzz_target!(|data: &[u8]| {
    let catalog = MessageCatalog::with_defaults();
    let _ = decode_tagged(data, &catalog);
});
