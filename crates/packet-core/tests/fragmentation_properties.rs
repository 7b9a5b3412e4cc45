//! Property: for any message whose serialized form exceeds
//! `max_fragment_payload`, piping it through the outgoing fragment filter
//! then the incoming reassembly filter recovers the original message
//! bit-exact, regardless of the chosen payload limit or host-id length.

use bytes::Bytes;
use packet_core::fragmentation::{ReassemblyBuffer, fragment_message};
use packet_proto::{DataPacket, Message, MessageCatalog};
use proptest::prelude::*;

proptest! {
    #[test]
    fn fragmentation_round_trips(
        host_id in "[A-Za-z0-9]{1,16}",
        payload in prop::collection::vec(any::<u8>(), 0..8192),
        max_fragment_payload in 16usize..512,
    ) {
        let message: Message = DataPacket {
            host_id,
            chunk_index: 1,
            chunk_count: 1,
            bytes: Bytes::from(payload),
        }
        .into();

        let fragments = fragment_message(&message, max_fragment_payload);

        let catalog = MessageCatalog::with_defaults();
        let mut reassembly = ReassemblyBuffer::new();
        let mut recovered = None;
        for fragment in fragments {
            if let Some(complete) = reassembly.feed(fragment, &catalog).expect("consistent fragment run") {
                prop_assert!(recovered.is_none(), "reassembly yielded more than one complete message");
                recovered = Some(complete);
            }
        }

        prop_assert_eq!(recovered, Some(message));
    }
}
