// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use nci::codec::{encode_with_mtu, Codec};
use nci::packets::{Message, Opcode};
use proptest::prelude::*;

fn message() -> impl Strategy<Value = Message> {
    let payload = prop::collection::vec(any::<u8>(), 0..700);
    prop_oneof![
        (0u8..0x10, 0u8..0x40, payload.clone())
            .prop_map(|(gid, oid, p)| Message::command(Opcode::new(gid, oid), p)),
        (0u8..0x10, 0u8..0x40, payload.clone())
            .prop_map(|(gid, oid, p)| Message::notification(Opcode::new(gid, oid), p)),
        (0u8..0x10, payload).prop_map(|(conn_id, p)| Message::data(conn_id, p)),
    ]
}

proptest! {
    // Every fragment fits the MTU, only the last one is final, and the
    // fragments reassemble into the original message.
    #[test]
    fn segmentation_round_trip(msg in message(), mtu in 1usize..=255) {
        let fragments = encode_with_mtu(&msg, mtu);
        prop_assert!(!fragments.is_empty());
        for (i, fragment) in fragments.iter().enumerate() {
            prop_assert!(fragment.payload.len() <= mtu);
            prop_assert_eq!(fragment.is_final(), i == fragments.len() - 1);
        }
        let mut codec = Codec::new(mtu, 4096);
        let wire: Vec<u8> = fragments.iter().flat_map(|f| f.to_bytes().to_vec()).collect();
        let decoded: Vec<_> = codec.ingest(&wire).collect();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(decoded[0].as_ref().ok(), Some(&msg));
        prop_assert!(!codec.has_open_chain());
    }

    // Reassembly does not depend on how the byte stream is chunked.
    #[test]
    fn arbitrary_chunking(msgs in prop::collection::vec(message(), 1..4), chunk in 1usize..64) {
        let wire: Vec<u8> = msgs
            .iter()
            .flat_map(|m| encode_with_mtu(m, 64))
            .flat_map(|f| f.to_bytes().to_vec())
            .collect();
        let mut codec = Codec::new(64, 4096);
        let mut decoded = vec![];
        for piece in wire.chunks(chunk) {
            for item in codec.ingest(piece) {
                decoded.push(item.unwrap());
            }
        }
        prop_assert_eq!(decoded, msgs);
    }

    // Garbage never panics the decoder.
    #[test]
    fn random_bytes_do_not_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut codec = Codec::new(255, 1024);
        let _ = codec.ingest(&bytes).count();
        codec.reset();
        prop_assert!(!codec.has_open_chain());
    }
}
