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

//! NCI segmentation and reassembly.
//!
//! Outbound messages are split into packets no larger than the transmit
//! MTU. Inbound bytes are buffered until whole packets are available, then
//! packets are reassembled per logical channel: one chain for control
//! messages and one per data connection.

use crate::error::{NciError, Result};
use crate::packets::{
    Channel, Message, MessageType, PacketBoundaryFlag, PacketHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use std::collections::HashMap;

/// A single NCI packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Packet header
    pub header: PacketHeader,
    /// Packet payload, at most one MTU
    pub payload: Bytes,
}

impl Fragment {
    /// Whether this is the last packet of its message.
    pub fn is_final(&self) -> bool {
        self.header.pbf == PacketBoundaryFlag::CompleteOrFinal
    }

    /// Serialize header and payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

fn clamp_mtu(mtu: usize) -> usize {
    mtu.clamp(1, MAX_PAYLOAD_SIZE)
}

/// Split a message into packets of at most `mtu` payload bytes.
pub fn encode_with_mtu(msg: &Message, mtu: usize) -> Vec<Fragment> {
    let mtu = clamp_mtu(mtu);
    let mut payload = msg.payload.clone();
    let mut fragments = Vec::with_capacity(payload.len() / mtu + 1);
    loop {
        let chunk = payload.split_to(payload.len().min(mtu));
        let pbf = if payload.is_empty() {
            PacketBoundaryFlag::CompleteOrFinal
        } else {
            PacketBoundaryFlag::Incomplete
        };
        fragments.push(Fragment {
            header: PacketHeader {
                mt: msg.mt,
                pbf,
                channel: msg.channel,
                payload_length: chunk.len() as u8,
            },
            payload: chunk,
        });
        if payload.is_empty() {
            break;
        }
    }
    fragments
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Chain {
    Control,
    Data(u8),
}

impl From<Channel> for Chain {
    fn from(channel: Channel) -> Chain {
        match channel {
            Channel::Control(_) => Chain::Control,
            Channel::Data { conn_id } => Chain::Data(conn_id),
        }
    }
}

struct Partial {
    mt: MessageType,
    channel: Channel,
    payload: BytesMut,
}

/// Stateful NCI framer.
pub struct Codec {
    tx_mtu: usize,
    rx_mtu: usize,
    max_message_size: usize,
    stream: BytesMut,
    // Bytes of an oversized packet still to be skipped.
    discard: usize,
    partial: HashMap<Chain, Partial>,
}

impl Codec {
    /// Create a codec segmenting outbound messages to `tx_mtu`. Inbound
    /// packets are accepted up to the largest NCI payload.
    pub fn new(tx_mtu: usize, max_message_size: usize) -> Codec {
        Codec {
            tx_mtu: clamp_mtu(tx_mtu),
            rx_mtu: MAX_PAYLOAD_SIZE,
            max_message_size,
            stream: BytesMut::new(),
            discard: 0,
            partial: HashMap::new(),
        }
    }

    /// Transmit MTU currently in effect.
    pub fn tx_mtu(&self) -> usize {
        self.tx_mtu
    }

    /// Apply a negotiated transmit MTU.
    pub fn set_tx_mtu(&mut self, mtu: usize) {
        self.tx_mtu = clamp_mtu(mtu);
    }

    /// Receive limit currently in effect.
    pub fn rx_mtu(&self) -> usize {
        self.rx_mtu
    }

    /// Reject inbound packets with a payload larger than `mtu`.
    pub fn set_rx_mtu(&mut self, mtu: usize) {
        self.rx_mtu = clamp_mtu(mtu);
    }

    /// Segment a message with the transmit MTU.
    pub fn encode(&self, msg: &Message) -> Vec<Fragment> {
        encode_with_mtu(msg, self.tx_mtu)
    }

    /// Buffer `bytes` and return the messages they complete.
    ///
    /// The returned iterator ends once the buffered bytes no longer form a
    /// whole packet; what remains is kept for the next call.
    pub fn ingest(&mut self, bytes: &[u8]) -> Decoded<'_> {
        self.stream.extend_from_slice(bytes);
        Decoded { codec: self }
    }

    /// Whether a message is partially reassembled.
    pub fn has_open_chain(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Drop all buffered state. Fails if a message was partially received.
    pub fn close(&mut self) -> Result<()> {
        let open = self.partial.len();
        self.reset();
        if open > 0 {
            return Err(NciError::Framing(format!("channel closed with {} open chain(s)", open)));
        }
        Ok(())
    }

    /// Drop all buffered state silently.
    pub fn reset(&mut self) {
        self.stream.clear();
        self.discard = 0;
        self.partial.clear();
    }

    fn next_message(&mut self) -> Option<Result<Message>> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.stream.len());
                let _ = self.stream.split_to(n);
                self.discard -= n;
                if self.discard > 0 {
                    return None;
                }
            }
            if self.stream.len() < HEADER_SIZE {
                return None;
            }
            let header = match PacketHeader::parse(&self.stream[..HEADER_SIZE]) {
                Ok(header) => header,
                Err(e) => {
                    // Nothing after an unparseable header can be trusted.
                    self.reset();
                    return Some(Err(e));
                }
            };
            let chain = Chain::from(header.channel);
            let length = header.payload_length as usize;
            if length > self.rx_mtu {
                self.discard = HEADER_SIZE + length;
                self.partial.remove(&chain);
                return Some(Err(NciError::Framing(format!(
                    "packet payload of {} bytes exceeds the receive limit of {}",
                    length, self.rx_mtu
                ))));
            }
            if self.stream.len() < HEADER_SIZE + length {
                return None;
            }
            if let Some(partial) = self.partial.get(&chain) {
                if partial.mt != header.mt || partial.channel != header.channel {
                    // The packet stays buffered and starts a new message.
                    let error = NciError::Framing(format!(
                        "continuation {:?} {:?} does not match open chain {:?} {:?}",
                        header.mt, header.channel, partial.mt, partial.channel
                    ));
                    self.partial.remove(&chain);
                    return Some(Err(error));
                }
            }
            let mut packet = self.stream.split_to(HEADER_SIZE + length);
            let payload = packet.split_off(HEADER_SIZE);
            let last = header.pbf == PacketBoundaryFlag::CompleteOrFinal;

            match self.partial.remove(&chain) {
                Some(mut partial) => {
                    partial.payload.unsplit(payload);
                    if partial.payload.len() > self.max_message_size {
                        return Some(Err(NciError::Framing(format!(
                            "reassembled message exceeds {} bytes",
                            self.max_message_size
                        ))));
                    }
                    if last {
                        return Some(Ok(Message {
                            mt: partial.mt,
                            channel: partial.channel,
                            payload: partial.payload.freeze(),
                        }));
                    }
                    self.partial.insert(chain, partial);
                }
                None if last => {
                    return Some(Ok(Message {
                        mt: header.mt,
                        channel: header.channel,
                        payload: payload.freeze(),
                    }));
                }
                None => {
                    debug!("start of segmented {:?} on {:?}", header.mt, header.channel);
                    let partial = Partial { mt: header.mt, channel: header.channel, payload };
                    self.partial.insert(chain, partial);
                }
            }
        }
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        if self.has_open_chain() {
            warn!("codec dropped with {} partial message(s)", self.partial.len());
        }
    }
}

/// Messages completed by one [`Codec::ingest`] call.
pub struct Decoded<'a> {
    codec: &'a mut Codec,
}

impl Iterator for Decoded<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.codec.next_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::Opcode;

    fn wire(fragments: &[Fragment]) -> Vec<u8> {
        fragments.iter().flat_map(|f| f.to_bytes().to_vec()).collect()
    }

    #[test]
    fn empty_payload_is_one_fragment() {
        let msg = Message::command(Opcode::CORE_INIT, Bytes::new());
        let fragments = encode_with_mtu(&msg, 32);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].to_bytes(), Bytes::from_static(&[0x20, 0x01, 0x00]));
    }

    #[test]
    fn segments_on_mtu_boundary() {
        let msg = Message::command(Opcode::CORE_SET_CONFIG, vec![0x5a; 64]);
        let fragments = encode_with_mtu(&msg, 32);
        assert_eq!(fragments.len(), 2);
        assert!(!fragments[0].is_final());
        assert!(fragments[1].is_final());
        assert_eq!(fragments[0].to_bytes()[0], 0x30);
        assert_eq!(fragments[1].to_bytes()[0], 0x20);
    }

    #[test]
    fn reassembles_across_chunks() {
        let msg = Message::response(Opcode::CORE_GET_CONFIG, (0..80u8).collect::<Vec<_>>());
        let bytes = wire(&encode_with_mtu(&msg, 32));
        let mut codec = Codec::new(32, 1024);
        let mut out = vec![];
        for chunk in bytes.chunks(7) {
            out.extend(codec.ingest(chunk).map(|r| r.unwrap()));
        }
        assert_eq!(out, vec![msg]);
        assert!(!codec.has_open_chain());
    }

    #[test]
    fn interleaved_data_and_control() {
        let data = Message::data(0, vec![1u8; 10]);
        let ntf = Message::notification(Opcode::CORE_CONN_CREDITS, vec![1, 0, 1]);
        let data_frags = encode_with_mtu(&data, 4);
        let mut bytes = wire(&data_frags[..1]);
        bytes.extend(wire(&encode_with_mtu(&ntf, 4)));
        bytes.extend(wire(&data_frags[1..]));
        let mut codec = Codec::new(4, 1024);
        let out: Vec<_> = codec.ingest(&bytes).map(|r| r.unwrap()).collect();
        assert_eq!(out, vec![ntf, data]);
    }

    #[test]
    fn oversized_fragment_is_skipped() {
        let mut codec = Codec::new(4, 1024);
        codec.set_rx_mtu(4);
        let mut bytes = vec![0x60, 0x07, 0x05, 1, 2, 3, 4, 5];
        bytes.extend([0x60, 0x07, 0x01, 0x03]);
        let out: Vec<_> = codec.ingest(&bytes).collect();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(NciError::Framing(_))));
        assert_eq!(out[1].as_ref().unwrap().payload, Bytes::from_static(&[3]));
    }

    #[test]
    fn mismatched_continuation_starts_a_new_message() {
        let mut codec = Codec::new(32, 1024);
        let bytes = [0x70, 0x03, 0x01, 0xaa, 0x60, 0x05, 0x01, 0xbb];
        let out: Vec<_> = codec.ingest(&bytes).collect();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(NciError::Framing(_))));
        assert_eq!(
            out[1].as_ref().unwrap(),
            &Message::notification(Opcode::CORE_CONN_CLOSE, vec![0xbb])
        );
        assert!(!codec.has_open_chain());
    }

    #[test]
    fn mismatched_segment_opens_its_own_chain() {
        let mut codec = Codec::new(32, 1024);
        let bytes = [0x70, 0x03, 0x01, 0xaa, 0x70, 0x05, 0x01, 0xbb, 0x60, 0x05, 0x01, 0xcc];
        let out: Vec<_> = codec.ingest(&bytes).collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_ref().unwrap().payload, Bytes::from_static(&[0xbb, 0xcc]));
    }

    #[test]
    fn receive_limit_is_independent_of_tx_mtu() {
        let mut codec = Codec::new(32, 1024);
        assert_eq!(codec.tx_mtu(), 32);
        assert_eq!(codec.rx_mtu(), MAX_PAYLOAD_SIZE);
        let mut bytes = vec![0x00, 0x00, 40];
        bytes.extend([0x5a; 40]);
        let out: Vec<_> = codec.ingest(&bytes).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().len(), 40);
    }

    #[test]
    fn message_size_limit() {
        let mut codec = Codec::new(4, 6);
        let bytes = [0x50, 0x00, 0x04, 1, 2, 3, 4, 0x50, 0x00, 0x04, 5, 6, 7, 8];
        let out: Vec<_> = codec.ingest(&bytes).collect();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(NciError::Framing(_))));
    }

    #[test]
    fn reserved_message_type_resyncs() {
        let mut codec = Codec::new(32, 1024);
        let out: Vec<_> = codec.ingest(&[0xe0, 0x00, 0x00, 0x60, 0x07, 0x01, 0x00]).collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
        assert_eq!(codec.ingest(&[0x60, 0x07, 0x01, 0x00]).count(), 1);
    }

    #[test]
    fn close_with_open_chain() {
        let mut codec = Codec::new(32, 1024);
        assert_eq!(codec.ingest(&[0x70, 0x03, 0x01, 0xaa]).count(), 0);
        assert!(codec.close().is_err());
        assert!(codec.close().is_ok());
    }

    #[test]
    fn negotiated_tx_mtu_is_clamped() {
        let mut codec = Codec::new(255, 1024);
        codec.set_tx_mtu(0);
        assert_eq!(codec.tx_mtu(), 1);
        codec.set_tx_mtu(1000);
        assert_eq!(codec.tx_mtu(), MAX_PAYLOAD_SIZE);
    }
}
