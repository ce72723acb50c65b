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

//! Logical connections and their credit based flow control.

use crate::codec::{encode_with_mtu, Fragment};
use crate::error::{NciError, Result};
use crate::packets::Message;
use bytes::Bytes;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};

/// Static RF connection, opened on RF interface activation.
pub const STATIC_RF_CONN_ID: u8 = 0;
/// Static HCI connection.
pub const STATIC_HCI_CONN_ID: u8 = 1;
/// Credit value meaning the NFCC does not use flow control.
pub const CREDITS_UNLIMITED: u8 = 0xff;

/// Parameters of a logical connection
struct ConnectionParameters {
    max_payload_size: u8,
    nfcc_credits_avail: u8,
    sendq: VecDeque<Fragment>,
}

impl ConnectionParameters {
    /// Pop the packets the available credits allow to send.
    fn drain(&mut self) -> Vec<Fragment> {
        if self.nfcc_credits_avail == CREDITS_UNLIMITED {
            return self.sendq.drain(..).collect();
        }
        let n = self.sendq.len().min(self.nfcc_credits_avail as usize);
        self.nfcc_credits_avail -= n as u8;
        self.sendq.drain(..n).collect()
    }
}

/// To keep track of currently open logical connections
#[derive(Default)]
pub struct LogicalConnections {
    conns: HashMap<u8, ConnectionParameters>,
}

impl LogicalConnections {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a logical connection, replacing any previous one with the same id.
    pub fn open(&mut self, conn_id: u8, max_payload_size: u8, nfcc_credits_avail: u8) {
        let params = ConnectionParameters {
            max_payload_size: max_payload_size.max(1),
            nfcc_credits_avail,
            sendq: VecDeque::new(),
        };
        if self.conns.insert(conn_id, params).is_some() {
            warn!("logical connection {} reopened", conn_id);
        }
        debug!("conn {} open, mtu {}, credits {}", conn_id, max_payload_size, nfcc_credits_avail);
    }

    /// Close a logical connection, dropping its queued packets.
    pub fn close(&mut self, conn_id: u8) -> bool {
        match self.conns.remove(&conn_id) {
            Some(params) => {
                if !params.sendq.is_empty() {
                    debug!("conn {} closed with {} queued packet(s)", conn_id, params.sendq.len());
                }
                true
            }
            None => false,
        }
    }

    /// Close every connection.
    pub fn clear(&mut self) {
        self.conns.clear();
    }

    /// Whether the connection exists.
    pub fn is_open(&self, conn_id: u8) -> bool {
        self.conns.contains_key(&conn_id)
    }

    /// Number of packets waiting for credits.
    pub fn queued(&self, conn_id: u8) -> usize {
        self.conns.get(&conn_id).map(|c| c.sendq.len()).unwrap_or(0)
    }

    /// Add credits to a logical connection and return what may now be sent.
    pub fn add_credits(&mut self, conn_id: u8, ncreds: u8) -> Vec<Fragment> {
        match self.conns.get_mut(&conn_id) {
            Some(params) => {
                if params.nfcc_credits_avail != CREDITS_UNLIMITED {
                    params.nfcc_credits_avail =
                        params.nfcc_credits_avail.saturating_add(ncreds).min(CREDITS_UNLIMITED - 1);
                }
                params.drain()
            }
            None => {
                debug!("credits for unknown conn {}", conn_id);
                vec![]
            }
        }
    }

    /// Queue a payload on a connection, split to its MTU, and return what
    /// may be sent right away.
    pub fn send(&mut self, conn_id: u8, payload: Bytes) -> Result<Vec<Fragment>> {
        let params = self
            .conns
            .get_mut(&conn_id)
            .ok_or(NciError::InvalidParameter("no such logical connection"))?;
        let msg = Message::data(conn_id, payload);
        params.sendq.extend(encode_with_mtu(&msg, params.max_payload_size as usize));
        Ok(params.drain())
    }
}
