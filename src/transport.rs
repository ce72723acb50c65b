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

//! Byte transport to the NFCC.

use crate::error::{NciError, Result};
use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Outbound half of the link to the NFCC. Inbound bytes are pushed into
/// the engine with [`crate::Engine::receive`].
pub trait Transport: Send + Sync {
    /// Send one serialized NCI packet.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// The session was closed.
    fn close(&self) {}

    /// Power cycle the NFCC.
    fn power_cycle(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the transport reopens asynchronously after a power cycle.
    /// If so, bring-up waits for it to call [`crate::Engine::open`].
    fn reopens_after_power_cycle(&self) -> bool {
        false
    }

    /// CORE_INIT succeeded with the given response payload.
    fn core_initialized(&self, _init_response: &[u8]) {}
}

/// Transport forwarding packets to a channel, drained by a writer task.
pub struct ChannelTransport {
    out_tx: UnboundedSender<Bytes>,
}

impl ChannelTransport {
    /// Create the transport and the receiving end of its channel.
    pub fn new() -> (Self, UnboundedReceiver<Bytes>) {
        let (out_tx, out_rx) = unbounded_channel();
        (ChannelTransport { out_tx }, out_rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.out_tx
            .send(Bytes::copy_from_slice(bytes))
            .map_err(|_| NciError::Transport("outgoing channel closed".into()))
    }
}
