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

//! Routing of notifications and data to registered sinks.

use crate::error::Result;
use crate::packets::{
    parse_conn_credits, parse_generic_error, parse_interface_error, Activation, Channel,
    Deactivation, DiscoveryResult, Message, MessageType, Opcode, ResetNotification, Status,
};
use crate::state::DiscoveryState;
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Notification categories a sink can subscribe to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// CORE_RESET_NTF outside of bring-up
    DeviceReset,
    /// CORE_GENERIC_ERROR_NTF and CORE_INTERFACE_ERROR_NTF
    GenericError,
    /// RF_DISCOVER_NTF
    DiscoveryResult,
    /// RF_INTF_ACTIVATED_NTF
    Activation,
    /// RF_DEACTIVATE_NTF
    Deactivation,
    /// Data received on a logical connection
    ConnectionData,
    /// Notifications of the proprietary group
    Proprietary,
}

impl Category {
    /// Whether events of this category can legitimately occur in `state`.
    pub fn is_legal_in(&self, state: &DiscoveryState) -> bool {
        match self {
            Category::DeviceReset | Category::GenericError | Category::Proprietary => true,
            Category::DiscoveryResult | Category::Activation => {
                *state == DiscoveryState::Discovering
            }
            Category::Deactivation | Category::ConnectionData => state.is_active(),
        }
    }
}

/// An inbound notification or data message, decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The NFCC reset
    Reset(ResetNotification),
    /// The NFCC reported an error unrelated to any command
    GenericError(Status),
    /// The NFCC reported an error on a logical connection
    InterfaceError {
        /// Error status
        status: Status,
        /// Affected connection
        conn_id: u8,
    },
    /// A remote endpoint was discovered
    Discovered(DiscoveryResult),
    /// An RF interface was activated
    Activated(Activation),
    /// The RF interface was deactivated
    Deactivated(Deactivation),
    /// The NFCC returned flow control credits
    Credits(Vec<(u8, u8)>),
    /// Data received on a logical connection
    Data {
        /// Logical connection
        conn_id: u8,
        /// Reassembled payload
        payload: Bytes,
    },
    /// Proprietary notification, passed through untouched
    Proprietary(Message),
}

impl Event {
    /// Decode a notification or data message. Returns `None` for
    /// notifications the engine does not know about.
    pub fn parse(msg: &Message) -> Result<Option<Event>> {
        let opcode = match (msg.mt, msg.channel) {
            (MessageType::Data, Channel::Data { conn_id }) => {
                return Ok(Some(Event::Data { conn_id, payload: msg.payload.clone() }))
            }
            (MessageType::Notification, Channel::Control(opcode)) => opcode,
            _ => return Ok(None),
        };
        let p = &msg.payload[..];
        Ok(Some(match opcode {
            Opcode::CORE_RESET => Event::Reset(ResetNotification::parse(p)?),
            Opcode::CORE_GENERIC_ERROR => Event::GenericError(parse_generic_error(p)?),
            Opcode::CORE_INTERFACE_ERROR => {
                let (status, conn_id) = parse_interface_error(p)?;
                Event::InterfaceError { status, conn_id }
            }
            Opcode::CORE_CONN_CREDITS => Event::Credits(parse_conn_credits(p)?),
            Opcode::RF_DISCOVER => Event::Discovered(DiscoveryResult::parse(p)?),
            Opcode::RF_INTF_ACTIVATED => Event::Activated(Activation::parse(p)?),
            Opcode::RF_DEACTIVATE => Event::Deactivated(Deactivation::parse(p)?),
            op if op.is_proprietary() => Event::Proprietary(msg.clone()),
            _ => return Ok(None),
        }))
    }

    /// Category subscribers register for. Credits are consumed internally.
    pub fn category(&self) -> Option<Category> {
        Some(match self {
            Event::Reset(_) => Category::DeviceReset,
            Event::GenericError(_) | Event::InterfaceError { .. } => Category::GenericError,
            Event::Discovered(_) => Category::DiscoveryResult,
            Event::Activated(_) => Category::Activation,
            Event::Deactivated(_) => Category::Deactivation,
            Event::Data { .. } => Category::ConnectionData,
            Event::Proprietary(_) => Category::Proprietary,
            Event::Credits(_) => return None,
        })
    }
}

/// Receiver of the events of one category.
pub type EventSink = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    category: Category,
    id: u64,
}

impl Subscription {
    /// Subscribed category.
    pub fn category(&self) -> Category {
        self.category
    }
}

/// Why an event was not delivered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dispatched {
    /// The sink was invoked
    Delivered,
    /// The event is consumed by the engine itself
    Internal,
    /// Nobody subscribed to the category
    NoSink,
    /// The event cannot occur in the current state
    Illegal,
}

/// Holds at most one sink per category.
#[derive(Default)]
pub struct Dispatcher {
    sinks: HashMap<Category, (u64, EventSink)>,
    next_id: u64,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the sink for a category, replacing the previous one.
    pub fn subscribe(&mut self, category: Category, sink: EventSink) -> Subscription {
        self.next_id += 1;
        if self.sinks.insert(category, (self.next_id, sink)).is_some() {
            debug!("sink for {:?} replaced", category);
        }
        Subscription { category, id: self.next_id }
    }

    /// Remove a registration. Superseded handles are ignored.
    pub fn unsubscribe(&mut self, subscription: &Subscription) -> bool {
        match self.sinks.get(&subscription.category) {
            Some((id, _)) if *id == subscription.id => {
                self.sinks.remove(&subscription.category);
                true
            }
            _ => false,
        }
    }

    /// Find the sink for `event`, without invoking it.
    pub fn route(
        &self,
        state: &DiscoveryState,
        event: &Event,
    ) -> std::result::Result<EventSink, Dispatched> {
        let category = event.category().ok_or(Dispatched::Internal)?;
        if !category.is_legal_in(state) {
            return Err(Dispatched::Illegal);
        }
        self.sinks.get(&category).map(|(_, sink)| sink.clone()).ok_or(Dispatched::NoSink)
    }

    /// Deliver `event` to its sink.
    pub fn dispatch(&self, state: &DiscoveryState, event: &Event) -> Dispatched {
        match self.route(state, event) {
            Ok(sink) => {
                sink(event);
                Dispatched::Delivered
            }
            Err(reason) => {
                debug!("{:?} not delivered in {}: {:?}", event.category(), state, reason);
                reason
            }
        }
    }
}
