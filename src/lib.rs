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

//! NCI host engine
//!
//! Frames, sequences and multiplexes NCI messages exchanged with an NFC
//! controller, runs RF discovery, and adapts the session to a vendor HAL.

pub mod adaptation;
pub mod codec;
pub mod config;
pub mod connections;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hal;
pub mod lifecycle;
pub mod packets;
pub mod snoop;
pub mod state;
pub mod storage;
pub mod tracker;
pub mod transport;

pub use adaptation::{HalCallback, NfcAdaptation};
pub use config::{AdaptationConfig, EngineConfig, TechnologyMask};
pub use dispatcher::{Category, Event, Subscription};
pub use engine::{Engine, EngineBuilder, PreDiscover, ResponseHandle};
pub use error::{NciError, Result};
pub use hal::{HalEvent, HalStatus, NfcHal};
pub use lifecycle::{LifecycleEvent, Rendezvous};
pub use state::DiscoveryState;
pub use transport::Transport;
