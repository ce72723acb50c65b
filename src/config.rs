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

//! Engine and adaptation configuration.

use crate::packets::{RfTechnologyAndMode, MAX_PAYLOAD_SIZE};
use std::ops::BitOr;
use std::path::PathBuf;
use std::time::Duration;

/// Set of RF technologies and modes to run discovery with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TechnologyMask(pub u8);

impl TechnologyMask {
    /// No technology
    pub const NONE: Self = Self(0x00);
    /// NFC-A passive poll
    pub const POLL_A: Self = Self(0x01);
    /// NFC-B passive poll
    pub const POLL_B: Self = Self(0x02);
    /// NFC-F passive poll
    pub const POLL_F: Self = Self(0x04);
    /// NFC-V passive poll
    pub const POLL_V: Self = Self(0x08);
    /// NFC-A passive listen
    pub const LISTEN_A: Self = Self(0x10);
    /// NFC-B passive listen
    pub const LISTEN_B: Self = Self(0x20);
    /// NFC-F passive listen
    pub const LISTEN_F: Self = Self(0x40);
    /// Every supported technology
    pub const ALL: Self = Self(0x7f);

    const MODES: [(TechnologyMask, RfTechnologyAndMode); 7] = [
        (Self::POLL_A, RfTechnologyAndMode::NFC_A_PASSIVE_POLL),
        (Self::POLL_B, RfTechnologyAndMode::NFC_B_PASSIVE_POLL),
        (Self::POLL_F, RfTechnologyAndMode::NFC_F_PASSIVE_POLL),
        (Self::POLL_V, RfTechnologyAndMode::NFC_V_PASSIVE_POLL),
        (Self::LISTEN_A, RfTechnologyAndMode::NFC_A_PASSIVE_LISTEN),
        (Self::LISTEN_B, RfTechnologyAndMode::NFC_B_PASSIVE_LISTEN),
        (Self::LISTEN_F, RfTechnologyAndMode::NFC_F_PASSIVE_LISTEN),
    ];

    /// Whether no known technology bit is set. Unknown bits are ignored.
    pub fn is_empty(&self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(&self, other: TechnologyMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Discovery configuration entries for RF_DISCOVER_CMD.
    pub fn modes(&self) -> Vec<RfTechnologyAndMode> {
        Self::MODES.iter().filter(|(bit, _)| self.contains(*bit)).map(|(_, mode)| *mode).collect()
    }
}

impl BitOr for TechnologyMask {
    type Output = TechnologyMask;

    fn bitor(self, rhs: TechnologyMask) -> TechnologyMask {
        TechnologyMask(self.0 | rhs.0)
    }
}

/// Engine parameters.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Technologies used when discovery is started without an explicit mask
    pub technologies: TechnologyMask,
    /// How long to wait for a response
    pub command_timeout: Duration,
    /// Control packet transmit MTU before negotiation. Inbound packets are
    /// always accepted up to 255 bytes of payload.
    pub mtu: usize,
    /// Largest reassembled message accepted
    pub max_message_size: usize,
    /// Number of discovery results kept while discovering
    pub max_discovery_targets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            technologies: TechnologyMask::ALL,
            command_timeout: Duration::from_secs(2),
            mtu: MAX_PAYLOAD_SIZE,
            max_message_size: 65536,
            max_discovery_targets: 5,
        }
    }
}

impl EngineConfig {
    /// Set the default discovery technologies.
    pub fn with_technologies(mut self, technologies: TechnologyMask) -> Self {
        self.technologies = technologies;
        self
    }

    /// Set the response timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the control MTU. Values outside 1..=255 are clamped.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the reassembly limit.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set how many discovery results are kept.
    pub fn with_max_discovery_targets(mut self, n: usize) -> Self {
        self.max_discovery_targets = n;
        self
    }
}

/// Adaptation layer parameters.
#[derive(Clone, Debug)]
pub struct AdaptationConfig {
    /// Directory holding the stack's non-volatile storage
    pub storage_path: PathBuf,
    /// Keep storage files across start-ups
    pub preserve_storage: bool,
    /// Number of NFCEEs the platform supports
    pub max_ee_supported: u8,
    /// Number of packets kept for `dump`
    pub snoop_capacity: usize,
    /// Period of the timer worker
    pub tick_period: Duration,
    /// Engine parameters
    pub engine: EngineConfig,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        AdaptationConfig {
            storage_path: PathBuf::from("/data/nfc"),
            preserve_storage: false,
            max_ee_supported: 4,
            snoop_capacity: 256,
            tick_period: Duration::from_millis(5),
            engine: EngineConfig::default(),
        }
    }
}

impl AdaptationConfig {
    /// Set the storage directory.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Keep or clear storage files on initialization.
    pub fn with_preserve_storage(mut self, preserve: bool) -> Self {
        self.preserve_storage = preserve;
        self
    }

    /// Set the number of NFCEEs reported by `get_max_nfcee`.
    pub fn with_max_ee_supported(mut self, n: u8) -> Self {
        self.max_ee_supported = n;
        self
    }

    /// Set how many packets `dump` shows.
    pub fn with_snoop_capacity(mut self, n: usize) -> Self {
        self.snoop_capacity = n;
        self
    }

    /// Set the period of the timer worker.
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Set the engine parameters.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}
