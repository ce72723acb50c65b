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

//! RF discovery state machine.

use crate::error::{NciError, Result};
use crate::packets::{Activation, DeactivationType, Deactivation, DiscoveryResult};
use log::{debug, info, warn};
use std::fmt;

/// Discovery state of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    /// The session has not been brought up.
    PreOpen,
    /// The NFCC is initialized, RF is off.
    Idle,
    /// RF discovery is running.
    Discovering,
    /// A remote endpoint was activated in poll mode.
    PollActive(Activation),
    /// The NFCC was activated by a remote reader in listen mode.
    ListenActive(Activation),
    /// Data is being exchanged with the activated endpoint.
    Transaction(Activation),
}

impl DiscoveryState {
    /// State name, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryState::PreOpen => "PreOpen",
            DiscoveryState::Idle => "Idle",
            DiscoveryState::Discovering => "Discovering",
            DiscoveryState::PollActive(_) => "PollActive",
            DiscoveryState::ListenActive(_) => "ListenActive",
            DiscoveryState::Transaction(_) => "Transaction",
        }
    }

    /// Activation parameters of the current RF link.
    pub fn activation(&self) -> Option<&Activation> {
        match self {
            DiscoveryState::PollActive(a)
            | DiscoveryState::ListenActive(a)
            | DiscoveryState::Transaction(a) => Some(a),
            _ => None,
        }
    }

    /// Whether an RF link is up.
    pub fn is_active(&self) -> bool {
        self.activation().is_some()
    }

    /// Whether the session has been brought up.
    pub fn is_open(&self) -> bool {
        *self != DiscoveryState::PreOpen
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side of the RF link the NFCC plays after activation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RfMode {
    /// The NFCC polled a remote endpoint.
    Poll,
    /// The NFCC was polled by a remote reader.
    Listen,
}

/// Owner of the discovery state. Every transition goes through here.
pub struct StateController {
    state: DiscoveryState,
    discovered: Vec<DiscoveryResult>,
    max_targets: usize,
}

impl StateController {
    /// Create a controller in `PreOpen`.
    pub fn new(max_targets: usize) -> StateController {
        StateController { state: DiscoveryState::PreOpen, discovered: vec![], max_targets }
    }

    /// Current state.
    pub fn state(&self) -> &DiscoveryState {
        &self.state
    }

    /// Endpoints reported since discovery started.
    pub fn discovered(&self) -> &[DiscoveryResult] {
        &self.discovered
    }

    fn invalid(&self, operation: &'static str) -> NciError {
        NciError::InvalidState { operation, state: self.state.name() }
    }

    fn set(&mut self, state: DiscoveryState) {
        if self.state.name() != state.name() {
            info!("{} -> {}", self.state, state);
        }
        self.state = state;
    }

    /// Bring-up may only start from `PreOpen`.
    pub fn check_open(&self) -> Result<()> {
        match self.state {
            DiscoveryState::PreOpen => Ok(()),
            _ => Err(self.invalid("open")),
        }
    }

    /// Bring-up finished.
    pub fn opened(&mut self) -> Result<()> {
        self.check_open()?;
        self.set(DiscoveryState::Idle);
        Ok(())
    }

    /// Back to `PreOpen`, forgetting everything.
    pub fn reset(&mut self) {
        self.discovered.clear();
        self.set(DiscoveryState::PreOpen);
    }

    /// Back to `Idle` if the session is open.
    pub fn fall_back_to_idle(&mut self) {
        if self.state.is_open() {
            self.discovered.clear();
            self.set(DiscoveryState::Idle);
        }
    }

    /// Discovery can be (re)started from `Idle` or `Discovering`.
    pub fn check_start_discovery(&self) -> Result<()> {
        match self.state {
            DiscoveryState::Idle | DiscoveryState::Discovering => Ok(()),
            _ => Err(self.invalid("start_discovery")),
        }
    }

    /// RF_DISCOVER_RSP was successful.
    pub fn discovery_started(&mut self) {
        self.discovered.clear();
        self.set(DiscoveryState::Discovering);
    }

    /// Discovery was stopped with an idle deactivation.
    pub fn discovery_stopped(&mut self) {
        self.discovered.clear();
        self.set(DiscoveryState::Idle);
    }

    /// Record an RF_DISCOVER_NTF. Returns false when the target list is full.
    pub fn on_discovery_result(&mut self, result: DiscoveryResult) -> Result<bool> {
        if self.state != DiscoveryState::Discovering {
            return Err(self.invalid("on_discovery_result"));
        }
        if self.discovered.len() >= self.max_targets {
            warn!(
                "dropping discovery result {}, {} targets already",
                result.discovery_id, self.max_targets
            );
            return Ok(false);
        }
        debug!("discovered {:?} with id {}", result.protocol, result.discovery_id);
        self.discovered.push(result);
        Ok(true)
    }

    /// A target may be selected among the collected discovery results.
    pub fn check_select(&self, discovery_id: u8) -> Result<()> {
        if self.state != DiscoveryState::Discovering || self.discovered.is_empty() {
            return Err(self.invalid("select_target"));
        }
        if !self.discovered.iter().any(|r| r.discovery_id == discovery_id) {
            return Err(NciError::InvalidParameter("unknown discovery id"));
        }
        Ok(())
    }

    /// RF_INTF_ACTIVATED_NTF.
    pub fn on_activation(&mut self, activation: Activation) -> Result<RfMode> {
        if self.state != DiscoveryState::Discovering {
            return Err(self.invalid("on_activation"));
        }
        self.discovered.clear();
        if activation.technology.is_listen() {
            self.set(DiscoveryState::ListenActive(activation));
            Ok(RfMode::Listen)
        } else {
            self.set(DiscoveryState::PollActive(activation));
            Ok(RfMode::Poll)
        }
    }

    /// Data started flowing on the active link. Returns true on transition.
    pub fn begin_transaction(&mut self) -> bool {
        match std::mem::replace(&mut self.state, DiscoveryState::PreOpen) {
            DiscoveryState::PollActive(a) | DiscoveryState::ListenActive(a) => {
                self.state = DiscoveryState::Transaction(a);
                debug!("-> Transaction");
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    /// A host deactivation can be requested while discovering or active.
    pub fn check_deactivate(&self) -> Result<()> {
        match self.state {
            DiscoveryState::Discovering => Ok(()),
            ref s if s.is_active() => Ok(()),
            _ => Err(self.invalid("deactivate")),
        }
    }

    /// RF_DEACTIVATE_NTF.
    pub fn on_deactivation(&mut self, deactivation: &Deactivation) -> Result<()> {
        if !self.state.is_active() {
            return Err(self.invalid("on_deactivation"));
        }
        debug!("deactivated: {:?} ({:?})", deactivation.kind, deactivation.reason);
        match deactivation.kind {
            DeactivationType::IdleMode => self.set(DiscoveryState::Idle),
            DeactivationType::SleepMode
            | DeactivationType::SleepAfMode
            | DeactivationType::Discovery => self.set(DiscoveryState::Discovering),
        }
        Ok(())
    }
}
