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

//! NFC Hardware Abstraction Layer vocabulary
//! and the interface of the vendor HAL

use crate::adaptation::HalCallback;
use crate::error::{NciError, Result};
use crate::packets::Status;
use num_derive::{FromPrimitive, ToPrimitive};

/// Events reported by the HAL.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum HalEvent {
    /// Open complete event
    OpenComplete = 0,
    /// Close complete event
    CloseComplete = 1,
    /// Post init complete event
    PostInitComplete = 2,
    /// Pre-discover complete event
    PreDiscoverComplete = 3,
    /// The HAL wants control of the NFCC
    RequestControl = 4,
    /// The HAL gives control back
    ReleaseControl = 5,
    /// Error event
    Error = 6,
    /// The HCI network needs to be re-initialized
    HciNetworkReset = 7,
}

/// Status accompanying a HAL event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum HalStatus {
    /// Success
    Ok = 0,
    /// Generic failure
    Failed = 1,
    /// The transport to the NFCC failed
    ErrTransport = 2,
    /// The NFCC did not answer in time
    ErrCmdTimeout = 3,
    /// The request was refused
    Refused = 4,
}

impl From<&NciError> for HalStatus {
    fn from(e: &NciError) -> HalStatus {
        match e {
            NciError::Timeout => HalStatus::ErrCmdTimeout,
            NciError::Transport(_) | NciError::Io(_) => HalStatus::ErrTransport,
            NciError::Status(Status::Rejected) => HalStatus::Refused,
            _ => HalStatus::Failed,
        }
    }
}

/// Vendor HAL, as seen by the adaptation layer.
pub trait NfcHal: Send + Sync {
    /// Power up the NFCC and start reporting through `callback`.
    fn open(&self, callback: HalCallback) -> Result<()>;
    /// Shut the NFCC down.
    fn close(&self) -> Result<()>;
    /// Send raw NCI bytes.
    fn write(&self, data: &[u8]) -> Result<()>;
    /// The NCI session is initialized; `init_response` is the CORE_INIT_RSP payload.
    fn core_initialized(&self, init_response: &[u8]) -> Result<()>;
    /// Run vendor actions before discovery. Returns true when they complete
    /// later with a `PreDiscoverComplete` event.
    fn prediscover(&self) -> Result<bool>;
    /// The stack gave the HAL control of the NFCC.
    fn control_granted(&self) -> Result<()>;
    /// Power cycle the NFCC.
    fn power_cycle(&self) -> Result<()>;
    /// Wipe vendor persistent state.
    fn factory_reset(&self) -> Result<()> {
        Ok(())
    }
    /// Shut the NFCC down because the device is powering off.
    fn close_for_power_off(&self) -> Result<()> {
        self.close()
    }
}
