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

//! Errors that can be encountered while driving the NFCC.

use crate::packets::{Opcode, Status};
use thiserror::Error;

/// Result type
pub type Result<T> = std::result::Result<T, NciError>;

/// Errors produced by the NCI engine.
#[derive(Error, Debug)]
pub enum NciError {
    /// Malformed or inconsistent NCI packet. The codec has dropped the
    /// offending fragment chain.
    #[error("framing error: {0}")]
    Framing(String),
    /// A command was submitted while another one is still pending.
    #[error("a command is already pending")]
    Busy,
    /// A response arrived that does not match the pending command.
    #[error("unexpected response {actual:?} (pending: {expected:?})")]
    UnexpectedResponse {
        /// Opcode of the pending command, if any
        expected: Option<Opcode>,
        /// Opcode of the received response
        actual: Opcode,
    },
    /// No response was received before the command deadline.
    #[error("command timed out")]
    Timeout,
    /// The operation is not permitted in the current discovery state.
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// State in which the operation was attempted
        state: &'static str,
    },
    /// Pending work was cancelled by a close or a power cycle.
    #[error("operation aborted")]
    Aborted,
    /// A caller supplied argument is not acceptable.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The NFCC answered with a non-OK status.
    #[error("controller returned status {0:?}")]
    Status(Status),
    /// The transport refused or lost the bytes.
    #[error("transport error: {0}")]
    Transport(String),
    /// I/O error on the NCI stream or the storage directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = NciError::InvalidState { operation: "on_activation", state: "Idle" };
        assert_eq!(format!("{}", err), "on_activation is not allowed in state Idle");
    }

    #[test]
    fn unexpected_response_display() {
        let err = NciError::UnexpectedResponse {
            expected: Some(Opcode::CORE_RESET),
            actual: Opcode::CORE_INIT,
        };
        let s = format!("{}", err);
        assert!(s.contains("CORE_INIT"));
        assert!(s.contains("CORE_RESET"));
    }
}
