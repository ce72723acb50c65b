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

//! Correlation of NCI responses with the single outstanding command.

use crate::error::{NciError, Result};
use crate::packets::{Message, Opcode};
use log::{debug, warn};
use std::time::{Duration, Instant};

/// Outcome delivered to whoever issued a command.
pub type Completion = std::result::Result<Message, NciError>;

/// The command awaiting its response.
#[derive(Debug)]
pub struct PendingCommand<S> {
    /// Opcode of the command
    pub opcode: Opcode,
    /// When the command was submitted
    pub issued_at: Instant,
    /// When the command times out
    pub deadline: Instant,
    /// Receiver of the outcome
    pub sink: S,
}

/// A pending command that has been completed, timed out or aborted.
#[derive(Debug)]
pub struct Resolved<S> {
    /// Opcode of the command
    pub opcode: Opcode,
    /// Receiver of the outcome
    pub sink: S,
    /// Response or failure
    pub outcome: Completion,
}

/// Tracks at most one outstanding command.
pub struct CommandTracker<S> {
    timeout: Duration,
    pending: Option<PendingCommand<S>>,
    // Opcode of the last timed out command and when to forget about it.
    stale: Option<(Opcode, Instant)>,
}

impl<S> CommandTracker<S> {
    /// Create a tracker with the given response timeout.
    pub fn new(timeout: Duration) -> Self {
        CommandTracker { timeout, pending: None, stale: None }
    }

    /// Whether a command is outstanding.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// The outstanding command, if any.
    pub fn pending(&self) -> Option<&PendingCommand<S>> {
        self.pending.as_ref()
    }

    /// Record a new outstanding command.
    ///
    /// Retrying a timed out opcode forgets the late response marker: the
    /// NFCC may have dropped the first command, and both commands would be
    /// answered by identical responses anyway.
    pub fn submit(&mut self, opcode: Opcode, sink: S, now: Instant) -> Result<()> {
        if let Some(pending) = &self.pending {
            debug!("{:?} rejected, {:?} still pending", opcode, pending.opcode);
            return Err(NciError::Busy);
        }
        if matches!(self.stale, Some((stale, _)) if stale == opcode) {
            debug!("{:?} retried, accepting the first response", opcode);
            self.stale = None;
        }
        self.pending =
            Some(PendingCommand { opcode, issued_at: now, deadline: now + self.timeout, sink });
        Ok(())
    }

    /// Match a response against the outstanding command.
    pub fn on_response(&mut self, rsp: &Message, now: Instant) -> Result<Resolved<S>> {
        let actual =
            rsp.opcode().ok_or_else(|| NciError::Framing("response without opcode".into()))?;
        self.expire(now);
        if let Some((opcode, _)) = self.stale {
            if opcode == actual {
                // Responses arrive in order, so this one answers the command
                // that already timed out.
                warn!("discarding late {:?} response", actual);
                self.stale = None;
                return Err(NciError::UnexpectedResponse {
                    expected: self.pending.as_ref().map(|p| p.opcode),
                    actual,
                });
            }
        }
        match self.pending.take() {
            Some(pending) if pending.opcode == actual => {
                let elapsed = now.saturating_duration_since(pending.issued_at);
                debug!("{:?} answered after {:?}", actual, elapsed);
                Ok(Resolved { opcode: actual, sink: pending.sink, outcome: Ok(rsp.clone()) })
            }
            other => {
                let expected = other.as_ref().map(|p| p.opcode);
                self.pending = other;
                Err(NciError::UnexpectedResponse { expected, actual })
            }
        }
    }

    /// Time out the outstanding command once its deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Option<Resolved<S>> {
        self.expire(now);
        if !matches!(&self.pending, Some(p) if now >= p.deadline) {
            return None;
        }
        let pending = self.pending.take()?;
        self.stale = Some((pending.opcode, pending.deadline + self.timeout));
        Some(Resolved {
            opcode: pending.opcode,
            sink: pending.sink,
            outcome: Err(NciError::Timeout),
        })
    }

    /// Cancel the outstanding command.
    pub fn abort(&mut self) -> Option<Resolved<S>> {
        self.fail(NciError::Aborted)
    }

    /// Resolve the outstanding command with `error`.
    pub fn fail(&mut self, error: NciError) -> Option<Resolved<S>> {
        self.stale = None;
        self.pending
            .take()
            .map(|p| Resolved { opcode: p.opcode, sink: p.sink, outcome: Err(error) })
    }

    fn expire(&mut self, now: Instant) {
        if matches!(self.stale, Some((_, until)) if now >= until) {
            self.stale = None;
        }
    }
}
