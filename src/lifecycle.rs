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

//! Session lifecycle events and one-shot waiters for them.

use crate::hal::{HalEvent, HalStatus};
use futures::FutureExt;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Session lifecycle, reported to the lifecycle sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Bring-up finished
    OpenComplete(HalStatus),
    /// The session was closed
    CloseComplete,
    /// CORE_INIT succeeded
    PostInitComplete,
    /// Vendor pre-discovery actions finished
    PreDiscoverComplete(HalStatus),
    /// The vendor side asked for control of the NFCC
    ControlRequested,
    /// The vendor side returned control of the NFCC
    ControlReleased,
    /// The session failed
    Error(HalStatus),
}

impl LifecycleEvent {
    /// Matching HAL event.
    pub fn hal_event(&self) -> HalEvent {
        match self {
            LifecycleEvent::OpenComplete(_) => HalEvent::OpenComplete,
            LifecycleEvent::CloseComplete => HalEvent::CloseComplete,
            LifecycleEvent::PostInitComplete => HalEvent::PostInitComplete,
            LifecycleEvent::PreDiscoverComplete(_) => HalEvent::PreDiscoverComplete,
            LifecycleEvent::ControlRequested => HalEvent::RequestControl,
            LifecycleEvent::ControlReleased => HalEvent::ReleaseControl,
            LifecycleEvent::Error(_) => HalEvent::Error,
        }
    }

    /// Status carried by the event.
    pub fn status(&self) -> HalStatus {
        match self {
            LifecycleEvent::OpenComplete(s)
            | LifecycleEvent::PreDiscoverComplete(s)
            | LifecycleEvent::Error(s) => *s,
            _ => HalStatus::Ok,
        }
    }
}

/// Provides ability to wait for the next occurrence of a HAL event
#[derive(Clone, Default)]
pub struct LifecycleRegistry {
    waiters: Arc<Mutex<HashMap<HalEvent, Vec<oneshot::Sender<HalStatus>>>>>,
}

impl LifecycleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indicate interest in the next occurrence of `event`. Waiters whose
    /// rendezvous was dropped are forgotten.
    pub fn register(&self, event: HalEvent) -> Rendezvous {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let waiting = waiters.entry(event).or_default();
        waiting.retain(|waiter| !waiter.is_closed());
        waiting.push(tx);
        Rendezvous { rx }
    }

    /// Number of live waiters for `event`.
    pub fn waiting(&self, event: HalEvent) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map_or(0, |waiting| waiting.iter().filter(|waiter| !waiter.is_closed()).count())
    }

    /// Resolve everyone waiting for `event`.
    pub fn fire(&self, event: HalEvent, status: HalStatus) {
        let waiters = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event)
            .unwrap_or_default();
        for waiter in waiters {
            if waiter.send(status).is_err() {
                debug!("waiter for {:?} went away", event);
            }
        }
    }
}

/// Completion of a lifecycle transition.
///
/// Await it from async code, or call [`Rendezvous::wait`] from a plain
/// thread. Resolves to `Failed` if the engine is dropped first.
#[derive(Debug)]
pub struct Rendezvous {
    rx: oneshot::Receiver<HalStatus>,
}

impl Rendezvous {
    /// Block the current thread until the event occurs. Must not be called
    /// from within an async context.
    pub fn wait(self) -> HalStatus {
        self.rx.blocking_recv().unwrap_or(HalStatus::Failed)
    }

    /// The status, if the event already occurred.
    pub fn try_status(&mut self) -> Option<HalStatus> {
        match self.rx.try_recv() {
            Ok(status) => Some(status),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(HalStatus::Failed),
        }
    }
}

impl Future for Rendezvous {
    type Output = HalStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<HalStatus> {
        self.rx.poll_unpin(cx).map(|r| r.unwrap_or(HalStatus::Failed))
    }
}
