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

//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use nci::{EngineConfig, LifecycleEvent, Transport};
use nci::{Engine, NciError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered record of what the engine did, shared by the mocks.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn last_position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().rposition(|e| e == entry)
    }
}

/// Transport recording every packet it is asked to send.
#[derive(Clone, Default)]
pub struct MockTransport {
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pub log: Log,
    pub link_down: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new(log: Log) -> Self {
        MockTransport { log, ..Default::default() }
    }

    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Vec<u8>> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Transport for MockTransport {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.link_down.load(Ordering::SeqCst) {
            self.log.push("send failed");
            return Err(NciError::Transport("link down".into()));
        }
        self.log.push(format!("send {:02x?}", &bytes[..bytes.len().min(3)]));
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.log.push("close");
    }

    fn power_cycle(&self) -> Result<()> {
        self.log.push("power_cycle");
        Ok(())
    }
}

pub const CORE_RESET_CMD: [u8; 4] = [0x20, 0x00, 0x01, 0x01];
pub const CORE_RESET_RSP: [u8; 4] = [0x40, 0x00, 0x01, 0x00];
pub const CORE_RESET_NTF: [u8; 8] = [0x60, 0x00, 0x05, 0x02, 0x01, 0x20, 0x00, 0x00];
pub const CORE_INIT_CMD: [u8; 5] = [0x20, 0x01, 0x02, 0x00, 0x00];
pub const RF_DISCOVER_MAP_RSP: [u8; 4] = [0x41, 0x00, 0x01, 0x00];
pub const RF_DISCOVER_RSP: [u8; 4] = [0x41, 0x03, 0x01, 0x00];
pub const RF_DEACTIVATE_RSP: [u8; 4] = [0x41, 0x06, 0x01, 0x00];

/// CORE_INIT_RSP (NCI 2.0) advertising `max_ctrl` as control payload size.
pub fn core_init_rsp(max_ctrl: u8) -> Vec<u8> {
    vec![
        0x40, 0x01, 0x0e, 0x00, 0, 0, 0, 0, 0x01, 0x00, 0x00, max_ctrl, 0xff, 0x01, 0x00, 0x00,
        0x00,
    ]
}

/// RF_INTF_ACTIVATED_NTF for an ISO-DEP endpoint.
pub fn activated_ntf(technology: u8) -> Vec<u8> {
    activated_ntf_with_payload(technology, 0xff)
}

/// RF_INTF_ACTIVATED_NTF advertising `max_data_payload` on the RF connection.
pub fn activated_ntf_with_payload(technology: u8, max_data_payload: u8) -> Vec<u8> {
    vec![
        0x61, 0x05, 0x0d, 0x01, 0x02, 0x04, technology, max_data_payload, 0x01, 0x02, 0x11, 0x22,
        technology, 0x00, 0x00, 0x00,
    ]
}

/// Engine plus the mocks observing it.
pub struct Harness {
    pub engine: Engine,
    pub transport: MockTransport,
    pub events: Arc<Mutex<Vec<LifecycleEvent>>>,
    pub log: Log,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Harness {
        let log = Log::default();
        let transport = MockTransport::new(log.clone());
        let events = Arc::new(Mutex::new(vec![]));
        let (sink_events, sink_log) = (events.clone(), log.clone());
        let engine = Engine::new(config, transport.clone(), move |event| {
            sink_log.push(format!("{:?}", event));
            sink_events.lock().unwrap().push(event);
        });
        Harness { engine, transport, events, log }
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Run bring-up to Idle against a well-behaved NCI 2.0 NFCC.
    pub fn open(&self, max_ctrl: u8) {
        let opened = self.engine.open().unwrap();
        assert_eq!(self.transport.last().unwrap(), CORE_RESET_CMD);
        self.engine.receive(&CORE_RESET_RSP);
        self.engine.receive(&CORE_RESET_NTF);
        assert_eq!(self.transport.last().unwrap(), CORE_INIT_CMD);
        self.engine.receive(&core_init_rsp(max_ctrl));
        assert_eq!(&self.transport.last().unwrap()[..2], &[0x21, 0x00]);
        self.engine.receive(&RF_DISCOVER_MAP_RSP);
        assert_eq!(opened.wait(), nci::HalStatus::Ok);
    }

    /// Start discovery from Idle.
    pub fn discover(&self) {
        self.engine.start_discovery(nci::TechnologyMask::ALL).unwrap();
        assert_eq!(&self.transport.last().unwrap()[..2], &[0x21, 0x03]);
        self.engine.receive(&RF_DISCOVER_RSP);
    }
}
