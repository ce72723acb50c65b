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

//! Adaptation between the NCI engine and the vendor HAL.

use crate::config::AdaptationConfig;
use crate::driver;
use crate::engine::{Engine, PreDiscover};
use crate::error::{NciError, Result};
use crate::hal::{HalEvent, HalStatus, NfcHal};
use crate::lifecycle::{LifecycleEvent, Rendezvous};
use crate::snoop::Snoop;
use crate::storage;
use crate::transport::Transport;
use log::{debug, error, info, warn};
use num_traits::FromPrimitive;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Callbacks handed to the HAL on open.
#[derive(Clone)]
pub struct HalCallback {
    engine: Engine,
}

impl HalCallback {
    /// Wrap the engine the HAL reports to.
    pub fn new(engine: Engine) -> HalCallback {
        HalCallback { engine }
    }

    /// HAL event callback, with raw event and status codes.
    pub fn send_event(&self, event: u8, status: u8) {
        let (event, status) = match (HalEvent::from_u8(event), HalStatus::from_u8(status)) {
            (Some(event), Some(status)) => (event, status),
            _ => {
                warn!("unknown HAL event {} with status {}", event, status);
                return;
            }
        };
        debug!("HAL event {:?} ({:?})", event, status);
        match event {
            HalEvent::OpenComplete if status == HalStatus::Ok => {
                if let Err(e) = self.engine.open() {
                    error!("cannot start the NCI session: {}", e);
                    self.engine.report(LifecycleEvent::OpenComplete(HalStatus::from(&e)));
                }
            }
            HalEvent::OpenComplete => self.engine.report(LifecycleEvent::OpenComplete(status)),
            HalEvent::CloseComplete => debug!("HAL closed"),
            HalEvent::PostInitComplete => debug!("HAL post init done"),
            HalEvent::PreDiscoverComplete => self.engine.complete_pre_discover(status),
            HalEvent::RequestControl => self.engine.request_control(),
            HalEvent::ReleaseControl => self.engine.release_control(),
            HalEvent::Error => {
                self.engine.transport_error(NciError::Transport(format!("HAL error {:?}", status)))
            }
            HalEvent::HciNetworkReset => info!("HCI network reset requested"),
        }
    }

    /// HAL data callback.
    pub fn send_data(&self, data: &[u8]) {
        self.engine.receive(data);
    }
}

struct HalTransport {
    hal: Arc<dyn NfcHal>,
    power_off: Arc<AtomicBool>,
}

impl Transport for HalTransport {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.hal.write(bytes)
    }

    fn close(&self) {
        let result = if self.power_off.load(Ordering::SeqCst) {
            self.hal.close_for_power_off()
        } else {
            self.hal.close()
        };
        if let Err(e) = result {
            error!("HAL close failed: {}", e);
        }
    }

    fn power_cycle(&self) -> Result<()> {
        self.hal.power_cycle()
    }

    // The HAL signals the end of a power cycle with OpenComplete.
    fn reopens_after_power_cycle(&self) -> bool {
        true
    }

    fn core_initialized(&self, init_response: &[u8]) {
        if let Err(e) = self.hal.core_initialized(init_response) {
            error!("HAL core_initialized failed: {}", e);
        }
    }
}

struct HalPreDiscover {
    hal: Arc<dyn NfcHal>,
}

impl PreDiscover for HalPreDiscover {
    fn pre_discover(&self) -> bool {
        match self.hal.prediscover() {
            Ok(started) => started,
            Err(e) => {
                warn!("HAL prediscover failed: {}", e);
                false
            }
        }
    }
}

/// The NFC adaptation: owns the engine, the HAL and the timer worker.
pub struct NfcAdaptation {
    config: AdaptationConfig,
    hal: Arc<dyn NfcHal>,
    engine: Engine,
    snoop: Arc<Snoop>,
    power_off: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NfcAdaptation {
    /// Prepare storage, create the engine and start the timer worker.
    /// Returns once the worker is running.
    pub async fn initialize(
        config: AdaptationConfig,
        hal: Arc<dyn NfcHal>,
        lifecycle: impl Fn(LifecycleEvent) + Send + Sync + 'static,
    ) -> Result<NfcAdaptation> {
        storage::prepare(&config.storage_path, config.preserve_storage)?;
        let snoop = Arc::new(Snoop::new(config.snoop_capacity));
        let power_off = Arc::new(AtomicBool::new(false));
        let engine = Engine::builder()
            .config(config.engine.clone())
            .transport(HalTransport { hal: hal.clone(), power_off: power_off.clone() })
            .pre_discover(HalPreDiscover { hal: hal.clone() })
            .lifecycle(lifecycle)
            .snoop(snoop.clone())
            .build()?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = tokio::spawn(driver::tick_loop(engine.clone(), config.tick_period, ready_tx));
        ready_rx.await.map_err(|_| NciError::Aborted)?;
        info!("NFC adaptation initialized");
        Ok(NfcAdaptation { config, hal, engine, snoop, power_off, worker: Some(worker) })
    }

    /// The engine driving the NCI session.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Open the HAL. The session is brought up once the HAL reports
    /// OpenComplete; the rendezvous resolves when bring-up finishes.
    pub fn enable(&self) -> Result<Rendezvous> {
        let rendezvous = self.engine.wait_for(HalEvent::OpenComplete);
        self.power_off.store(false, Ordering::SeqCst);
        self.hal.open(HalCallback::new(self.engine.clone()))?;
        Ok(rendezvous)
    }

    /// Close the session and the HAL.
    pub fn disable(&self) -> Rendezvous {
        self.engine.close()
    }

    /// Run the vendor pre-discovery actions.
    pub fn pre_discover(&self) -> bool {
        self.engine.pre_discover()
    }

    /// Grant the HAL the control it asked for.
    pub fn control_granted(&self) -> Result<()> {
        self.engine.control_granted();
        self.hal.control_granted()
    }

    /// Power cycle the NFCC and bring the session up again.
    pub fn power_cycle(&self) -> Rendezvous {
        self.engine.power_cycle()
    }

    /// Number of NFCEEs the platform supports.
    pub fn get_max_nfcee(&self) -> u8 {
        self.config.max_ee_supported
    }

    /// Wipe vendor state and the stack's factory-resettable storage.
    pub fn factory_reset(&self) -> Result<()> {
        self.hal.factory_reset()?;
        storage::remove_factory_file(&self.config.storage_path)?;
        Ok(())
    }

    /// Shut the NFCC down because the device is powering off.
    pub fn device_shutdown(&self) -> Rendezvous {
        self.power_off.store(true, Ordering::SeqCst);
        self.engine.close()
    }

    /// Write the recent NCI traffic.
    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "NFC state: {}", self.engine.state())?;
        self.snoop.dump(out)
    }

    /// Stop the timer worker.
    pub fn finalize(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
            debug!("timer worker stopped");
        }
    }
}

impl Drop for NfcAdaptation {
    fn drop(&mut self) {
        self.finalize();
    }
}
