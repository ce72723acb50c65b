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

//! NCI host engine.
//!
//! Inbound bytes enter through [`Engine::receive`], are reassembled by the
//! codec and either complete the pending command or are dispatched as
//! events after driving the discovery state machine. Commands leave through
//! the [`Transport`].
//!
//! All session state sits behind one mutex. Work produced while it is held
//! (packets to send, completions, sink invocations, lifecycle events) is
//! queued in an outbox and carried out once the lock is released, so sinks
//! may call back into the engine.

use crate::codec::Codec;
use crate::config::{EngineConfig, TechnologyMask};
use crate::connections::{LogicalConnections, STATIC_RF_CONN_ID};
use crate::dispatcher::{Category, Dispatched, Dispatcher, Event, EventSink, Subscription};
use crate::error::{NciError, Result};
use crate::hal::{HalEvent, HalStatus};
use crate::lifecycle::{LifecycleEvent, LifecycleRegistry, Rendezvous};
use crate::packets::{
    core_init_cmd, core_reset_cmd, reset_response_version, rf_deactivate_cmd, rf_discover_cmd,
    rf_discover_map_cmd, rf_discover_select_cmd, DeactivationType, DiscoveryResult, InitResponse,
    Message, MessageType, Opcode, ResetNotification, ResetType, RfInterface, RfProtocol,
};
use crate::snoop::{Direction, Snoop};
use crate::state::{DiscoveryState, StateController};
use crate::tracker::{CommandTracker, Completion, Resolved};
use crate::transport::Transport;
use bytes::Bytes;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;

/// Receiver of the outcome of a caller submitted command.
pub type Responder = Box<dyn FnOnce(Completion) + Send>;

/// Receiver of lifecycle events.
pub type LifecycleSink = Box<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Vendor actions run before RF discovery.
pub trait PreDiscover: Send + Sync {
    /// Start the actions. Returns true if they complete asynchronously.
    fn pre_discover(&self) -> bool;

    /// Whether `ntf`, a proprietary notification, signals completion.
    fn is_complete(&self, _ntf: &Message) -> bool {
        false
    }
}

/// No pre-discovery actions.
pub struct NoPreDiscover;

impl PreDiscover for NoPreDiscover {
    fn pre_discover(&self) -> bool {
        false
    }
}

/// Internal continuation of a command issued by the engine itself.
#[derive(Copy, Clone, Debug)]
enum Step {
    Reset,
    Init,
    DiscoverMap,
    Discover,
    StopForRediscover(TechnologyMask),
    DiscoverSelect,
    Deactivate(DeactivationType),
}

impl Step {
    fn is_bring_up(&self) -> bool {
        matches!(self, Step::Reset | Step::Init | Step::DiscoverMap)
    }
}

enum Continuation {
    Caller(Responder),
    Step(Step),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Control {
    Engine,
    Requested,
    Granted,
}

#[derive(Default)]
struct PreDiscoverState {
    pending: bool,
    deferred: Option<TechnologyMask>,
}

struct Session {
    controller: StateController,
    tracker: CommandTracker<Continuation>,
    // Only used to segment outbound messages.
    outbound: Codec,
    opening: bool,
    // Power cycled, waiting for the transport to call `open`.
    awaiting_transport: bool,
    reset_ntf_deadline: Option<Instant>,
    nci_version: u8,
    connections: LogicalConnections,
    prediscover: PreDiscoverState,
    control: Control,
    // Set when the inbound codec could not be reset synchronously.
    codec_reset: bool,
}

enum Action {
    Send(Bytes),
    Complete(Responder, Completion),
    Notify(EventSink, Event),
    Lifecycle(LifecycleEvent),
    CoreInitialized(Bytes),
    PowerCycleTransport,
    CloseTransport,
}

#[derive(Default)]
struct Outbox(Vec<Action>);

impl Outbox {
    fn push(&mut self, action: Action) {
        self.0.push(action);
    }
}

struct Shared {
    config: EngineConfig,
    transport: Box<dyn Transport>,
    pre_discover: Box<dyn PreDiscover>,
    lifecycle: LifecycleSink,
    waiters: LifecycleRegistry,
    inbound: Mutex<Codec>,
    session: Mutex<Session>,
    subscribers: Mutex<Dispatcher>,
    snoop: Option<Arc<Snoop>>,
}

// Commands whose responses drive the state machine.
fn is_engine_managed(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::CORE_RESET
            | Opcode::CORE_INIT
            | Opcode::RF_DISCOVER_MAP
            | Opcode::RF_DISCOVER
            | Opcode::RF_DISCOVER_SELECT
            | Opcode::RF_DEACTIVATE
    )
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Box<dyn Transport>>,
    lifecycle: Option<LifecycleSink>,
    pre_discover: Box<dyn PreDiscover>,
    snoop: Option<Arc<Snoop>>,
}

impl EngineBuilder {
    /// Engine parameters.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Where outbound packets go. Required.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Receiver of lifecycle events. Required.
    pub fn lifecycle(mut self, sink: impl Fn(LifecycleEvent) + Send + Sync + 'static) -> Self {
        self.lifecycle = Some(Box::new(sink));
        self
    }

    /// Vendor pre-discovery hook.
    pub fn pre_discover(mut self, hook: impl PreDiscover + 'static) -> Self {
        self.pre_discover = Box::new(hook);
        self
    }

    /// Record traffic into `snoop`.
    pub fn snoop(mut self, snoop: Arc<Snoop>) -> Self {
        self.snoop = Some(snoop);
        self
    }

    /// Create the engine, in `PreOpen`.
    pub fn build(self) -> Result<Engine> {
        let transport = self.transport.ok_or(NciError::InvalidParameter("transport is required"))?;
        let lifecycle =
            self.lifecycle.ok_or(NciError::InvalidParameter("lifecycle sink is required"))?;
        Ok(Engine::from_parts(self.config, transport, lifecycle, self.pre_discover, self.snoop))
    }
}

/// Future resolved with the outcome of a submitted command.
pub struct ResponseHandle {
    rx: oneshot::Receiver<Completion>,
}

impl ResponseHandle {
    /// Block until the command completes. Must not be called from within an
    /// async context.
    pub fn wait(self) -> Completion {
        self.rx.blocking_recv().unwrap_or(Err(NciError::Aborted))
    }

    /// The outcome, if the command already completed.
    pub fn try_take(&mut self) -> Option<Completion> {
        match self.rx.try_recv() {
            Ok(completion) => Some(completion),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(NciError::Aborted)),
        }
    }
}

impl Future for ResponseHandle {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        self.rx.poll_unpin(cx).map(|r| r.unwrap_or(Err(NciError::Aborted)))
    }
}

/// Handle to an NCI session. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            transport: None,
            lifecycle: None,
            pre_discover: Box::new(NoPreDiscover),
            snoop: None,
        }
    }

    /// Engine with no pre-discovery hook and no snoop log.
    pub fn new(
        config: EngineConfig,
        transport: impl Transport + 'static,
        lifecycle: impl Fn(LifecycleEvent) + Send + Sync + 'static,
    ) -> Engine {
        Engine::from_parts(
            config,
            Box::new(transport),
            Box::new(lifecycle),
            Box::new(NoPreDiscover),
            None,
        )
    }

    fn from_parts(
        config: EngineConfig,
        transport: Box<dyn Transport>,
        lifecycle: LifecycleSink,
        pre_discover: Box<dyn PreDiscover>,
        snoop: Option<Arc<Snoop>>,
    ) -> Engine {
        let session = Session {
            controller: StateController::new(config.max_discovery_targets),
            tracker: CommandTracker::new(config.command_timeout),
            outbound: Codec::new(config.mtu, config.max_message_size),
            opening: false,
            awaiting_transport: false,
            reset_ntf_deadline: None,
            nci_version: 0,
            connections: LogicalConnections::new(),
            prediscover: PreDiscoverState::default(),
            control: Control::Engine,
            codec_reset: false,
        };
        Engine {
            shared: Arc::new(Shared {
                inbound: Mutex::new(Codec::new(config.mtu, config.max_message_size)),
                session: Mutex::new(session),
                config,
                transport,
                pre_discover,
                lifecycle,
                waiters: LifecycleRegistry::new(),
                subscribers: Mutex::new(Dispatcher::new()),
                snoop,
            }),
        }
    }

    /// Engine parameters.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Current discovery state.
    pub fn state(&self) -> DiscoveryState {
        lock(&self.shared.session).controller.state().clone()
    }

    /// Control packet MTU in effect for outbound messages.
    pub fn negotiated_mtu(&self) -> usize {
        lock(&self.shared.session).outbound.tx_mtu()
    }

    /// Endpoints reported since discovery started.
    pub fn discovered(&self) -> Vec<DiscoveryResult> {
        lock(&self.shared.session).controller.discovered().to_vec()
    }

    /// Whether a command is awaiting its response.
    pub fn is_command_pending(&self) -> bool {
        lock(&self.shared.session).tracker.is_busy()
    }

    /// Register the sink of a notification category.
    pub fn subscribe(
        &self,
        category: Category,
        sink: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        lock(&self.shared.subscribers).subscribe(category, Arc::new(sink))
    }

    /// Remove a registration made with [`Engine::subscribe`].
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        lock(&self.shared.subscribers).unsubscribe(subscription)
    }

    /// Wait for the next occurrence of a lifecycle event.
    pub fn wait_for(&self, event: HalEvent) -> Rendezvous {
        self.shared.waiters.register(event)
    }

    /// Number of live rendezvous for `event`.
    pub fn waiting(&self, event: HalEvent) -> usize {
        self.shared.waiters.waiting(event)
    }

    /// Report a lifecycle event originating outside the engine.
    pub fn report(&self, event: LifecycleEvent) {
        if matches!(event, LifecycleEvent::OpenComplete(_)) {
            lock(&self.shared.session).awaiting_transport = false;
        }
        self.emit(event);
    }

    /// Bring the session up: CORE_RESET, CORE_INIT, RF_DISCOVER_MAP.
    pub fn open(&self) -> Result<Rendezvous> {
        let mut outbox = Outbox::default();
        let rendezvous = {
            let mut session = lock(&self.shared.session);
            session.controller.check_open()?;
            if session.opening {
                return Err(NciError::InvalidState { operation: "open", state: "Opening" });
            }
            session.awaiting_transport = false;
            let rendezvous = self.wait_for(HalEvent::OpenComplete);
            self.begin_bring_up(&mut session, &mut outbox);
            rendezvous
        };
        self.flush(outbox);
        Ok(rendezvous)
    }

    /// Tear the session down.
    pub fn close(&self) -> Rendezvous {
        let rendezvous = self.wait_for(HalEvent::CloseComplete);
        let reset_now = match self.shared.inbound.try_lock() {
            Ok(mut codec) => {
                if let Err(e) = codec.close() {
                    warn!("close: {}", e);
                }
                true
            }
            Err(_) => false,
        };
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            session.codec_reset |= !reset_now;
            let was_opening = session.opening || session.awaiting_transport;
            self.cancel(&mut session, &mut outbox);
            if was_opening {
                outbox.push(Action::Lifecycle(LifecycleEvent::OpenComplete(HalStatus::Failed)));
            }
            outbox.push(Action::CloseTransport);
            outbox.push(Action::Lifecycle(LifecycleEvent::CloseComplete));
        }
        info!("session closed");
        self.flush(outbox);
        rendezvous
    }

    /// Abort everything, power cycle the NFCC and bring the session up again.
    ///
    /// Transports that reopen asynchronously (see
    /// [`Transport::reopens_after_power_cycle`]) get bring-up started by their
    /// own call to [`Engine::open`]; the rendezvous covers both cases.
    pub fn power_cycle(&self) -> Rendezvous {
        let rendezvous = self.wait_for(HalEvent::OpenComplete);
        let reopens = self.shared.transport.reopens_after_power_cycle();
        let reset_now = match self.shared.inbound.try_lock() {
            Ok(mut codec) => {
                codec.reset();
                true
            }
            Err(_) => false,
        };
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            session.codec_reset |= !reset_now;
            self.cancel(&mut session, &mut outbox);
            outbox.push(Action::PowerCycleTransport);
            if reopens {
                session.awaiting_transport = true;
            } else {
                self.begin_bring_up(&mut session, &mut outbox);
            }
        }
        info!("power cycle");
        self.flush(outbox);
        rendezvous
    }

    /// Start (or restart) RF discovery with the given technologies.
    pub fn start_discovery(&self, technologies: TechnologyMask) -> Result<()> {
        if technologies.is_empty() {
            return Err(NciError::InvalidParameter("empty technology mask"));
        }
        let mut outbox = Outbox::default();
        let result = {
            let mut session = lock(&self.shared.session);
            self.start_discovery_locked(&mut session, technologies, &mut outbox)
        };
        self.flush(outbox);
        result
    }

    /// Select one of the discovered endpoints.
    pub fn select_target(
        &self,
        discovery_id: u8,
        protocol: RfProtocol,
        interface: RfInterface,
    ) -> Result<()> {
        let mut outbox = Outbox::default();
        let result = {
            let mut session = lock(&self.shared.session);
            Self::check_control(&session, "select_target")?;
            session.controller.check_select(discovery_id)?;
            let cmd = rf_discover_select_cmd(discovery_id, protocol, interface);
            Self::issue(&mut session, &cmd, Continuation::Step(Step::DiscoverSelect), &mut outbox)
        };
        self.flush(outbox);
        result
    }

    /// Request an RF deactivation.
    pub fn deactivate(&self, kind: DeactivationType) -> Result<()> {
        let mut outbox = Outbox::default();
        let result = {
            let mut session = lock(&self.shared.session);
            Self::check_control(&session, "deactivate")?;
            session.controller.check_deactivate()?;
            Self::issue(
                &mut session,
                &rf_deactivate_cmd(kind),
                Continuation::Step(Step::Deactivate(kind)),
                &mut outbox,
            )
        };
        self.flush(outbox);
        result
    }

    /// Run the vendor pre-discovery actions. Exactly one PreDiscoverComplete
    /// follows. Returns true if the actions complete asynchronously.
    pub fn pre_discover(&self) -> bool {
        {
            let mut session = lock(&self.shared.session);
            if session.prediscover.pending {
                debug!("pre-discover already in progress");
                return true;
            }
            session.prediscover.pending = true;
        }
        let started = self.shared.pre_discover.pre_discover();
        if !started {
            let mut outbox = Outbox::default();
            {
                let mut session = lock(&self.shared.session);
                if session.prediscover.pending {
                    self.finish_pre_discover(&mut session, HalStatus::Ok, &mut outbox);
                }
            }
            self.flush(outbox);
        }
        started
    }

    /// The vendor pre-discovery actions finished.
    pub fn complete_pre_discover(&self, status: HalStatus) {
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            if !session.prediscover.pending {
                debug!("pre-discover completion with nothing pending");
                return;
            }
            self.finish_pre_discover(&mut session, status, &mut outbox);
        }
        self.flush(outbox);
    }

    /// The vendor side asks for control of the NFCC.
    pub fn request_control(&self) {
        lock(&self.shared.session).control = Control::Requested;
        self.emit(LifecycleEvent::ControlRequested);
    }

    /// The host grants the pending control request.
    pub fn control_granted(&self) {
        let mut session = lock(&self.shared.session);
        if session.control != Control::Requested {
            warn!("control granted without a request");
        }
        session.control = Control::Granted;
    }

    /// The vendor side returns control of the NFCC.
    pub fn release_control(&self) {
        lock(&self.shared.session).control = Control::Engine;
        self.emit(LifecycleEvent::ControlReleased);
    }

    /// Send a command, delivering its outcome to `responder`.
    pub fn submit_with(&self, cmd: Message, responder: Responder) -> Result<()> {
        if cmd.mt != MessageType::Command {
            return Err(NciError::InvalidParameter("not a command"));
        }
        if cmd.opcode().map_or(false, is_engine_managed) {
            return Err(NciError::InvalidParameter("opcode is driven by the engine"));
        }
        let mut outbox = Outbox::default();
        let result = {
            let mut session = lock(&self.shared.session);
            Self::check_control(&session, "submit")?;
            if !session.controller.state().is_open() {
                return Err(NciError::InvalidState {
                    operation: "submit",
                    state: session.controller.state().name(),
                });
            }
            Self::issue(&mut session, &cmd, Continuation::Caller(responder), &mut outbox)
        };
        self.flush(outbox);
        result
    }

    /// Send a command; the handle resolves with its response.
    pub fn submit(&self, cmd: Message) -> Result<ResponseHandle> {
        let (tx, rx) = oneshot::channel();
        self.submit_with(
            cmd,
            Box::new(move |completion| {
                if tx.send(completion).is_err() {
                    debug!("response handle dropped");
                }
            }),
        )?;
        Ok(ResponseHandle { rx })
    }

    /// Send a command and block until it completes.
    pub fn submit_blocking(&self, cmd: Message) -> Result<Message> {
        self.submit(cmd)?.wait()
    }

    /// Send data on a logical connection.
    pub fn send_data(&self, conn_id: u8, payload: Bytes) -> Result<()> {
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            if conn_id == STATIC_RF_CONN_ID && !session.controller.state().is_active() {
                return Err(NciError::InvalidState {
                    operation: "send_data",
                    state: session.controller.state().name(),
                });
            }
            for fragment in session.connections.send(conn_id, payload)? {
                outbox.push(Action::Send(fragment.to_bytes()));
            }
            if conn_id == STATIC_RF_CONN_ID {
                session.controller.begin_transaction();
            }
        }
        self.flush(outbox);
        Ok(())
    }

    /// Feed bytes received from the NFCC.
    pub fn receive(&self, bytes: &[u8]) {
        if let Some(snoop) = &self.shared.snoop {
            snoop.record(Direction::Rx, bytes);
        }
        let mut codec = lock(&self.shared.inbound);
        if self.take_codec_reset() {
            codec.reset();
        }
        let decoded: Vec<Result<Message>> = codec.ingest(bytes).collect();
        for item in decoded {
            match item {
                Ok(msg) => self.handle_message(msg),
                Err(e) => warn!("dropping inbound packet: {}", e),
            }
            if self.take_codec_reset() {
                codec.reset();
                break;
            }
        }
    }

    /// Advance timers: command deadlines and the wait for CORE_RESET_NTF.
    pub fn tick(&self, now: Instant) {
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            if let Some(resolved) = session.tracker.tick(now) {
                warn!("{:?} timed out", resolved.opcode);
                self.resolve(&mut session, resolved, &mut outbox);
            }
            if matches!(session.reset_ntf_deadline, Some(deadline) if now >= deadline) {
                error!("no CORE_RESET_NTF after CORE_RESET_RSP");
                self.fail_open(&mut session, HalStatus::ErrCmdTimeout, &mut outbox);
            }
        }
        self.flush(outbox);
    }

    /// The transport failed.
    pub fn transport_error(&self, err: NciError) {
        error!("transport error: {}", err);
        let cause = match err {
            NciError::Transport(cause) => cause,
            other => other.to_string(),
        };
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            let opening = session.opening;
            // Whatever was in flight never reached the NFCC.
            if let Some(resolved) = session.tracker.fail(NciError::Transport(cause)) {
                self.resolve(&mut session, resolved, &mut outbox);
            }
            session.connections.clear();
            if opening {
                self.fail_open(&mut session, HalStatus::ErrTransport, &mut outbox);
            } else if session.awaiting_transport {
                session.awaiting_transport = false;
                let event = LifecycleEvent::OpenComplete(HalStatus::ErrTransport);
                outbox.push(Action::Lifecycle(event));
            } else {
                session.controller.fall_back_to_idle();
                outbox.push(Action::Lifecycle(LifecycleEvent::Error(HalStatus::ErrTransport)));
            }
        }
        self.flush(outbox);
    }

    fn take_codec_reset(&self) -> bool {
        std::mem::take(&mut lock(&self.shared.session).codec_reset)
    }

    fn check_control(session: &Session, operation: &'static str) -> Result<()> {
        match session.control {
            Control::Granted => Err(NciError::InvalidState { operation, state: "ControlGranted" }),
            _ => Ok(()),
        }
    }

    fn issue(
        session: &mut Session,
        cmd: &Message,
        continuation: Continuation,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let opcode = cmd.opcode().ok_or(NciError::InvalidParameter("not a control message"))?;
        session.tracker.submit(opcode, continuation, Instant::now())?;
        debug!("sending {:?}", opcode);
        for fragment in session.outbound.encode(cmd) {
            outbox.push(Action::Send(fragment.to_bytes()));
        }
        Ok(())
    }

    fn begin_bring_up(&self, session: &mut Session, outbox: &mut Outbox) {
        info!("starting session bring-up");
        session.opening = true;
        session.nci_version = 0;
        session.outbound.set_tx_mtu(self.shared.config.mtu);
        let cmd = core_reset_cmd(ResetType::ResetConfig);
        if let Err(e) = Self::issue(session, &cmd, Continuation::Step(Step::Reset), outbox) {
            error!("cannot send CORE_RESET: {}", e);
            self.fail_open(session, HalStatus::from(&e), outbox);
        }
    }

    fn fail_open(&self, session: &mut Session, status: HalStatus, outbox: &mut Outbox) {
        if !session.opening {
            return;
        }
        error!("bring-up failed: {:?}", status);
        session.opening = false;
        session.reset_ntf_deadline = None;
        if let Some(resolved) = session.tracker.abort() {
            self.resolve(session, resolved, outbox);
        }
        session.connections.clear();
        session.controller.reset();
        outbox.push(Action::Lifecycle(LifecycleEvent::OpenComplete(status)));
    }

    // Abort pending work and return to PreOpen. Used by close and power cycle.
    fn cancel(&self, session: &mut Session, outbox: &mut Outbox) {
        session.opening = false;
        session.awaiting_transport = false;
        session.reset_ntf_deadline = None;
        if let Some(resolved) = session.tracker.abort() {
            self.resolve(session, resolved, outbox);
        }
        session.connections.clear();
        session.prediscover = PreDiscoverState::default();
        session.control = Control::Engine;
        session.controller.reset();
    }

    fn resolve(
        &self,
        session: &mut Session,
        resolved: Resolved<Continuation>,
        outbox: &mut Outbox,
    ) {
        match resolved.sink {
            Continuation::Caller(responder) => {
                outbox.push(Action::Complete(responder, resolved.outcome))
            }
            Continuation::Step(step) => self.continue_step(session, step, resolved.outcome, outbox),
        }
    }

    fn continue_step(
        &self,
        session: &mut Session,
        step: Step,
        outcome: Completion,
        outbox: &mut Outbox,
    ) {
        if step.is_bring_up() && !session.opening {
            debug!("{:?} finished after bring-up was cancelled", step);
            return;
        }
        let rsp = match outcome.and_then(|rsp| rsp.status()?.check().map(|_| rsp)) {
            Ok(rsp) => rsp,
            Err(e) => {
                warn!("{:?} failed: {}", step, e);
                if step.is_bring_up() {
                    self.fail_open(session, HalStatus::from(&e), outbox);
                }
                return;
            }
        };
        match step {
            Step::Reset => {
                if let Some(version) = reset_response_version(&rsp.payload) {
                    session.nci_version = version;
                    self.send_init(session, outbox);
                } else {
                    session.reset_ntf_deadline =
                        Some(Instant::now() + self.shared.config.command_timeout);
                }
            }
            Step::Init => match InitResponse::parse(&rsp.payload, session.nci_version) {
                Ok(init) => {
                    let mtu = self.shared.config.mtu.min(init.max_control_payload as usize);
                    session.outbound.set_tx_mtu(mtu);
                    info!(
                        "NCI {:#04x}, control MTU {}",
                        session.nci_version,
                        session.outbound.tx_mtu()
                    );
                    outbox.push(Action::CoreInitialized(rsp.payload.clone()));
                    outbox.push(Action::Lifecycle(LifecycleEvent::PostInitComplete));
                    let cmd = rf_discover_map_cmd();
                    let next = Continuation::Step(Step::DiscoverMap);
                    if let Err(e) = Self::issue(session, &cmd, next, outbox) {
                        self.fail_open(session, HalStatus::from(&e), outbox);
                    }
                }
                Err(e) => {
                    error!("bad CORE_INIT_RSP: {}", e);
                    self.fail_open(session, HalStatus::from(&e), outbox);
                }
            },
            Step::DiscoverMap => {
                session.opening = false;
                match session.controller.opened() {
                    Ok(()) => {
                        outbox.push(Action::Lifecycle(LifecycleEvent::OpenComplete(HalStatus::Ok)))
                    }
                    Err(e) => error!("{}", e),
                }
            }
            Step::Discover => session.controller.discovery_started(),
            Step::StopForRediscover(technologies) => {
                session.controller.discovery_stopped();
                let cmd = rf_discover_cmd(&technologies.modes());
                let next = Continuation::Step(Step::Discover);
                if let Err(e) = Self::issue(session, &cmd, next, outbox) {
                    warn!("cannot restart discovery: {}", e);
                }
            }
            Step::DiscoverSelect => debug!("target selection accepted"),
            Step::Deactivate(kind) => {
                // From an active state the notification drives the transition.
                if *session.controller.state() == DiscoveryState::Discovering {
                    debug!("discovery stopped by {:?} deactivation", kind);
                    session.controller.discovery_stopped();
                }
            }
        }
    }

    fn send_init(&self, session: &mut Session, outbox: &mut Outbox) {
        let cmd = core_init_cmd(session.nci_version);
        if let Err(e) = Self::issue(session, &cmd, Continuation::Step(Step::Init), outbox) {
            self.fail_open(session, HalStatus::from(&e), outbox);
        }
    }

    fn start_discovery_locked(
        &self,
        session: &mut Session,
        technologies: TechnologyMask,
        outbox: &mut Outbox,
    ) -> Result<()> {
        Self::check_control(session, "start_discovery")?;
        session.controller.check_start_discovery()?;
        if session.prediscover.pending {
            debug!("discovery deferred until pre-discover completes");
            session.prediscover.deferred = Some(technologies);
            return Ok(());
        }
        if *session.controller.state() == DiscoveryState::Discovering {
            let cmd = rf_deactivate_cmd(DeactivationType::IdleMode);
            let next = Continuation::Step(Step::StopForRediscover(technologies));
            Self::issue(session, &cmd, next, outbox)
        } else {
            let cmd = rf_discover_cmd(&technologies.modes());
            Self::issue(session, &cmd, Continuation::Step(Step::Discover), outbox)
        }
    }

    fn finish_pre_discover(&self, session: &mut Session, status: HalStatus, outbox: &mut Outbox) {
        session.prediscover.pending = false;
        outbox.push(Action::Lifecycle(LifecycleEvent::PreDiscoverComplete(status)));
        if let Some(technologies) = session.prediscover.deferred.take() {
            if let Err(e) = self.start_discovery_locked(session, technologies, outbox) {
                warn!("deferred discovery not started: {}", e);
            }
        }
    }

    fn handle_message(&self, msg: Message) {
        match msg.mt {
            MessageType::Response => self.on_response(msg),
            MessageType::Notification | MessageType::Data => self.on_event(msg),
            MessageType::Command => warn!("ignoring command {:?} from the NFCC", msg.opcode()),
        }
    }

    fn on_response(&self, rsp: Message) {
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            match session.tracker.on_response(&rsp, Instant::now()) {
                Ok(resolved) => self.resolve(&mut session, resolved, &mut outbox),
                Err(e) => warn!("{}", e),
            }
        }
        self.flush(outbox);
    }

    fn on_event(&self, msg: Message) {
        let event = match Event::parse(&msg) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("unhandled {:?} {:?}", msg.mt, msg.channel);
                return;
            }
            Err(e) => {
                warn!("malformed {:?}: {}", msg.opcode(), e);
                return;
            }
        };
        let mut outbox = Outbox::default();
        {
            let mut session = lock(&self.shared.session);
            if let Event::Reset(ntf) = &event {
                if session.reset_ntf_deadline.take().is_some() {
                    self.on_bring_up_reset(&mut session, ntf, &mut outbox);
                    drop(session);
                    self.flush(outbox);
                    return;
                }
            }
            let route = lock(&self.shared.subscribers).route(session.controller.state(), &event);
            self.apply(&mut session, &event, &mut outbox);
            match route {
                Ok(sink) => outbox.push(Action::Notify(sink, event)),
                Err(Dispatched::Internal) => (),
                Err(reason) => debug!("{:?} dropped: {:?}", event.category(), reason),
            }
        }
        self.flush(outbox);
    }

    fn on_bring_up_reset(
        &self,
        session: &mut Session,
        ntf: &ResetNotification,
        outbox: &mut Outbox,
    ) {
        debug!("CORE_RESET_NTF: trigger {}, NCI {:#04x}", ntf.trigger, ntf.nci_version);
        session.nci_version = ntf.nci_version;
        self.send_init(session, outbox);
    }

    // State machine side of an inbound event.
    fn apply(&self, session: &mut Session, event: &Event, outbox: &mut Outbox) {
        match event {
            Event::Reset(ntf) => {
                if session.opening || session.controller.state().is_open() {
                    warn!("unsolicited CORE_RESET_NTF (trigger {})", ntf.trigger);
                    let was_opening = session.opening;
                    self.fail_open(session, HalStatus::Failed, outbox);
                    if !was_opening {
                        if let Some(resolved) = session.tracker.abort() {
                            self.resolve(session, resolved, outbox);
                        }
                        session.connections.clear();
                        session.controller.reset();
                    }
                    outbox.push(Action::Lifecycle(LifecycleEvent::Error(HalStatus::Failed)));
                }
            }
            Event::GenericError(status) => warn!("CORE_GENERIC_ERROR_NTF: {:?}", status),
            Event::InterfaceError { status, conn_id } => {
                warn!("CORE_INTERFACE_ERROR_NTF on conn {}: {:?}", conn_id, status)
            }
            Event::Credits(credits) => {
                for (conn_id, n) in credits {
                    for fragment in session.connections.add_credits(*conn_id, *n) {
                        outbox.push(Action::Send(fragment.to_bytes()));
                    }
                }
            }
            Event::Discovered(result) => {
                if let Err(e) = session.controller.on_discovery_result(result.clone()) {
                    warn!("{}", e);
                }
            }
            Event::Activated(activation) => {
                match session.controller.on_activation(activation.clone()) {
                    Ok(mode) => {
                        info!("{:?} activated, {:?} mode", activation.protocol, mode);
                        session.connections.open(
                            STATIC_RF_CONN_ID,
                            activation.max_data_payload,
                            activation.initial_credits,
                        );
                    }
                    Err(e) => warn!("{}", e),
                }
            }
            Event::Deactivated(deactivation) => {
                match session.controller.on_deactivation(deactivation) {
                    Ok(()) => {
                        session.connections.close(STATIC_RF_CONN_ID);
                    }
                    Err(e) => warn!("{}", e),
                }
            }
            Event::Data { conn_id, .. } => {
                if *conn_id == STATIC_RF_CONN_ID {
                    session.controller.begin_transaction();
                }
            }
            Event::Proprietary(ntf) => {
                if session.prediscover.pending && self.shared.pre_discover.is_complete(ntf) {
                    self.finish_pre_discover(session, HalStatus::Ok, outbox);
                }
            }
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        debug!("lifecycle: {:?}", event);
        (self.shared.lifecycle)(event);
        self.shared.waiters.fire(event.hal_event(), event.status());
    }

    fn flush(&self, outbox: Outbox) {
        let transport = &self.shared.transport;
        let mut failed = false;
        for action in outbox.0 {
            match action {
                Action::Send(_) if failed => debug!("transport down, packet dropped"),
                Action::Send(bytes) => {
                    if let Some(snoop) = &self.shared.snoop {
                        snoop.record(Direction::Tx, &bytes);
                    }
                    if let Err(e) = transport.send(&bytes) {
                        failed = true;
                        self.transport_error(e);
                    }
                }
                Action::Complete(responder, completion) => responder(completion),
                Action::Notify(sink, event) => sink(&event),
                Action::Lifecycle(event) => self.emit(event),
                Action::CoreInitialized(payload) => transport.core_initialized(&payload),
                Action::PowerCycleTransport => {
                    if let Err(e) = transport.power_cycle() {
                        failed = true;
                        self.transport_error(e);
                    }
                }
                Action::CloseTransport => transport.close(),
            }
        }
    }
}
