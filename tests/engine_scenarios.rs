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

//! End-to-end engine scenarios against a scripted NFCC.

mod common;

use bytes::Bytes;
use common::*;
use nci::engine::PreDiscover;
use nci::packets::{DeactivationType, Message, Opcode, RfInterface, RfProtocol};
use nci::{Category, DiscoveryState, Engine, EngineConfig, Event, HalEvent, HalStatus};
use nci::LifecycleEvent;
use nci::{NciError, TechnologyMask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn set_config(len: usize) -> Message {
    Message::command(Opcode::CORE_SET_CONFIG, (0..len).map(|i| i as u8).collect::<Vec<_>>())
}

fn open_harness(config: EngineConfig) -> Harness {
    let h = Harness::new(config);
    h.open(0xff);
    h
}

#[test]
fn mtu_32_segments_and_reassembles() {
    let h = open_harness(EngineConfig::default().with_mtu(32));
    assert_eq!(h.engine.negotiated_mtu(), 32);
    h.transport.clear();

    let mut handle = h.engine.submit(set_config(64)).unwrap();
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(&sent[0][..3], &[0x30, 0x02, 0x20]);
    assert_eq!(&sent[1][..3], &[0x20, 0x02, 0x20]);

    let payload: Vec<u8> = (0..64u8).collect();
    let mut first = vec![0x50, 0x02, 0x20];
    first.extend(&payload[..32]);
    let mut second = vec![0x40, 0x02, 0x20];
    second.extend(&payload[32..]);
    h.engine.receive(&first);
    assert!(handle.try_take().is_none());
    h.engine.receive(&second);

    let rsp = handle.try_take().unwrap().unwrap();
    assert_eq!(rsp.payload, Bytes::from(payload));
    assert!(!h.engine.is_command_pending());
}

#[test]
fn inbound_data_is_not_limited_by_the_control_mtu() {
    let h = open_harness(EngineConfig::default().with_mtu(32));
    let received = Arc::new(Mutex::new(vec![]));
    let r = received.clone();
    h.engine.subscribe(Category::ConnectionData, move |event| {
        if let Event::Data { payload, .. } = event {
            r.lock().unwrap().push(payload.clone());
        }
    });
    h.discover();
    h.engine.receive(&activated_ntf_with_payload(0x00, 0xff));

    let mut packet = vec![0x00, 0x00, 40];
    packet.extend([0x6a; 40]);
    h.engine.receive(&packet);
    assert_eq!(*received.lock().unwrap(), vec![Bytes::from(vec![0x6a; 40])]);
    assert_eq!(h.engine.negotiated_mtu(), 32);
}

#[test]
fn negotiated_mtu_is_bounded_by_the_nfcc() {
    let h = Harness::new(EngineConfig::default());
    h.open(0x40);
    assert_eq!(h.engine.negotiated_mtu(), 0x40);
}

#[test]
fn second_submit_is_busy() {
    let h = open_harness(EngineConfig::default());
    let mut first = h.engine.submit(set_config(4)).unwrap();
    let err = h.engine.submit(Message::command(Opcode::CORE_GET_CONFIG, vec![0x00])).err();
    assert!(matches!(err, Some(NciError::Busy)));
    assert!(first.try_take().is_none());

    h.engine.receive(&[0x40, 0x02, 0x02, 0x00, 0x00]);
    assert!(first.try_take().unwrap().is_ok());
}

#[test]
fn late_response_is_dropped_while_another_command_waits() {
    let h = open_harness(EngineConfig::default().with_command_timeout(Duration::from_millis(100)));
    let mut handle = h.engine.submit(set_config(4)).unwrap();
    h.engine.tick(Instant::now() + Duration::from_millis(150));
    assert!(matches!(handle.try_take(), Some(Err(NciError::Timeout))));

    let mut next = h.engine.submit(Message::command(Opcode::CORE_GET_CONFIG, vec![0x00])).unwrap();
    h.engine.receive(&[0x40, 0x02, 0x02, 0x00, 0x00]);
    assert!(next.try_take().is_none());
    h.engine.receive(&[0x40, 0x03, 0x02, 0x00, 0x00]);
    assert!(next.try_take().unwrap().is_ok());
}

#[test]
fn retry_after_the_nfcc_dropped_the_command() {
    let h = open_harness(EngineConfig::default().with_command_timeout(Duration::from_millis(100)));
    let mut handle = h.engine.submit(set_config(4)).unwrap();
    h.engine.tick(Instant::now() + Duration::from_millis(150));
    assert!(matches!(handle.try_take(), Some(Err(NciError::Timeout))));

    // The first command never reached the NFCC, so only the retry is answered.
    let mut retry = h.engine.submit(set_config(4)).unwrap();
    h.engine.receive(&[0x40, 0x02, 0x02, 0x00, 0x00]);
    assert!(retry.try_take().unwrap().is_ok());
    assert!(!h.engine.is_command_pending());
    assert!(h.engine.submit(set_config(2)).is_ok());
}

#[test]
fn activation_requires_discovery() {
    let h = open_harness(EngineConfig::default());
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    h.engine.subscribe(Category::Activation, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    h.engine.receive(&activated_ntf(0x00));
    assert_eq!(h.engine.state(), DiscoveryState::Idle);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    h.discover();
    assert_eq!(h.engine.state(), DiscoveryState::Discovering);
    h.engine.receive(&activated_ntf(0x80));
    assert_eq!(h.engine.state().name(), "ListenActive");
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn power_cycle_aborts_before_reset() {
    let h = open_harness(EngineConfig::default());
    h.discover();
    h.engine.receive(&activated_ntf(0x00));
    assert_eq!(h.engine.state().name(), "PollActive");

    let log = h.log.clone();
    h.engine
        .submit_with(
            set_config(4),
            Box::new(move |completion| {
                if matches!(completion, Err(NciError::Aborted)) {
                    log.push("aborted");
                }
            }),
        )
        .unwrap();

    let reopened = h.engine.power_cycle();
    assert_eq!(h.engine.state(), DiscoveryState::PreOpen);
    let aborted = h.log.position("aborted").unwrap();
    let power_cycle = h.log.position("power_cycle").unwrap();
    let reset = h.log.last_position("send [20, 00, 01]").unwrap();
    assert!(aborted < power_cycle);
    assert!(power_cycle < reset);
    assert_eq!(h.transport.last().unwrap(), CORE_RESET_CMD);

    h.engine.receive(&CORE_RESET_RSP);
    h.engine.receive(&CORE_RESET_NTF);
    h.engine.receive(&core_init_rsp(0xff));
    h.engine.receive(&RF_DISCOVER_MAP_RSP);
    assert_eq!(reopened.wait(), HalStatus::Ok);
    assert_eq!(h.engine.state(), DiscoveryState::Idle);
}

#[test]
fn nci_1_bring_up() {
    let h = Harness::new(EngineConfig::default());
    let opened = h.engine.open().unwrap();
    h.engine.receive(&[0x40, 0x00, 0x03, 0x00, 0x10, 0x01]);
    assert_eq!(h.transport.last().unwrap(), vec![0x20, 0x01, 0x00]);
    h.engine.receive(&[
        0x40, 0x01, 0x13, 0x00, 0, 0, 0, 0, 0x02, 0x02, 0x03, 0x01, 0x00, 0x02, 0x40, 0x00, 0x01,
        0x00, 0, 0, 0, 0,
    ]);
    assert_eq!(h.engine.negotiated_mtu(), 0x40);
    h.engine.receive(&RF_DISCOVER_MAP_RSP);
    assert_eq!(opened.wait(), HalStatus::Ok);
    assert_eq!(
        h.events(),
        vec![LifecycleEvent::PostInitComplete, LifecycleEvent::OpenComplete(HalStatus::Ok)]
    );
}

#[test]
fn failed_reset_fails_open() {
    let h = Harness::new(EngineConfig::default());
    let opened = h.engine.open().unwrap();
    h.engine.receive(&[0x40, 0x00, 0x01, 0x03]);
    assert_eq!(opened.wait(), HalStatus::Failed);
    assert_eq!(h.engine.state(), DiscoveryState::PreOpen);
    assert!(h.engine.open().is_ok());
}

#[test]
fn missing_reset_notification_times_out() {
    let h = Harness::new(EngineConfig::default().with_command_timeout(Duration::from_millis(50)));
    let opened = h.engine.open().unwrap();
    h.engine.receive(&CORE_RESET_RSP);
    h.engine.tick(Instant::now() + Duration::from_secs(1));
    assert_eq!(opened.wait(), HalStatus::ErrCmdTimeout);
    assert_eq!(h.events(), vec![LifecycleEvent::OpenComplete(HalStatus::ErrCmdTimeout)]);
}

#[test]
fn open_twice_is_rejected() {
    let h = open_harness(EngineConfig::default());
    assert!(matches!(h.engine.open(), Err(NciError::InvalidState { operation: "open", .. })));
}

#[test]
fn rejected_or_dropped_waits_leave_no_waiter() {
    let h = open_harness(EngineConfig::default());
    assert!(h.engine.open().is_err());
    assert_eq!(h.engine.waiting(HalEvent::OpenComplete), 0);

    let h = Harness::new(EngineConfig::default());
    let opened = h.engine.open().unwrap();
    assert!(h.engine.open().is_err());
    assert_eq!(h.engine.waiting(HalEvent::OpenComplete), 1);
    drop(opened);
    for _ in 0..3 {
        drop(h.engine.power_cycle());
    }
    assert_eq!(h.engine.waiting(HalEvent::OpenComplete), 0);
    drop(h.engine.close());
    assert_eq!(h.engine.waiting(HalEvent::CloseComplete), 0);
}

#[test]
fn send_failure_resolves_the_command() {
    let h = open_harness(EngineConfig::default());
    let outcome = Arc::new(Mutex::new(None));
    let o = outcome.clone();
    h.transport.set_link_down(true);
    h.engine
        .submit_with(
            set_config(4),
            Box::new(move |completion| {
                *o.lock().unwrap() = Some(completion);
            }),
        )
        .unwrap();
    assert!(matches!(*outcome.lock().unwrap(), Some(Err(NciError::Transport(_)))));
    assert!(!h.engine.is_command_pending());
    assert!(h.events().contains(&LifecycleEvent::Error(HalStatus::ErrTransport)));

    // The link comes back: the next command is not refused as busy.
    h.transport.set_link_down(false);
    let mut handle = h.engine.submit(set_config(2)).unwrap();
    h.engine.receive(&[0x40, 0x02, 0x02, 0x00, 0x00]);
    assert!(handle.try_take().unwrap().is_ok());
}

#[test]
fn unsolicited_reset() {
    let h = open_harness(EngineConfig::default());
    let resets = Arc::new(AtomicUsize::new(0));
    let r = resets.clone();
    h.engine.subscribe(Category::DeviceReset, move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    let mut pending = h.engine.submit(set_config(1)).unwrap();

    h.engine.receive(&[0x60, 0x00, 0x05, 0x00, 0x00, 0x20, 0x00, 0x00]);
    assert!(matches!(pending.try_take(), Some(Err(NciError::Aborted))));
    assert_eq!(h.engine.state(), DiscoveryState::PreOpen);
    assert_eq!(h.events().last(), Some(&LifecycleEvent::Error(HalStatus::Failed)));
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[test]
fn restart_discovery_goes_through_idle() {
    let h = open_harness(EngineConfig::default());
    h.discover();
    h.engine.start_discovery(TechnologyMask::POLL_A).unwrap();
    assert_eq!(h.transport.last().unwrap(), vec![0x21, 0x06, 0x01, 0x00]);
    h.engine.receive(&RF_DEACTIVATE_RSP);
    assert_eq!(h.transport.last().unwrap(), vec![0x21, 0x03, 0x03, 0x01, 0x00, 0x01]);
    h.engine.receive(&RF_DISCOVER_RSP);
    assert_eq!(h.engine.state(), DiscoveryState::Discovering);
}

#[test]
fn discovery_argument_and_state_checks() {
    let h = Harness::new(EngineConfig::default());
    assert!(matches!(
        h.engine.start_discovery(TechnologyMask::NONE),
        Err(NciError::InvalidParameter(_))
    ));
    let result = h.engine.start_discovery(TechnologyMask::ALL);
    assert!(matches!(result, Err(NciError::InvalidState { .. })));
    assert!(matches!(h.engine.submit(set_config(1)), Err(NciError::InvalidState { .. })));
}

#[test]
fn discovery_results_and_selection() {
    let h = open_harness(EngineConfig::default());
    let results = Arc::new(Mutex::new(vec![]));
    let r = results.clone();
    h.engine.subscribe(Category::DiscoveryResult, move |event| {
        if let Event::Discovered(result) = event {
            r.lock().unwrap().push(result.discovery_id);
        }
    });
    h.discover();
    h.engine.receive(&[0x61, 0x03, 0x05, 0x01, 0x02, 0x00, 0x00, 0x02]);
    h.engine.receive(&[0x61, 0x03, 0x05, 0x02, 0x04, 0x00, 0x00, 0x00]);
    assert_eq!(*results.lock().unwrap(), vec![1, 2]);
    assert_eq!(h.engine.discovered().len(), 2);

    h.engine.select_target(2, RfProtocol::IsoDep, RfInterface::IsoDep).unwrap();
    assert_eq!(h.transport.last().unwrap(), vec![0x21, 0x04, 0x03, 0x02, 0x04, 0x02]);
    h.engine.receive(&[0x41, 0x04, 0x01, 0x00]);
    h.engine.receive(&activated_ntf(0x00));
    assert_eq!(h.engine.state().name(), "PollActive");
}

#[test]
fn data_exchange_with_credits() {
    let h = open_harness(EngineConfig::default());
    let received = Arc::new(Mutex::new(vec![]));
    let r = received.clone();
    h.engine.subscribe(Category::ConnectionData, move |event| {
        if let Event::Data { payload, .. } = event {
            r.lock().unwrap().push(payload.clone());
        }
    });
    assert!(h.engine.send_data(0, Bytes::from_static(&[0x00])).is_err());

    h.discover();
    h.engine.receive(&activated_ntf(0x00));
    h.transport.clear();
    h.engine.send_data(0, Bytes::from_static(&[0x00, 0xa4])).unwrap();
    h.engine.send_data(0, Bytes::from_static(&[0x00, 0xb0])).unwrap();
    assert_eq!(h.transport.sent(), vec![vec![0x00, 0x00, 0x02, 0x00, 0xa4]]);
    assert_eq!(h.engine.state().name(), "Transaction");

    h.engine.receive(&[0x60, 0x06, 0x03, 0x01, 0x00, 0x01]);
    assert_eq!(h.transport.last().unwrap(), vec![0x00, 0x00, 0x02, 0x00, 0xb0]);

    h.engine.receive(&[0x00, 0x00, 0x02, 0x90, 0x00]);
    assert_eq!(*received.lock().unwrap(), vec![Bytes::from_static(&[0x90, 0x00])]);

    h.engine.receive(&[0x61, 0x06, 0x02, 0x03, 0x01]);
    assert_eq!(h.engine.state(), DiscoveryState::Discovering);
    assert!(h.engine.send_data(0, Bytes::from_static(&[0x00])).is_err());
}

#[test]
fn host_deactivation_from_discovering() {
    let h = open_harness(EngineConfig::default());
    h.discover();
    h.engine.deactivate(DeactivationType::IdleMode).unwrap();
    h.engine.receive(&RF_DEACTIVATE_RSP);
    assert_eq!(h.engine.state(), DiscoveryState::Idle);
    assert!(h.engine.deactivate(DeactivationType::IdleMode).is_err());
}

struct ManualPreDiscover(Arc<AtomicUsize>);

impl PreDiscover for ManualPreDiscover {
    fn pre_discover(&self) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn is_complete(&self, ntf: &Message) -> bool {
        ntf.opcode() == Some(Opcode::new(0xf, 0x01))
    }
}

#[test]
fn pre_discover_without_vendor_work() {
    let h = open_harness(EngineConfig::default());
    assert!(!h.engine.pre_discover());
    assert_eq!(h.events().last(), Some(&LifecycleEvent::PreDiscoverComplete(HalStatus::Ok)));
}

#[test]
fn discovery_waits_for_pre_discover() {
    let transport = MockTransport::new(Log::default());
    let events = Arc::new(Mutex::new(vec![]));
    let e = events.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Engine::builder()
        .transport(transport.clone())
        .lifecycle(move |event| e.lock().unwrap().push(event))
        .pre_discover(ManualPreDiscover(calls.clone()))
        .build()
        .unwrap();
    let opened = engine.open().unwrap();
    engine.receive(&CORE_RESET_RSP);
    engine.receive(&CORE_RESET_NTF);
    engine.receive(&core_init_rsp(0xff));
    engine.receive(&RF_DISCOVER_MAP_RSP);
    assert_eq!(opened.wait(), HalStatus::Ok);

    assert!(engine.pre_discover());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    transport.clear();
    engine.start_discovery(TechnologyMask::ALL).unwrap();
    assert!(transport.sent().is_empty());

    // A proprietary notification recognised by the hook completes the work.
    engine.receive(&[0x6f, 0x01, 0x00]);
    let last = events.lock().unwrap().last().copied();
    assert_eq!(last, Some(LifecycleEvent::PreDiscoverComplete(HalStatus::Ok)));
    assert_eq!(&transport.last().unwrap()[..2], &[0x21, 0x03]);

    // Completion is reported once.
    engine.complete_pre_discover(HalStatus::Failed);
    let completions = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::PreDiscoverComplete(_)))
        .count();
    assert_eq!(completions, 1);
}

#[test]
fn control_handover() {
    let h = open_harness(EngineConfig::default());
    h.engine.request_control();
    h.engine.control_granted();
    assert!(matches!(
        h.engine.submit(set_config(1)),
        Err(NciError::InvalidState { state: "ControlGranted", .. })
    ));
    h.engine.release_control();
    assert!(h.engine.submit(set_config(1)).is_ok());
    let events = h.events();
    assert!(events.contains(&LifecycleEvent::ControlRequested));
    assert_eq!(events.last(), Some(&LifecycleEvent::ControlReleased));
}

#[test]
fn close_aborts_and_closes_transport() {
    let h = open_harness(EngineConfig::default());
    let mut pending = h.engine.submit(set_config(1)).unwrap();
    // Half a segmented notification.
    h.engine.receive(&[0x70, 0x03, 0x01, 0x01]);

    let closed = h.engine.close();
    assert_eq!(closed.wait(), HalStatus::Ok);
    assert!(matches!(pending.try_take(), Some(Err(NciError::Aborted))));
    assert_eq!(h.engine.state(), DiscoveryState::PreOpen);
    assert!(h.log.position("close").is_some());
    assert_eq!(h.events().last(), Some(&LifecycleEvent::CloseComplete));
}

#[test]
fn engine_managed_opcodes_are_refused() {
    let h = open_harness(EngineConfig::default());
    let err = h.engine.submit(Message::command(Opcode::RF_DISCOVER, vec![0x00])).err();
    assert!(matches!(err, Some(NciError::InvalidParameter(_))));
}

#[test]
fn sinks_may_call_back_into_the_engine() {
    let h = open_harness(EngineConfig::default());
    let engine = h.engine.clone();
    h.engine.subscribe(Category::Deactivation, move |_| {
        let _ = engine.close();
    });
    h.discover();
    h.engine.receive(&activated_ntf(0x00));
    h.engine.receive(&[0x61, 0x06, 0x02, 0x00, 0x01]);
    assert_eq!(h.engine.state(), DiscoveryState::PreOpen);
}
