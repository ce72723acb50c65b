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

//! NCI host connecting to an NFCC over TCP, e.g. the casimir emulator.

use anyhow::{anyhow, Result};
use argh::FromArgs;
use log::{info, warn};
use nci::driver;
use nci::{Category, EngineConfig, Event, HalStatus, TechnologyMask};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(FromArgs, Debug)]
/// NCI host.
struct Opt {
    #[argh(option, default = "IpAddr::V4(Ipv4Addr::LOCALHOST)")]
    /// address of the NFCC.
    address: IpAddr,
    #[argh(option, default = "7000")]
    /// TCP port of the NFCC NCI server.
    nci_port: u16,
    #[argh(option, default = "255")]
    /// control packet MTU before negotiation.
    mtu: usize,
    #[argh(option, default = "2000")]
    /// command timeout in milliseconds.
    timeout_ms: u64,
    #[argh(option, default = "0x7f", from_str_fn(parse_mask))]
    /// technology mask used for discovery
    /// (poll A=0x01 B=0x02 F=0x04 V=0x08, listen A=0x10 B=0x20 F=0x40).
    technologies: u8,
    #[argh(switch)]
    /// start RF discovery once the session is open.
    discover: bool,
}

fn parse_mask(value: &str) -> std::result::Result<u8, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid technology mask {}: {}", value, e))
}

async fn run() -> Result<()> {
    let opt: Opt = argh::from_env();
    let config = EngineConfig::default()
        .with_mtu(opt.mtu)
        .with_command_timeout(Duration::from_millis(opt.timeout_ms))
        .with_technologies(TechnologyMask(opt.technologies));
    let address = SocketAddr::new(opt.address, opt.nci_port);
    let conn = driver::connect(address, config, |event| info!("lifecycle: {:?}", event)).await?;
    let engine = conn.engine.clone();
    info!("connected to {}", address);

    engine.subscribe(Category::DiscoveryResult, |event| {
        if let Event::Discovered(result) = event {
            info!(
                "discovered {:?} ({:?}), id {}",
                result.protocol, result.technology, result.discovery_id
            );
        }
    });
    engine.subscribe(Category::Activation, |event| {
        if let Event::Activated(activation) = event {
            info!("activated {:?} over {:?}", activation.protocol, activation.interface);
        }
    });
    engine.subscribe(Category::Deactivation, |event| info!("{:?}", event));
    engine.subscribe(Category::ConnectionData, |event| {
        if let Event::Data { conn_id, payload } = event {
            info!("conn {}: {:02x?}", conn_id, &payload[..]);
        }
    });
    engine.subscribe(Category::GenericError, |event| warn!("{:?}", event));

    match engine.open()?.await {
        HalStatus::Ok => info!("session open, MTU {}", engine.negotiated_mtu()),
        status => return Err(anyhow!("session bring-up failed: {:?}", status)),
    }
    if opt.discover {
        engine.start_discovery(engine.config().technologies)?;
    }

    tokio::signal::ctrl_c().await?;
    engine.close().await;
    conn.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run().await
}
