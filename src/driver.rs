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

//! Tokio tasks pumping a byte stream to and from an [`Engine`].

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{NciError, Result};
use crate::lifecycle::LifecycleEvent;
use crate::transport::ChannelTransport;
use bytes::{Bytes, BytesMut};
use log::{debug, error};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Period of the timer driving command deadlines.
pub const TICK_PERIOD: Duration = Duration::from_millis(5);

/// Feed bytes read from the NFCC to the engine, and tick its timers.
/// Returns when the stream ends or fails.
pub async fn dispatch_incoming<R>(engine: Engine, mut reader: R, period: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(1024);
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            result = reader.read_buf(&mut buffer) => match result {
                Ok(0) => {
                    let error = NciError::Transport("connection closed by the NFCC".into());
                    engine.transport_error(error);
                    break;
                }
                Ok(_) => {
                    engine.receive(&buffer);
                    buffer.clear();
                }
                Err(e) => {
                    engine.transport_error(e.into());
                    break;
                }
            },
            now = timer.tick() => engine.tick(now.into_std()),
        }
    }
    debug!("incoming dispatch is terminated");
}

/// Write the packets queued by a [`ChannelTransport`].
pub async fn dispatch_outgoing<W>(mut out_rx: UnboundedReceiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = out_rx.recv().await {
        writer.write_all(&packet).await?;
    }
    debug!("outgoing dispatch is terminated");
    Ok(())
}

/// Tick the engine timers forever. `ready` is signalled once running.
pub async fn tick_loop(engine: Engine, period: Duration, ready: oneshot::Sender<()>) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if ready.send(()).is_err() {
        debug!("nobody waits for the timer worker");
    }
    loop {
        let now = timer.tick().await;
        engine.tick(now.into_std());
    }
}

/// An engine wired to a byte stream.
pub struct Connection {
    /// The engine
    pub engine: Engine,
    incoming: JoinHandle<()>,
    outgoing: JoinHandle<Result<()>>,
}

impl Connection {
    /// Stop both tasks.
    pub fn shutdown(self) {
        self.incoming.abort();
        self.outgoing.abort();
    }
}

/// Create an engine exchanging packets over `reader` and `writer`.
pub fn run<R, W>(
    reader: R,
    writer: W,
    config: EngineConfig,
    lifecycle: impl Fn(LifecycleEvent) + Send + Sync + 'static,
) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (transport, out_rx) = ChannelTransport::new();
    let engine = Engine::new(config, transport, lifecycle);
    let incoming = tokio::spawn(dispatch_incoming(engine.clone(), reader, TICK_PERIOD));
    let outgoing = tokio::spawn(async move {
        let result = dispatch_outgoing(out_rx, writer).await;
        if let Err(e) = &result {
            error!("outgoing dispatch failed: {}", e);
        }
        result
    });
    Connection { engine, incoming, outgoing }
}

/// Connect to an NFCC reachable over TCP.
pub async fn connect(
    address: SocketAddr,
    config: EngineConfig,
    lifecycle: impl Fn(LifecycleEvent) + Send + Sync + 'static,
) -> Result<Connection> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Ok(run(reader, writer, config, lifecycle))
}
