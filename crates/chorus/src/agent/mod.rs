//! Node-side agent: reconnecting hub connection, load reporting, and
//! worker supervision.

mod supervisor;

pub use supervisor::{ProcessLauncher, Supervisor, WorkerHandle, WorkerLauncher, WorkerMessage};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chorus_protocol::{Dispatch, Frame, Identify, WorkerCommand};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::sys;

/// Heartbeat period once a connection is up.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed delay before reconnecting after any close or error. No
/// growth, no retry cutoff: the hub is assumed reachable eventually.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// WebSocket URL of the hub, e.g. `ws://hub.internal:8443`.
    pub hub_url: String,
    /// Stable id of this node.
    pub agent_id: String,
    /// Shared secret presented in IDENTIFY.
    pub token: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl AgentConfig {
    pub fn new(
        hub_url: impl Into<String>,
        agent_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            hub_url: hub_url.into(),
            agent_id: agent_id.into(),
            token: token.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Agent {
    pub fn new(config: AgentConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self { config, launcher }
    }

    /// Connect to the hub and serve until told to stop, reconnecting
    /// indefinitely on any close or error.
    pub async fn run(self) {
        info!(
            "agent {} connecting to {}",
            self.config.agent_id, self.config.hub_url
        );

        loop {
            match connect_async(self.config.hub_url.as_str()).await {
                Ok((ws, _response)) => {
                    if let Err(e) = self.serve(ws).await {
                        warn!("hub connection lost: {e:#}");
                    }
                }
                Err(e) => {
                    warn!("failed to reach hub at {}: {e}", self.config.hub_url);
                }
            }

            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One connection's lifetime. Workers are scoped to it: losing the
    /// hub tears down this node's sessions, since the hub will rebind
    /// them to whichever agents it still sees.
    async fn serve(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> anyhow::Result<()> {
        let (mut sink, mut stream) = ws.split();

        self.send(
            &mut sink,
            Frame::Identify {
                d: Identify {
                    id: self.config.agent_id.clone(),
                    token: self.config.token.clone(),
                },
            },
        )
        .await?;

        let (mut supervisor, mut messages) = Supervisor::new(self.launcher.clone());

        // First tick fires immediately, so a heartbeat follows the
        // IDENTIFY without waiting a full period.
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(&mut supervisor, &mut sink, text.as_str()).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        anyhow::bail!("hub closed the connection");
                    }
                    Some(Ok(_)) => {} // ping/pong/binary
                    Some(Err(e)) => return Err(e).context("hub transport error"),
                },
                _ = heartbeat.tick() => {
                    self.send(&mut sink, Frame::Heartbeat { d: sys::load_sample() }).await?;
                }
                Some(msg) = messages.recv() => match msg {
                    WorkerMessage::Event { guild_id, session_id, event } => {
                        if supervisor.should_relay(&guild_id, &session_id) {
                            self.send(&mut sink, Frame::dispatch(event.into())).await?;
                        }
                    }
                    WorkerMessage::Exited { guild_id, session_id } => {
                        supervisor.worker_exited(&guild_id, &session_id);
                    }
                },
            }
        }
    }

    async fn handle_frame(
        &self,
        supervisor: &mut Supervisor,
        sink: &mut WsSink,
        text: &str,
    ) -> anyhow::Result<()> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unknown frame from hub: {e}");
                return Ok(());
            }
        };

        match frame {
            Frame::Connected { .. } => {
                info!("identified with hub as {}", self.config.agent_id);
            }
            Frame::Dispatch { dispatch } => match dispatch {
                Dispatch::Play(play) => {
                    supervisor.play(play).await;
                    // Report load promptly after accepting new work.
                    self.send(sink, Frame::Heartbeat { d: sys::load_sample() })
                        .await?;
                }
                Dispatch::Stop(r) => supervisor.stop(&r.guild_id),
                Dispatch::SetVolume(v) => {
                    supervisor
                        .forward(&v.guild_id, WorkerCommand::SetVolume { volume: v.volume })
                        .await;
                }
                Dispatch::Pause(r) => {
                    supervisor.forward(&r.guild_id, WorkerCommand::Pause).await;
                }
                Dispatch::Resume(r) => {
                    supervisor.forward(&r.guild_id, WorkerCommand::Resume).await;
                }
                event => {
                    warn!("unexpected dispatch from hub for session {}", event.guild_id());
                }
            },
            _ => warn!("unexpected opcode from hub"),
        }

        Ok(())
    }

    async fn send(&self, sink: &mut WsSink, frame: Frame) -> anyhow::Result<()> {
        let json = serde_json::to_string(&frame).context("serializing frame")?;
        sink.send(Message::text(json))
            .await
            .context("sending frame to hub")?;
        Ok(())
    }
}
