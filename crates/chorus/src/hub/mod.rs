//! Central hub: agent admission, load-ranked registry, and command /
//! event routing between client sessions and agents.

mod proxy;
mod session;

pub use proxy::AgentProxy;
pub use session::{ClientSession, SessionError};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chorus_protocol::{Connected, Dispatch, Frame, Identify, SessionDescriptor};
use dashmap::DashMap;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use uuid::Uuid;

/// Window an inbound connection gets to present a valid IDENTIFY
/// before it is dropped.
pub const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Command queue depth per agent connection.
const CHANNEL_CAPACITY: usize = 64;

/// Event queue depth per client session.
const EVENT_CAPACITY: usize = 16;

/// Lifecycle event delivered to a client session's subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Ready,
    Start,
    End,
}

pub struct Hub {
    token: String,
    identify_timeout: Duration,
    agents: DashMap<String, Arc<AgentProxy>>,
    subscriptions: DashMap<String, mpsc::Sender<PlaybackEvent>>,
}

impl Hub {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Self::with_identify_timeout(token, IDENTIFY_TIMEOUT)
    }

    pub fn with_identify_timeout(token: impl Into<String>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            identify_timeout: window,
            agents: DashMap::new(),
            subscriptions: DashMap::new(),
        })
    }

    /// Accept agent connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await.context("accepting connection")?;
            debug!("inbound connection from {addr}");
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(stream).await {
                    debug!("agent connection closed: {e:#}");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        let ws = accept_async(stream).await.context("websocket handshake")?;
        let (mut sink, mut stream) = ws.split();

        // The first frame must be a valid IDENTIFY within the window;
        // anything else drops the connection without a reply.
        let identify = match timeout(self.identify_timeout, read_identify(&mut stream)).await {
            Ok(Some(identify)) => identify,
            Ok(None) => anyhow::bail!("connection closed before identify"),
            Err(_) => anyhow::bail!("identify timeout"),
        };
        if identify.token != self.token {
            anyhow::bail!("agent {} presented an invalid token", identify.id);
        }

        let agent_id = identify.id;
        let (tx, mut rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let proxy = Arc::new(AgentProxy::new(agent_id.clone(), tx));
        self.agents.insert(agent_id.clone(), proxy.clone());
        info!("agent {agent_id} identified");

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize frame: {e}");
                        continue;
                    }
                };
                if sink.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
        });

        let _ = proxy
            .send(Frame::Connected {
                d: Connected {
                    token: Uuid::new_v4().to_string(),
                },
            })
            .await;

        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("agent {agent_id} transport error: {e}");
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue, // ping/pong/binary
            };
            match serde_json::from_str::<Frame>(text.as_str()) {
                Ok(Frame::Heartbeat { d }) => proxy.update_load(&d),
                Ok(Frame::Dispatch { dispatch }) if dispatch.is_event() => {
                    self.route_event(dispatch);
                }
                Ok(_) => warn!("unexpected frame from agent {agent_id}"),
                Err(e) => warn!("unknown frame from agent {agent_id}: {e}"),
            }
        }

        // Deregister, unless a newer connection for the same id has
        // already replaced this proxy.
        self.agents
            .remove_if(&agent_id, |_, p| Arc::ptr_eq(p, &proxy));
        writer.abort();
        info!("agent {agent_id} disconnected");
        Ok(())
    }

    /// The identified agent with the lowest reported load. Unranked
    /// agents are skipped; ties break toward the smaller agent id so
    /// the result is deterministic.
    pub fn least_loaded_agent(&self) -> Option<Arc<AgentProxy>> {
        let mut best: Option<(f64, Arc<AgentProxy>)> = None;
        for entry in self.agents.iter() {
            let Some(load) = entry.value().load() else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((b, proxy)) => {
                    load < *b || (load == *b && entry.key().as_str() < proxy.agent_id())
                }
            };
            if better {
                best = Some((load, entry.value().clone()));
            }
        }
        best.map(|(_, proxy)| proxy)
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<AgentProxy>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Open a control handle and event subscription for one session.
    /// A previous subscription under the same guild id is replaced.
    pub fn open_session(
        self: &Arc<Self>,
        descriptor: SessionDescriptor,
    ) -> (ClientSession, mpsc::Receiver<PlaybackEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.subscriptions
            .insert(descriptor.guild_id.clone(), tx.clone());
        (ClientSession::new(self.clone(), descriptor, tx), rx)
    }

    pub(crate) fn drop_subscription(&self, guild_id: &str, tx: &mpsc::Sender<PlaybackEvent>) {
        self.subscriptions
            .remove_if(guild_id, |_, sub| sub.same_channel(tx));
    }

    /// Deliver an agent-reported lifecycle event to the session
    /// subscribed under its guild id, if any.
    fn route_event(&self, dispatch: Dispatch) {
        let event = match &dispatch {
            Dispatch::Ready(_) => PlaybackEvent::Ready,
            Dispatch::Start(_) => PlaybackEvent::Start,
            Dispatch::End(_) => PlaybackEvent::End,
            _ => return,
        };
        let guild_id = dispatch.guild_id();
        match self.subscriptions.get(guild_id) {
            Some(sub) => {
                if sub.try_send(event).is_err() {
                    debug!("subscriber for session {guild_id} lagging or gone");
                }
            }
            None => debug!("event for unsubscribed session {guild_id}"),
        }
    }
}

async fn read_identify(
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Option<Identify> {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        return match serde_json::from_str::<Frame>(text.as_str()) {
            Ok(Frame::Identify { d }) => Some(d),
            _ => None,
        };
    }
    None
}
