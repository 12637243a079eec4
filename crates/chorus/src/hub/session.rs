use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chorus_protocol::{Dispatch, Frame, Play, SessionDescriptor, SessionRef, SetVolume};
use log::debug;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use super::proxy::AgentProxy;
use super::{Hub, PlaybackEvent};

#[derive(Debug, Error)]
pub enum SessionError {
    /// No identified agent has reported a usable load yet.
    #[error("no agent available")]
    NoAgentAvailable,

    /// The bound agent's connection closed before the command was
    /// queued.
    #[error("agent is gone")]
    AgentGone,
}

/// Control surface for one guild voice session.
///
/// Binds to the least-loaded agent on first use and sticks to it by
/// id: the live proxy is looked up in the registry on every command
/// rather than cached, so an agent that disconnects is replaced on the
/// next command instead of leaving the session wedged on a dead
/// handle.
pub struct ClientSession {
    hub: Arc<Hub>,
    descriptor: SessionDescriptor,
    events: mpsc::Sender<PlaybackEvent>,
    bound: Mutex<Option<String>>,
    playing: AtomicBool,
    paused: AtomicBool,
}

impl ClientSession {
    pub(crate) fn new(
        hub: Arc<Hub>,
        descriptor: SessionDescriptor,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> Self {
        Self {
            hub,
            descriptor,
            events,
            bound: Mutex::new(None),
            playing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.descriptor.guild_id
    }

    /// Local view only; the worker owns the authoritative state.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// Local view only; the worker owns the authoritative state.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Id of the agent this session is currently bound to, if any.
    pub async fn bound_agent(&self) -> Option<String> {
        self.bound.lock().await.clone()
    }

    pub async fn play(&self, url: impl Into<String>) -> Result<(), SessionError> {
        self.send(Dispatch::Play(Play {
            url: url.into(),
            session: self.descriptor.clone(),
        }))
        .await?;
        self.playing.store(true, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.send(Dispatch::Stop(self.session_ref())).await?;
        self.playing.store(false, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.send(Dispatch::SetVolume(SetVolume {
            guild_id: self.descriptor.guild_id.clone(),
            volume,
        }))
        .await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.send(Dispatch::Pause(self.session_ref())).await?;
        self.paused.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.send(Dispatch::Resume(self.session_ref())).await?;
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn session_ref(&self) -> SessionRef {
        SessionRef {
            guild_id: self.descriptor.guild_id.clone(),
        }
    }

    async fn send(&self, dispatch: Dispatch) -> Result<(), SessionError> {
        let agent = self.resolve_agent().await?;
        agent.send(Frame::dispatch(dispatch)).await
    }

    /// Reuse the bound agent while it is still registered; otherwise
    /// bind to the current least-loaded agent.
    async fn resolve_agent(&self) -> Result<Arc<AgentProxy>, SessionError> {
        let mut bound = self.bound.lock().await;

        if let Some(id) = bound.as_deref() {
            if let Some(agent) = self.hub.agent(id) {
                return Ok(agent);
            }
            debug!(
                "agent {id} is gone, rebinding session {}",
                self.descriptor.guild_id
            );
        }

        let agent = self
            .hub
            .least_loaded_agent()
            .ok_or(SessionError::NoAgentAvailable)?;
        *bound = Some(agent.agent_id().to_string());
        Ok(agent)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.hub
            .drop_subscription(&self.descriptor.guild_id, &self.events);
    }
}
