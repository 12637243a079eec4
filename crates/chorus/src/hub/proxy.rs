use std::sync::atomic::{AtomicU64, Ordering};

use chorus_protocol::{Frame, Heartbeat};
use tokio::sync::mpsc;

use super::session::SessionError;

/// Bit pattern meaning "no rankable load yet". Set until the first
/// usable heartbeat arrives, so a freshly identified agent is excluded
/// from selection instead of looking idle.
const UNRANKED: u64 = u64::MAX;

/// Hub-side handle for one identified agent connection.
///
/// Commands are queued onto the connection's writer task; sends are
/// fire-and-forget with no per-command acknowledgment.
pub struct AgentProxy {
    agent_id: String,
    /// Normalized load score stored as `f64` bits.
    load: AtomicU64,
    tx: mpsc::Sender<Frame>,
}

impl AgentProxy {
    pub fn new(agent_id: String, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            agent_id,
            load: AtomicU64::new(UNRANKED),
            tx,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Last reported load score, lower is better. `None` while the
    /// agent has not reported a rankable heartbeat.
    pub fn load(&self) -> Option<f64> {
        let bits = self.load.load(Ordering::Relaxed);
        if bits == UNRANKED {
            None
        } else {
            Some(f64::from_bits(bits))
        }
    }

    pub fn update_load(&self, heartbeat: &Heartbeat) {
        let bits = match heartbeat.load() {
            Some(score) => score.to_bits(),
            None => UNRANKED,
        };
        self.load.store(bits, Ordering::Relaxed);
    }

    /// Queue a frame for delivery to the agent.
    pub async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SessionError::AgentGone)
    }
}
