//! Canonical protocol types for chorus voice routing.
//!
//! Two vocabularies live here:
//!
//! - [`Frame`]: messages exchanged on the hub <-> agent WebSocket. One
//!   JSON object per text message; the transport delivers discrete
//!   messages, so there is no extra framing.
//! - [`WorkerCommand`] / [`WorkerEvent`]: messages exchanged between an
//!   agent and the worker process it supervises, as newline-delimited
//!   JSON over the child's stdin/stdout.

use serde::{Deserialize, Serialize};

/// A frame on the hub <-> agent connection.
///
/// Tagged by `op`; dispatch frames carry a nested command or event
/// tagged by `t` with payload `d`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// First frame an agent must send after the transport opens.
    Identify { d: Identify },

    /// Optional hub acknowledgement of a successful identify.
    Connected { d: Connected },

    /// Periodic load report from an agent. No reply.
    Heartbeat { d: Heartbeat },

    /// A routed command (hub -> agent) or lifecycle event (agent -> hub).
    Dispatch {
        #[serde(flatten)]
        dispatch: Dispatch,
    },
}

impl Frame {
    pub fn dispatch(dispatch: Dispatch) -> Self {
        Frame::Dispatch { dispatch }
    }
}

/// Agent credentials presented on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    /// Stable per-node agent id.
    pub id: String,
    /// Shared secret authenticating the agent to the hub.
    pub token: String,
}

/// Hub acknowledgement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connected {
    pub token: String,
}

/// Load report. `load` is derived as `loadavg[0] / cpus`; an agent
/// reporting zero cpus is unranked and excluded from selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// 1/5/15 minute load averages.
    pub loadavg: [f64; 3],
    /// Logical cpu count.
    pub cpus: u32,
}

impl Heartbeat {
    /// Normalized load score, lower is better. `None` when unrankable.
    pub fn load(&self) -> Option<f64> {
        if self.cpus == 0 {
            return None;
        }
        Some(self.loadavg[0] / self.cpus as f64)
    }
}

/// Payload of a dispatch frame: playback commands flowing hub -> agent
/// and lifecycle events flowing agent -> hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "snake_case")]
pub enum Dispatch {
    // Commands (hub -> agent)
    Play(Play),
    Stop(SessionRef),
    SetVolume(SetVolume),
    Pause(SessionRef),
    Resume(SessionRef),

    // Events (agent -> hub)
    Ready(EventPayload),
    Start(EventPayload),
    End(EventPayload),
}

impl Dispatch {
    /// The session this dispatch belongs to.
    pub fn guild_id(&self) -> &str {
        match self {
            Dispatch::Play(p) => &p.session.guild_id,
            Dispatch::Stop(r) | Dispatch::Pause(r) | Dispatch::Resume(r) => &r.guild_id,
            Dispatch::SetVolume(v) => &v.guild_id,
            Dispatch::Ready(e) | Dispatch::Start(e) | Dispatch::End(e) => &e.guild_id,
        }
    }

    /// True for lifecycle events, false for commands.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Dispatch::Ready(_) | Dispatch::Start(_) | Dispatch::End(_)
        )
    }
}

/// Start playing a source URL for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Play {
    pub url: String,
    pub session: SessionDescriptor,
}

/// Command payload carrying only the routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRef {
    pub guild_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetVolume {
    pub guild_id: String,
    pub volume: f32,
}

/// Lifecycle event payload, scoped to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub guild_id: String,
}

/// Full identity of a guild voice session.
///
/// `guild_id` is the routing key and must be unique among concurrently
/// active sessions. `session_id` identifies one binding of the session
/// to a voice server; a changed `session_id` for the same guild means
/// the session moved and any worker built from the old descriptor is
/// stale. `token` and `session_id` authenticate the worker to the
/// voice transport and are opaque to hub and agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub guild_id: String,
    /// Voice transport endpoint (`host[:port]`). May be empty, in
    /// which case no voice session can be established.
    #[serde(default)]
    pub endpoint: String,
    pub channel_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

impl SessionDescriptor {
    /// Host part of the endpoint, or `None` when the endpoint is empty.
    pub fn endpoint_host(&self) -> Option<&str> {
        if self.endpoint.is_empty() {
            return None;
        }
        Some(self.endpoint.split(':').next().unwrap_or(&self.endpoint))
    }

    /// The id the voice transport treats as the server: the guild id,
    /// falling back to the channel id.
    pub fn server_id(&self) -> &str {
        if self.guild_id.is_empty() {
            &self.channel_id
        } else {
            &self.guild_id
        }
    }
}

/// Command sent from an agent to its worker process.
///
/// Note that an agent-issued STOP is a supervisory teardown and is
/// never delivered over IPC; `Stop` exists for in-worker use (implicit
/// stop before a new play) and for completeness of the vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerCommand {
    Play(Play),
    Stop,
    SetVolume { volume: f32 },
    Pause,
    Resume,
}

/// Lifecycle event emitted by a worker process on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready(EventPayload),
    Start(EventPayload),
    End(EventPayload),
}

impl From<WorkerEvent> for Dispatch {
    fn from(event: WorkerEvent) -> Self {
        match event {
            WorkerEvent::Ready(e) => Dispatch::Ready(e),
            WorkerEvent::Start(e) => Dispatch::Start(e),
            WorkerEvent::End(e) => Dispatch::End(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            guild_id: "42".to_string(),
            endpoint: "voice.example.com:443".to_string(),
            channel_id: "7".to_string(),
            user_id: "9000".to_string(),
            session_id: "sess-1".to_string(),
            token: "voice-token".to_string(),
        }
    }

    #[test]
    fn test_identify_wire_shape() {
        let frame = Frame::Identify {
            d: Identify {
                id: "node-1".to_string(),
                token: "secret".to_string(),
            },
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"identify\""));
        assert!(json.contains("\"id\":\"node-1\""));

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_dispatch_play_wire_shape() {
        let frame = Frame::dispatch(Dispatch::Play(Play {
            url: "http://x/track.mp3".to_string(),
            session: descriptor(),
        }));

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"dispatch\""));
        assert!(json.contains("\"t\":\"play\""));
        assert!(json.contains("\"guild_id\":\"42\""));

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_dispatch_set_volume_tag() {
        let frame = Frame::dispatch(Dispatch::SetVolume(SetVolume {
            guild_id: "42".to_string(),
            volume: 0.5,
        }));

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"t\":\"set_volume\""));
    }

    #[test]
    fn test_heartbeat_load() {
        let hb = Heartbeat {
            timestamp: 0,
            loadavg: [1.0, 1.0, 1.0],
            cpus: 4,
        };
        assert_eq!(hb.load(), Some(0.25));

        let unranked = Heartbeat {
            timestamp: 0,
            loadavg: [1.0, 1.0, 1.0],
            cpus: 0,
        };
        assert_eq!(unranked.load(), None);
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let frame = Frame::Heartbeat {
            d: Heartbeat {
                timestamp: 1_700_000_000_000,
                loadavg: [0.5, 0.25, 0.125],
                cpus: 8,
            },
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"heartbeat\""));
        assert!(json.contains("\"loadavg\""));

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_event_guild_id() {
        let d = Dispatch::End(EventPayload {
            guild_id: "42".to_string(),
        });
        assert_eq!(d.guild_id(), "42");
        assert!(d.is_event());

        let d = Dispatch::Stop(SessionRef {
            guild_id: "42".to_string(),
        });
        assert!(!d.is_event());
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let err = serde_json::from_str::<Frame>(r#"{"op":"shred","d":{}}"#);
        assert!(err.is_err());

        let err = serde_json::from_str::<Frame>(r#"{"op":"dispatch","t":"rewind","d":{}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_worker_command_round_trip() {
        let cmd = WorkerCommand::SetVolume { volume: 0.8 };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"set_volume\""));

        let parsed: WorkerCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cmd);

        let pause = serde_json::to_string(&WorkerCommand::Pause).unwrap();
        assert!(pause.contains("\"type\":\"pause\""));
    }

    #[test]
    fn test_worker_event_into_dispatch() {
        let event = WorkerEvent::Start(EventPayload {
            guild_id: "42".to_string(),
        });
        let dispatch: Dispatch = event.into();
        assert_eq!(
            dispatch,
            Dispatch::Start(EventPayload {
                guild_id: "42".to_string()
            })
        );
    }

    #[test]
    fn test_endpoint_host() {
        let mut d = descriptor();
        assert_eq!(d.endpoint_host(), Some("voice.example.com"));

        d.endpoint = String::new();
        assert_eq!(d.endpoint_host(), None);
    }

    #[test]
    fn test_descriptor_missing_endpoint_deserializes() {
        let json = r#"{
            "guild_id": "42",
            "channel_id": "7",
            "user_id": "9000",
            "session_id": "sess-1",
            "token": "voice-token"
        }"#;
        let d: SessionDescriptor = serde_json::from_str(json).unwrap();
        assert!(d.endpoint.is_empty());
        assert_eq!(d.server_id(), "42");
    }
}
