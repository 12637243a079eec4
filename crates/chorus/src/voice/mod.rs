//! Capability interfaces the worker drives a session through.
//!
//! The actual voice transport (socket handshake, RTP framing,
//! encryption) lives outside this crate; a worker only sees it as a
//! [`VoiceLink`] it can push encoded frames into. Likewise the audio
//! pipeline is an external program reached through [`EncoderFactory`].

mod ffmpeg;

pub use ffmpeg::FfmpegEncoder;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// How an encoder run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// The source was decoded to the end.
    Completed,
    /// The pipeline died or errored mid-stream.
    Failed,
}

/// Establishes voice sessions against the external transport.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint_host: &str,
        server_id: &str,
        user_id: &str,
        session_id: &str,
        token: &str,
    ) -> anyhow::Result<Box<dyn VoiceLink>>;
}

/// An established voice session. Frames pushed into the sink reach the
/// voice server; dropping the link releases the session.
pub trait VoiceLink: Send {
    /// Sender for encoded audio frames.
    fn sink(&self) -> mpsc::Sender<Vec<u8>>;
}

/// Starts audio pipelines decoding a source URL into transport frames.
#[async_trait]
pub trait EncoderFactory: Send + Sync {
    /// Start decoding `url`. Frames flow into `sink` until the stream
    /// is stopped; the receiver fires once when the pipeline finishes
    /// on its own (never after `stop`).
    async fn start(
        &self,
        sink: mpsc::Sender<Vec<u8>>,
        url: &str,
        volume: f32,
    ) -> anyhow::Result<(Box<dyn EncoderStream>, oneshot::Receiver<EncodeOutcome>)>;
}

/// Control surface of a running encoder.
pub trait EncoderStream: Send {
    fn set_volume(&mut self, volume: f32);
    /// Cork the output without destroying the encoder.
    fn pause(&mut self);
    fn resume(&mut self);
    /// Detach the output for good. No completion outcome is delivered
    /// after this.
    fn stop(&mut self);
}

/// Stand-in transport for deployments where the real voice socket is
/// wired up elsewhere: accepts any session and discards frames.
pub struct NullTransport;

struct NullLink {
    sink: mpsc::Sender<Vec<u8>>,
}

impl VoiceLink for NullLink {
    fn sink(&self) -> mpsc::Sender<Vec<u8>> {
        self.sink.clone()
    }
}

#[async_trait]
impl VoiceTransport for NullTransport {
    async fn connect(
        &self,
        endpoint_host: &str,
        server_id: &str,
        _user_id: &str,
        _session_id: &str,
        _token: &str,
    ) -> anyhow::Result<Box<dyn VoiceLink>> {
        log::debug!(
            "null transport connected (endpoint={}, server={})",
            endpoint_host,
            server_id
        );
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Ok(Box::new(NullLink { sink: tx }))
    }
}
