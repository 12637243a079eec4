//! Per-session playback state machine.
//!
//! A `Player` owns at most one voice link and one encoder stream at a
//! time and is driven from a single task, so commands never race each
//! other. Lifecycle events go out on an mpsc channel; READY and START
//! are emitted together when an encoder comes up, END exactly once
//! when the encoder finishes or errors. An externally issued stop
//! detaches the stream without emitting END.

use std::sync::Arc;

use chorus_protocol::{EventPayload, Play, WorkerCommand, WorkerEvent};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::voice::{EncodeOutcome, EncoderFactory, EncoderStream, VoiceLink, VoiceTransport};

pub struct Player {
    guild_id: String,
    transport: Arc<dyn VoiceTransport>,
    encoder: Arc<dyn EncoderFactory>,
    events: mpsc::Sender<WorkerEvent>,
    link: Option<Box<dyn VoiceLink>>,
    /// Endpoint the current link was established against.
    endpoint: Option<String>,
    stream: Option<Box<dyn EncoderStream>>,
    completion: Option<oneshot::Receiver<EncodeOutcome>>,
    playing: bool,
    paused: bool,
    volume: f32,
}

impl Player {
    pub fn new(
        guild_id: impl Into<String>,
        transport: Arc<dyn VoiceTransport>,
        encoder: Arc<dyn EncoderFactory>,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            transport,
            encoder,
            events,
            link: None,
            endpoint: None,
            stream: None,
            completion: None,
            playing: false,
            paused: false,
            volume: 1.0,
        }
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub async fn handle(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Play(play) => self.play(play).await,
            WorkerCommand::Stop => self.stop(),
            WorkerCommand::SetVolume { volume } => {
                self.volume = volume;
                if let Some(stream) = self.stream.as_mut() {
                    stream.set_volume(volume);
                }
            }
            WorkerCommand::Pause => {
                if let Some(stream) = self.stream.as_mut() {
                    stream.pause();
                    self.paused = true;
                }
            }
            WorkerCommand::Resume => {
                if let Some(stream) = self.stream.as_mut() {
                    stream.resume();
                    self.paused = false;
                }
            }
        }
    }

    async fn play(&mut self, play: Play) {
        if self.playing {
            // Interrupting the current track is an internal stop; the
            // interrupted track gets no END.
            self.stop();
        }

        let session = play.session;
        let Some(host) = session.endpoint_host().map(str::to_string) else {
            debug!(
                "session {} has no voice endpoint, ignoring play",
                self.guild_id
            );
            return;
        };

        // A changed endpoint invalidates the established link.
        if self.endpoint.as_deref() != Some(session.endpoint.as_str()) {
            self.link = None;
            self.endpoint = None;
        }

        if self.link.is_none() {
            match self
                .transport
                .connect(
                    &host,
                    session.server_id(),
                    &session.user_id,
                    &session.session_id,
                    &session.token,
                )
                .await
            {
                Ok(link) => {
                    self.link = Some(link);
                    self.endpoint = Some(session.endpoint.clone());
                }
                Err(e) => {
                    warn!("voice connect failed for session {}: {e:#}", self.guild_id);
                    return;
                }
            }
        }

        let Some(link) = self.link.as_ref() else {
            return;
        };

        match self.encoder.start(link.sink(), &play.url, self.volume).await {
            Ok((stream, completion)) => {
                self.stream = Some(stream);
                self.completion = Some(completion);
                self.playing = true;
                self.paused = false;
                self.emit(WorkerEvent::Ready(self.payload())).await;
                self.emit(WorkerEvent::Start(self.payload())).await;
            }
            Err(e) => {
                warn!(
                    "encoder failed to start for session {}: {e:#}",
                    self.guild_id
                );
                self.emit(WorkerEvent::End(self.payload())).await;
            }
        }
    }

    /// Detach the encoder output. Does not emit END; that is reserved
    /// for the encoder's own completion signal.
    fn stop(&mut self) {
        if !self.playing {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        self.completion = None;
        self.playing = false;
        self.paused = false;
    }

    /// Release the voice session as part of process teardown.
    pub fn disconnect(&mut self) {
        self.stop();
        self.link = None;
        self.endpoint = None;
    }

    /// The encoder finished on its own (natural end or error).
    pub(crate) async fn finished(
        &mut self,
        outcome: Result<EncodeOutcome, oneshot::error::RecvError>,
    ) {
        match outcome {
            Ok(EncodeOutcome::Completed) => {
                debug!("track finished for session {}", self.guild_id);
            }
            Ok(EncodeOutcome::Failed) => {
                warn!("encoder error for session {}, ending track", self.guild_id);
            }
            Err(_) => debug!("encoder vanished for session {}", self.guild_id),
        }
        self.stream = None;
        self.completion = None;
        self.playing = false;
        self.paused = false;
        self.emit(WorkerEvent::End(self.payload())).await;
    }

    pub(crate) fn take_completion(&mut self) -> Option<oneshot::Receiver<EncodeOutcome>> {
        self.completion.take()
    }

    pub(crate) fn put_completion(&mut self, completion: oneshot::Receiver<EncodeOutcome>) {
        self.completion = Some(completion);
    }

    fn payload(&self) -> EventPayload {
        EventPayload {
            guild_id: self.guild_id.clone(),
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event channel for session {} is closed", self.guild_id);
        }
    }
}
