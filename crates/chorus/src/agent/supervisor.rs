//! Worker process supervision.
//!
//! The supervisor owns the map from guild id to live worker and is
//! only ever touched from the agent's connection loop, so the map
//! needs no locking. At most one worker exists per guild; a PLAY whose
//! session token differs from the tracked one means the session moved,
//! which is always destroy-then-create, never an in-place update.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chorus_protocol::{Play, SessionDescriptor, WorkerCommand, WorkerEvent};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Message from a worker task back into the agent loop.
#[derive(Debug)]
pub enum WorkerMessage {
    /// The worker reported a lifecycle event.
    Event {
        guild_id: String,
        session_id: String,
        event: WorkerEvent,
    },
    /// The worker process exited or its channel closed.
    Exited {
        guild_id: String,
        session_id: String,
    },
}

/// Handle to a launched worker: a command channel plus a kill switch.
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    pub fn new(commands: mpsc::Sender<WorkerCommand>, kill: oneshot::Sender<()>) -> Self {
        Self {
            commands,
            kill: Some(kill),
        }
    }

    /// Fire-and-forget command send; a full or closed channel drops
    /// the command, matching the wire protocol's delivery guarantees.
    pub async fn send(&self, cmd: WorkerCommand) {
        if self.commands.send(cmd).await.is_err() {
            debug!("worker command channel closed");
        }
    }

    fn kill(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Launches workers for sessions. The production implementation spawns
/// one OS process per session; tests substitute channel-backed fakes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        session: &SessionDescriptor,
        messages: mpsc::Sender<WorkerMessage>,
    ) -> anyhow::Result<WorkerHandle>;
}

struct WorkerRecord {
    session_id: String,
    handle: WorkerHandle,
}

pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    workers: HashMap<String, WorkerRecord>,
    messages_tx: mpsc::Sender<WorkerMessage>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> (Self, mpsc::Receiver<WorkerMessage>) {
        let (messages_tx, messages_rx) = mpsc::channel(64);
        (
            Self {
                launcher,
                workers: HashMap::new(),
                messages_tx,
            },
            messages_rx,
        )
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Route a PLAY: reuse the tracked worker when the session token
    /// matches, otherwise tear down the stale worker and spawn fresh.
    pub async fn play(&mut self, play: Play) {
        let guild_id = play.session.guild_id.clone();
        let session_id = play.session.session_id.clone();

        let reusable = self
            .workers
            .get(&guild_id)
            .is_some_and(|r| r.session_id == session_id);

        if !reusable {
            if let Some(stale) = self.workers.remove(&guild_id) {
                info!("session {guild_id} moved, tearing down stale worker");
                stale.handle.kill();
            }

            match self
                .launcher
                .launch(&play.session, self.messages_tx.clone())
                .await
            {
                Ok(handle) => {
                    info!("spawned worker for session {guild_id}");
                    self.workers.insert(
                        guild_id.clone(),
                        WorkerRecord { session_id, handle },
                    );
                }
                Err(e) => {
                    warn!("failed to spawn worker for session {guild_id}: {e:#}");
                    return;
                }
            }
        }

        if let Some(record) = self.workers.get(&guild_id) {
            record.handle.send(WorkerCommand::Play(play)).await;
        }
    }

    /// Hard teardown: kill the process, drop the record. Not forwarded
    /// as a graceful IPC command. No-op for untracked sessions.
    pub fn stop(&mut self, guild_id: &str) {
        match self.workers.remove(guild_id) {
            Some(record) => {
                info!("stopping worker for session {guild_id}");
                record.handle.kill();
            }
            None => debug!("stop for untracked session {guild_id}, nothing to do"),
        }
    }

    /// Forward a command verbatim if the session is tracked; silently
    /// drop it otherwise.
    pub async fn forward(&mut self, guild_id: &str, cmd: WorkerCommand) {
        match self.workers.get(guild_id) {
            Some(record) => record.handle.send(cmd).await,
            None => debug!("no worker for session {guild_id}, dropping command"),
        }
    }

    /// A worker exited on its own. Remove the record only if it still
    /// belongs to the same session binding; a moved session already
    /// has a fresh worker under this guild id.
    pub fn worker_exited(&mut self, guild_id: &str, session_id: &str) {
        let matches = self
            .workers
            .get(guild_id)
            .is_some_and(|r| r.session_id == session_id);
        if matches {
            info!("worker for session {guild_id} exited");
            self.workers.remove(guild_id);
        }
    }

    /// Whether an event from a worker with this session binding should
    /// still be relayed upstream. Events from torn-down workers that
    /// were still in flight are dropped here.
    pub fn should_relay(&self, guild_id: &str, session_id: &str) -> bool {
        self.workers
            .get(guild_id)
            .is_some_and(|r| r.session_id == session_id)
    }
}

/// Spawns the `chorus-worker` binary, one process per session, with
/// the session descriptor as its single argument and JSON-over-stdio
/// IPC.
pub struct ProcessLauncher {
    worker_bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        session: &SessionDescriptor,
        messages: mpsc::Sender<WorkerMessage>,
    ) -> anyhow::Result<WorkerHandle> {
        let descriptor = serde_json::to_string(session).context("serializing descriptor")?;

        let mut child = Command::new(&self.worker_bin)
            .arg(descriptor)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {:?}", self.worker_bin))?;

        let mut stdin = child.stdin.take().context("worker stdin missing")?;
        let stdout = child.stdout.take().context("worker stdout missing")?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WorkerCommand>(16);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let guild_id = session.guild_id.clone();
        let session_id = session.session_id.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => {
                            let mut line = match serde_json::to_string(&cmd) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!("failed to serialize worker command: {e}");
                                    continue;
                                }
                            };
                            line.push('\n');
                            if stdin.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        // Handle dropped without an explicit kill.
                        None => break,
                    },
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            match serde_json::from_str::<WorkerEvent>(&line) {
                                Ok(event) => {
                                    let _ = messages
                                        .send(WorkerMessage::Event {
                                            guild_id: guild_id.clone(),
                                            session_id: session_id.clone(),
                                            event,
                                        })
                                        .await;
                                }
                                Err(e) => warn!("unknown worker IPC event: {e}"),
                            }
                        }
                        // EOF or broken pipe: the process is done.
                        _ => break,
                    },
                }
            }

            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = messages
                .send(WorkerMessage::Exited {
                    guild_id,
                    session_id,
                })
                .await;
        });

        Ok(WorkerHandle::new(cmd_tx, kill_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::EventPayload;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Launcher handing out channel-backed workers and recording every
    /// spawn and kill.
    struct FakeLauncher {
        spawns: AtomicU32,
        /// Command receivers per spawn, in spawn order.
        inboxes: Mutex<Vec<mpsc::Receiver<WorkerCommand>>>,
        /// Kill receivers per spawn, in spawn order.
        kills: Mutex<Vec<oneshot::Receiver<()>>>,
        /// Event senders per spawn, for emitting as the fake worker.
        emitters: Mutex<Vec<(String, String, mpsc::Sender<WorkerMessage>)>>,
    }

    impl FakeLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                spawns: AtomicU32::new(0),
                inboxes: Mutex::new(Vec::new()),
                kills: Mutex::new(Vec::new()),
                emitters: Mutex::new(Vec::new()),
            })
        }

        fn spawn_count(&self) -> u32 {
            self.spawns.load(Ordering::SeqCst)
        }

        fn take_inbox(&self, idx: usize) -> mpsc::Receiver<WorkerCommand> {
            self.inboxes.lock().unwrap().remove(idx)
        }

        fn killed(&self, idx: usize) -> bool {
            let mut kills = self.kills.lock().unwrap();
            match kills[idx].try_recv() {
                Ok(()) => true,
                Err(oneshot::error::TryRecvError::Closed) => true,
                Err(oneshot::error::TryRecvError::Empty) => false,
            }
        }

        async fn emit(&self, idx: usize, event: WorkerEvent) {
            let (guild_id, session_id, tx) = {
                let emitters = self.emitters.lock().unwrap();
                emitters[idx].clone()
            };
            let _ = tx
                .send(WorkerMessage::Event {
                    guild_id,
                    session_id,
                    event,
                })
                .await;
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(
            &self,
            session: &SessionDescriptor,
            messages: mpsc::Sender<WorkerMessage>,
        ) -> anyhow::Result<WorkerHandle> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let (cmd_tx, cmd_rx) = mpsc::channel(16);
            let (kill_tx, kill_rx) = oneshot::channel();
            self.inboxes.lock().unwrap().push(cmd_rx);
            self.kills.lock().unwrap().push(kill_rx);
            self.emitters.lock().unwrap().push((
                session.guild_id.clone(),
                session.session_id.clone(),
                messages,
            ));
            Ok(WorkerHandle::new(cmd_tx, kill_tx))
        }
    }

    fn descriptor(session_id: &str) -> SessionDescriptor {
        SessionDescriptor {
            guild_id: "42".to_string(),
            endpoint: "voice.example.com:443".to_string(),
            channel_id: "7".to_string(),
            user_id: "9000".to_string(),
            session_id: session_id.to_string(),
            token: "voice-token".to_string(),
        }
    }

    fn play(session_id: &str) -> Play {
        Play {
            url: "http://x/track.mp3".to_string(),
            session: descriptor(session_id),
        }
    }

    #[tokio::test]
    async fn test_play_spawns_and_forwards() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(sup.worker_count(), 1);

        let mut inbox = launcher.take_inbox(0);
        let cmd = inbox.try_recv().unwrap();
        assert!(matches!(cmd, WorkerCommand::Play(_)));
    }

    #[tokio::test]
    async fn test_matching_token_reuses_worker() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;
        sup.play(play("sess-1")).await;

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(sup.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_session_move_tears_down_stale_worker() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;
        sup.play(play("sess-2")).await;

        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(sup.worker_count(), 1);
        assert!(launcher.killed(0));
        assert!(!launcher.killed(1));

        // Events from the torn-down binding are no longer relayed.
        assert!(!sup.should_relay("42", "sess-1"));
        assert!(sup.should_relay("42", "sess-2"));
    }

    #[tokio::test]
    async fn test_stop_kills_and_is_idempotent() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;
        sup.stop("42");
        assert_eq!(sup.worker_count(), 0);
        assert!(launcher.killed(0));

        // Second stop is a no-op.
        sup.stop("42");
        assert_eq!(sup.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_to_unknown_session_is_dropped() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.forward("42", WorkerCommand::SetVolume { volume: 0.5 })
            .await;
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_to_tracked_session() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;
        sup.forward("42", WorkerCommand::Pause).await;

        let mut inbox = launcher.take_inbox(0);
        assert!(matches!(inbox.try_recv().unwrap(), WorkerCommand::Play(_)));
        assert!(matches!(inbox.try_recv().unwrap(), WorkerCommand::Pause));
    }

    #[tokio::test]
    async fn test_worker_exit_clears_record() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;
        sup.worker_exited("42", "sess-1");
        assert_eq!(sup.worker_count(), 0);

        // A later play starts clean with a fresh worker.
        sup.play(play("sess-1")).await;
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_exit_does_not_clear_new_record() {
        let launcher = FakeLauncher::new();
        let (mut sup, _rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;
        sup.play(play("sess-2")).await;

        // The killed sess-1 worker reports its exit afterwards.
        sup.worker_exited("42", "sess-1");
        assert_eq!(sup.worker_count(), 1);
        assert!(sup.should_relay("42", "sess-2"));
    }

    #[tokio::test]
    async fn test_events_flow_through_message_channel() {
        let launcher = FakeLauncher::new();
        let (mut sup, mut rx) = Supervisor::new(launcher.clone());

        sup.play(play("sess-1")).await;
        launcher
            .emit(
                0,
                WorkerEvent::Start(EventPayload {
                    guild_id: "42".to_string(),
                }),
            )
            .await;

        match rx.recv().await.unwrap() {
            WorkerMessage::Event {
                guild_id,
                session_id,
                event,
            } => {
                assert_eq!(guild_id, "42");
                assert_eq!(session_id, "sess-1");
                assert!(matches!(event, WorkerEvent::Start(_)));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
