//! Worker process: one isolated session per process.
//!
//! The supervising agent talks to a worker over its stdio: commands
//! arrive as newline-delimited JSON on stdin, lifecycle events leave
//! on stdout. The worker exits when stdin closes, which is how an
//! agent-side teardown (or agent death) reaps it even without a
//! signal.

mod player;

pub use player::Player;

use std::sync::Arc;

use chorus_protocol::{SessionDescriptor, WorkerCommand, WorkerEvent};
use log::warn;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::voice::{EncoderFactory, VoiceTransport};

/// Buffer sizes for the stdio bridge channels.
const CHANNEL_CAPACITY: usize = 64;

/// Drive a player from a command stream until it closes.
pub async fn run(mut player: Player, mut commands: mpsc::Receiver<WorkerCommand>) {
    enum Next {
        Cmd(Option<WorkerCommand>),
        Finished(Result<crate::voice::EncodeOutcome, tokio::sync::oneshot::error::RecvError>),
    }

    loop {
        let next = match player.take_completion() {
            Some(mut completion) => {
                let next = tokio::select! {
                    cmd = commands.recv() => Next::Cmd(cmd),
                    outcome = &mut completion => Next::Finished(outcome),
                };
                if matches!(next, Next::Cmd(_)) {
                    player.put_completion(completion);
                }
                next
            }
            None => Next::Cmd(commands.recv().await),
        };

        match next {
            Next::Cmd(Some(cmd)) => player.handle(cmd).await,
            Next::Cmd(None) => break,
            Next::Finished(outcome) => player.finished(outcome).await,
        }
    }

    player.disconnect();
}

/// Entry point for the worker binary: bridge stdin/stdout to a player
/// for the session described by `descriptor`.
pub async fn run_stdio(
    descriptor: SessionDescriptor,
    transport: Arc<dyn VoiceTransport>,
    encoder: Arc<dyn EncoderFactory>,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(CHANNEL_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(CHANNEL_CAPACITY);

    let player = Player::new(descriptor.guild_id.clone(), transport, encoder, event_tx);

    // Events out on stdout, one JSON object per line.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = event_rx.recv().await {
            let mut line = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize event: {e}");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Commands in from stdin; EOF ends the worker.
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerCommand>(&line) {
                Ok(cmd) => {
                    if cmd_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("unknown IPC message: {e}"),
            }
        }
        // Dropping cmd_tx ends the player loop.
    });

    run(player, cmd_rx).await;
    // The player (and with it the event sender) is gone; let the
    // writer drain whatever is queued before exiting.
    let _ = writer.await;
}
