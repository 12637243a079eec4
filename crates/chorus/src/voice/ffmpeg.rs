//! ffmpeg-backed encoder: decodes a source URL to opus frames by
//! spawning the external `ffmpeg` binary and pumping its stdout into
//! the voice link sink.

use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};

use super::{EncodeOutcome, EncoderFactory, EncoderStream};

/// Read chunk size for the stdout pump.
const READ_CHUNK: usize = 4096;

/// Encoder factory shelling out to ffmpeg.
pub struct FfmpegEncoder {
    binary: String,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

struct FfmpegStream {
    pause_tx: watch::Sender<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl EncoderStream for FfmpegStream {
    fn set_volume(&mut self, volume: f32) {
        // ffmpeg cannot rewrite its filter graph mid-run; the player
        // remembers the volume and it is applied at the next start.
        debug!("volume {volume} takes effect on the next track");
    }

    fn pause(&mut self) {
        let _ = self.pause_tx.send(true);
    }

    fn resume(&mut self) {
        let _ = self.pause_tx.send(false);
    }

    fn stop(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl EncoderFactory for FfmpegEncoder {
    async fn start(
        &self,
        sink: mpsc::Sender<Vec<u8>>,
        url: &str,
        volume: f32,
    ) -> anyhow::Result<(Box<dyn EncoderStream>, oneshot::Receiver<EncodeOutcome>)> {
        let mut child = Command::new(&self.binary)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                url,
                "-af",
                &format!("volume={volume}"),
                "-f",
                "opus",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.binary))?;

        let mut stdout = child.stdout.take().context("ffmpeg stdout missing")?;

        let (pause_tx, mut pause_rx) = watch::channel(false);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];

            // None means the stream was detached; no outcome then.
            let outcome: Option<EncodeOutcome> = loop {
                let paused = *pause_rx.borrow();
                tokio::select! {
                    _ = &mut kill_rx => break None,
                    changed = pause_rx.changed(), if paused => {
                        if changed.is_err() {
                            break None;
                        }
                    }
                    read = stdout.read(&mut buf), if !paused => match read {
                        Ok(0) => match child.wait().await {
                            Ok(status) if status.success() => {
                                break Some(EncodeOutcome::Completed);
                            }
                            _ => break Some(EncodeOutcome::Failed),
                        },
                        Ok(n) => {
                            if sink.send(buf[..n].to_vec()).await.is_err() {
                                // Voice link went away under us.
                                break None;
                            }
                        }
                        Err(e) => {
                            warn!("ffmpeg stdout read failed: {e}");
                            break Some(EncodeOutcome::Failed);
                        }
                    },
                }
            };

            let _ = child.start_kill();
            let _ = child.wait().await;

            if let Some(outcome) = outcome {
                let _ = outcome_tx.send(outcome);
            }
        });

        Ok((
            Box::new(FfmpegStream {
                pause_tx,
                kill_tx: Some(kill_tx),
            }),
            outcome_rx,
        ))
    }
}
