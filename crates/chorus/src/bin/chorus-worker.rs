use std::sync::Arc;

use anyhow::Context;
use chorus::voice::{FfmpegEncoder, NullTransport};
use chorus::worker;
use chorus_protocol::SessionDescriptor;
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "chorus-worker",
    about = "Single-session playback worker, spawned by chorus-agent",
    version
)]
struct Args {
    /// Session descriptor as a JSON object.
    descriptor: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is the IPC channel; env_logger writes to stderr, which
    // the supervising agent passes through.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let descriptor: SessionDescriptor =
        serde_json::from_str(&args.descriptor).context("parsing session descriptor")?;

    worker::run_stdio(
        descriptor,
        Arc::new(NullTransport),
        Arc::new(FfmpegEncoder::default()),
    )
    .await;
    Ok(())
}
