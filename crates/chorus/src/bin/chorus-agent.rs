use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chorus::agent::{Agent, AgentConfig, ProcessLauncher};
use clap::Parser;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "chorus-agent", about = "Node-side chorus agent", version)]
struct Args {
    /// WebSocket URL of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:8443")]
    hub_url: String,

    /// Stable agent id; generated when omitted.
    #[arg(long)]
    id: Option<String>,

    /// Shared secret presented to the hub.
    #[arg(long, env = "CHORUS_TOKEN")]
    token: String,

    /// Path to the worker binary. Defaults to `chorus-worker` next to
    /// this executable.
    #[arg(long)]
    worker_bin: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let agent_id = args.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let worker_bin = match args.worker_bin {
        Some(path) => path,
        None => std::env::current_exe()
            .context("locating this executable")?
            .with_file_name("chorus-worker"),
    };

    let launcher = Arc::new(ProcessLauncher::new(worker_bin));
    let config = AgentConfig::new(args.hub_url, agent_id, args.token);
    Agent::new(config, launcher).run().await;
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
