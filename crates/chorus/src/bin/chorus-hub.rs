use std::net::SocketAddr;

use anyhow::Context;
use chorus::hub::Hub;
use clap::Parser;
use log::info;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "chorus-hub", about = "Central routing hub for chorus agents", version)]
struct Args {
    /// Address to listen on for agent connections.
    #[arg(long, default_value = "0.0.0.0:8443")]
    bind: SocketAddr,

    /// Shared secret agents must present to identify.
    #[arg(long, env = "CHORUS_TOKEN")]
    token: String,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!("hub listening on {}", args.bind);

    Hub::new(args.token).serve(listener).await
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
