//! Signaling coordinator daemon.

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomlink::Coordinator;

#[derive(Parser, Debug)]
#[command(name = "coordinator", about = "Room signaling coordinator")]
struct Args {
    /// Address the WebSocket listener binds to.
    #[arg(long, env = "ROOMLINK_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(&args.listen).await?;
    let coordinator = Coordinator::new();

    tokio::select! {
        result = coordinator.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
