//! tbrpc server - bidirectional JSON RPC over WebSockets.
//!
//! Serves the demo routes on `/ws` and reports liveness on `/health`.

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tbrpc::{RpcOptions, ServerConfig, ServerRouter};
use tbrpc_server::{handlers, server};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tbrpc-server")]
#[command(about = "Bidirectional JSON RPC server over WebSockets")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = ServerConfig::DEFAULT_HOST)]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Seconds a server-initiated call waits for its response (0 = forever)
    #[arg(long, default_value = "30")]
    call_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting tbrpc server");

    let call_timeout = match args.call_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let router = ServerRouter::builder()
        .routes(handlers::demo_routes())
        .options(RpcOptions::new().with_call_timeout(call_timeout))
        .on_connect(|id, _| info!("{} connected", id))
        .on_disconnect(|id, _| info!("{} disconnected", id))
        .build();

    let addr = server::start_server(router, &args.host, args.port).await?;

    // Intentional stdout: launchers read the port from here
    println!("TBRPC_PORT={}", addr.port());

    info!("WebSocket endpoint ws://{}{}", addr, ServerConfig::WS_PATH);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
