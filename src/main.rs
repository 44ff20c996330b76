use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chromepilot::config::{self, Config};
use chromepilot::dispatch::Dispatcher;
use chromepilot::orchestrator::{self, ServerState};
use chromepilot::server::StdioServer;
use chromepilot::tools;

/// A stdio tool server that drives a user-owned Chromium browser over the
/// Chrome DevTools Protocol.
#[derive(Debug, Parser)]
#[command(name = "chromepilot", version, about)]
struct Cli {
    /// Chromium remote debugging port.
    #[arg(long, env = "CHROMEPILOT_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    // stdout carries the protocol; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let file = config::load_config();
    let config = Config::resolve(cli.port, &file);
    info!(port = config.port, "starting");

    let state = Arc::new(Mutex::new(ServerState::new(config)));
    let dispatcher = Dispatcher::new(tools::catalog());
    let server = StdioServer::new(dispatcher, Arc::clone(&state));

    let outcome = tokio::select! {
        result = server.run() => result,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    // Disconnect cleanly but leave the browser running; only the explicit
    // close_browser tool terminates it.
    {
        let mut server_state = state.lock().await;
        orchestrator::teardown_instance(&mut server_state).await;
    }

    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("fatal stdio failure: {e}");
            std::process::exit(1);
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
