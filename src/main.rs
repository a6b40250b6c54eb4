//! trellis: line-oriented telnet server
//!
//! Features:
//! - One session per connection with read, dispatch and write tasks
//! - Bounded per-session queues
//! - Graceful shutdown on Ctrl-C, draining every session
//! - Configuration via CLI arguments or TOML file

use std::net::SocketAddr;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trellis::config::Config;
use trellis::protocols::telnet::{TelnetCallback, TelnetProtocol};
use trellis::Server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        send_queue = config.session.send_queue_size,
        recv_queue = config.session.recv_queue_size,
        "Starting trellis server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.listen.parse()?;
    let listener = trellis::bind(addr, config.backlog)?;

    let server = Server::new(TelnetProtocol, TelnetCallback, config.session);

    let stopper = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stopper.stop(),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let result = server.serve(listener, config.poll_interval).await;
    if result.is_err() {
        // The listener is gone; take the sessions down with it.
        server.stop();
    }

    server.wait().await;
    info!("Server stopped");

    result.map_err(Into::into)
}
