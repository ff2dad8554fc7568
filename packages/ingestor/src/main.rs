//! ZmqFeed ingestion daemon
//!
//! Subscribes to a Bitcoin node's ZMQ feed and stores every mempool transaction
//! in a SQLite database until interrupted.
//!
//! ## Usage
//!
//! ```sh
//! zmqfeed-ingestor --zmq-host 127.0.0.1 --zmq-port 28332 --db-path ~/.zmqfeed/ingestor.sqlite
//! ```

use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use zmqfeed_ingestor::config::{
    CONNECTION_TIMEOUT_MS, DEFAULT_DB_PATH, DEFAULT_ZMQ_HOST, DEFAULT_ZMQ_PORT, QUEUE_CAPACITY,
    RECV_TIMEOUT_MS,
};
use zmqfeed_ingestor::{Daemon, IngestorConfig};

/// Command line arguments, each with an environment fallback
#[derive(Parser, Debug, Clone)]
#[command(about = "Ingests a Bitcoin node's ZMQ feed into SQLite")]
struct Args {
    /// Host of the node's ZMQ publisher
    #[arg(long, env = "INGESTOR_ZMQ_HOST", default_value = DEFAULT_ZMQ_HOST)]
    zmq_host: String,

    /// Port of the node's ZMQ publisher
    #[arg(long, env = "INGESTOR_ZMQ_PORT", default_value_t = DEFAULT_ZMQ_PORT)]
    zmq_port: u16,

    /// SQLite database path
    #[arg(long, env = "INGESTOR_DB_PATH", default_value = DEFAULT_DB_PATH)]
    db_path: String,

    /// Give up connecting to the publisher after this many milliseconds
    #[arg(long, env = "INGESTOR_CONNECT_TIMEOUT_MS", default_value_t = CONNECTION_TIMEOUT_MS)]
    connect_timeout_ms: u64,

    /// Bounded wait of each receive in milliseconds
    #[arg(long, env = "INGESTOR_RECV_TIMEOUT_MS", default_value_t = RECV_TIMEOUT_MS)]
    recv_timeout_ms: u64,

    /// Capacity of the decoded-record queues
    #[arg(long, env = "INGESTOR_QUEUE_CAPACITY", default_value_t = QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "INGESTOR_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

impl Args {
    fn config(&self) -> IngestorConfig {
        IngestorConfig::default()
            .with_zmq(self.zmq_host.clone(), self.zmq_port)
            .with_db_path(self.db_path.clone())
            .with_connect_timeout_ms(self.connect_timeout_ms)
            .with_recv_timeout_ms(self.recv_timeout_ms)
            .with_queue_capacity(self.queue_capacity)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = args.config();
    info!(endpoint = %config.endpoint(), db = %config.db_path, "Starting ingestor");

    let shutdown = CancellationToken::new();
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signalled.cancel();
    });

    let connected = tokio::select! {
        connected = Daemon::connect(&config) => connected,
        _ = shutdown.cancelled() => {
            info!("Shutdown requested before the ingestor started");
            return ExitCode::SUCCESS;
        }
    };
    let mut daemon = match connected {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let stop = daemon.stop_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stop.cancel();
    });

    let run_result = daemon.run().await;
    if let Err(e) = &run_result {
        error!("Ingestor stopped with error: {}", e);
    }
    if let Err(e) = daemon.close() {
        error!("{}", e);
    }

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
