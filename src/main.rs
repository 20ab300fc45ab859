//! switchyard demo binary.
//!
//! ```text
//! switchyard serve [--config switchyard.toml]
//!     bind the configured listener (udp or tcp) and echo every message
//!     back on the connection it arrived on
//!
//! switchyard probe 127.0.0.1:22023 [--transport tcp] [--message hi]
//!     connect, send one message, print the echo and the statistics
//! ```

use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use switchyard::config::{
    load_config, ConfigWatcher, ObservabilityConfig, TransportConfig, TransportKind,
};
use switchyard::lifecycle::{signals, Shutdown};
use switchyard::net::{
    Connection, ConnectionEndpoint, ConnectionListener, ConnectionOptions, DataReceived,
    NewConnection, SendOption, TcpConnection, TcpConnectionListener, UdpConnection,
    UdpConnectionListener,
};
use switchyard::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Datagram and stream connection layer demo", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        /// TOML configuration file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Connect, send one message, print the echo and statistics
    Probe {
        addr: SocketAddr,

        #[arg(short, long, default_value = "udp")]
        transport: TransportKind,

        #[arg(short, long, default_value = "ping")]
        message: String,

        /// Handshake bytes sent with the Hello
        #[arg(long, default_value = "")]
        handshake: String,

        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Probe {
            addr,
            transport,
            message,
            handshake,
            timeout_ms,
        } => {
            logging::init_logging(&ObservabilityConfig {
                log_level: "warn".to_string(),
                ..ObservabilityConfig::default()
            });
            let endpoint = ConnectionEndpoint::from_addr(addr);
            let timeout = Duration::from_millis(timeout_ms);
            match transport {
                TransportKind::Udp => {
                    probe(UdpConnection::new(endpoint), &handshake, &message, timeout).await
                }
                TransportKind::Tcp => {
                    probe(TcpConnection::new(endpoint), &handshake, &message, timeout).await
                }
            }
        }
    }
}

async fn serve(config_path: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = match &config_path {
        Some(path) => load_config(path)?,
        None => TransportConfig::default(),
    };
    logging::init_logging(&config.observability);

    tracing::info!(
        bind_address = %config.listener.bind_address,
        ip_mode = %config.listener.ip_mode,
        transport = %config.listener.transport,
        max_connections = config.listener.max_connections,
        keep_alive_interval_ms = config.connection.keep_alive_interval_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let endpoint = config.listener.endpoint()?;
    let options = ConnectionOptions::from(&config.connection);
    match config.listener.transport {
        TransportKind::Udp => {
            let listener =
                UdpConnectionListener::with_options(endpoint, options, config.listener.max_connections);
            run_echo(listener, config, config_path).await
        }
        TransportKind::Tcp => {
            let listener = TcpConnectionListener::with_options(
                endpoint,
                options,
                config.listener.max_connections,
                config.listener.handshake_timeout(),
            );
            run_echo(listener, config, config_path).await
        }
    }
}

async fn run_echo<L>(
    listener: Arc<L>,
    config: TransportConfig,
    config_path: Option<PathBuf>,
) -> Result<(), Box<dyn Error>>
where
    L: ConnectionListener + 'static,
{
    listener
        .on_new_connection()
        .subscribe(|event: &NewConnection<L::Connection>| {
            tracing::info!(
                endpoint = %event.connection.endpoint(),
                handshake_len = event.handshake.len(),
                "Peer connected"
            );
            let connection = Arc::downgrade(&event.connection);
            event
                .connection
                .on_data_received()
                .subscribe(move |message: &DataReceived| {
                    let Some(connection) = connection.upgrade() else {
                        return;
                    };
                    let bytes = message.bytes.clone();
                    let option = message.send_option;
                    tokio::spawn(async move {
                        if let Err(e) = connection.send(&bytes, option).await {
                            tracing::warn!(error = %e, "Echo failed");
                        }
                    });
                });
        });

    listener.start()?;
    tracing::info!(address = ?listener.local_endpoint(), "Echo server ready");

    let shutdown = Shutdown::new();

    // Dropping the notify watcher stops file watching, so keep it alive.
    let _watcher = match config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(&path, config);
            let guard = watcher.run()?;
            let listener = Arc::clone(&listener);
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = updates.recv() => match update {
                            Some(new_config) => apply_reload(&*listener, &new_config),
                            None => break,
                        },
                        _ = stop.recv() => break,
                    }
                }
            });
            Some(guard)
        }
        None => None,
    };

    signals::trigger_on_signal(&shutdown).await;

    tracing::info!(
        connections = listener.connection_count(),
        "Shutting down"
    );
    listener.dispose();
    for connection in listener.connections() {
        connection.close().await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Apply the live-tunable parts of a reloaded configuration.
fn apply_reload<L: ConnectionListener>(listener: &L, config: &TransportConfig) {
    let options = ConnectionOptions::from(&config.connection);
    for connection in listener.connections() {
        connection.set_keep_alive_interval(options.keep_alive_interval);
    }
    tracing::info!(
        keep_alive_interval_ms = config.connection.keep_alive_interval_ms,
        connections = listener.connection_count(),
        "Configuration reloaded"
    );
    listener.base().set_connection_options(options);
}

async fn probe<C: Connection>(
    connection: Arc<C>,
    handshake: &str,
    message: &str,
    timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection
        .on_data_received()
        .subscribe(move |message: &DataReceived| {
            let _ = tx.send(message.bytes.clone());
        });

    connection.connect(handshake.as_bytes(), timeout).await?;
    connection
        .send(message.as_bytes(), SendOption::Reliable)
        .await?;

    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(echo)) => println!("{}", String::from_utf8_lossy(&echo)),
        _ => eprintln!("no echo within {timeout:?}"),
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&connection.statistics().snapshot())?
    );

    connection.close().await;
    Ok(())
}
