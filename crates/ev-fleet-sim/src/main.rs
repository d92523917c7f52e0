mod config;
mod console;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use evsim_api::create_app;
use evsim_engine::FleetEngine;
use evsim_ocpp::{Connection, WsClient, WsClientConfig};
use tokio::task::JoinHandle;

use crate::config::FleetConfig;
use crate::console::{ConsoleExit, run_console, spawn_stdin_reader};

/// Command line arguments for the fleet simulator
#[derive(Parser, Debug)]
#[command(name = "ev-fleet-sim")]
#[command(about = "OCPP 1.6 charge station fleet simulator")]
struct Args {
    /// Path to the fleet configuration JSON file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to bind the HTTP server to
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of generated stations
    #[arg(short, long)]
    stations: Option<usize>,

    /// Central system WebSocket URL; stations connect to <url>/<stationId>
    #[arg(long)]
    central_system: Option<String>,

    /// Seed for reproducible sampled currents
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn apply_to(&self, config: &mut FleetConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(count) = self.stations {
            config.station_count = count;
            config.stations.clear();
        }
        if let Some(url) = &self.central_system {
            config.central_system_url = Some(url.clone());
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
    }
}

const CLIENT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect every station to the central system, one WebSocket each.
fn spawn_ws_clients(
    engine: &FleetEngine,
    central_system_url: &str,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut clients = Vec::with_capacity(engine.len());
    for index in 1..=engine.len() {
        let (connection, outgoing_rx) = Connection::new();
        let controller = Arc::new(engine.controller(index, Arc::new(connection))?);
        let client_config = WsClientConfig {
            central_system_url: central_system_url.to_string(),
            ..WsClientConfig::default()
        };
        let client = WsClient::new(client_config, controller, outgoing_rx);
        clients.push(tokio::spawn(client.run(engine.shutdown_signal())));
    }
    Ok(clients)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt().pretty().init();

    let mut config = match &args.config {
        Some(path) => {
            let config = FleetConfig::load(path).await?;
            tracing::info!("Loaded fleet config from {}", path.display());
            config
        }
        None => FleetConfig::default(),
    };
    args.apply_to(&mut config);
    config.validate().context("Invalid fleet configuration")?;

    let stations = config.station_configs();
    let engine = match config.seed {
        Some(seed) => FleetEngine::with_seed(stations, seed),
        None => FleetEngine::new(stations),
    }
    .with_notification_timeout(config.notification_timeout());
    let engine = Arc::new(engine);

    let clients = match &config.central_system_url {
        Some(url) => spawn_ws_clients(&engine, url)?,
        None => {
            tracing::info!("No central system configured, running simulation only");
            Vec::new()
        }
    };

    let sampler = Arc::clone(&engine).run_sampler(config.tick_interval());

    // Build our application with routes
    let app = create_app(Arc::clone(&engine));

    let bind_addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    let mut server_shutdown = engine.shutdown_signal();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stopped| *stopped).await;
            })
            .await
    });

    let console_engine = Arc::clone(&engine);
    let mut console = tokio::spawn(async move {
        run_console(&console_engine, spawn_stdin_reader(), tokio::io::stdout()).await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
        exit = &mut console => {
            match exit {
                Ok(Ok(ConsoleExit::Quit)) => {}
                Ok(Ok(ConsoleExit::EndOfInput)) => {
                    tracing::info!("Console input closed, press Ctrl-C to stop");
                    tokio::signal::ctrl_c().await?;
                }
                Ok(Err(e)) => tracing::warn!("Console failed: {}", e),
                Err(e) => tracing::warn!("Console task failed: {}", e),
            }
        }
    }

    engine.shutdown();
    console.abort();
    sampler.await?;
    for client in clients {
        if tokio::time::timeout(CLIENT_STOP_TIMEOUT, client).await.is_err() {
            tracing::warn!("A station connection did not close in time");
        }
    }
    server
        .await?
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    let last = engine.latest();
    tracing::info!("Fleet stopped after {} tick(s)", last.tick);
    Ok(())
}
