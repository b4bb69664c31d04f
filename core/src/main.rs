use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use morio_core::{api, tls, Collaborators, Coordinator, CoreConfig, HttpPeerClient};

#[derive(Parser, Debug)]
#[command(name = "morio-core")]
#[command(about = "Morio cluster coordinator", long_about = None)]
struct Args {
    /// Bind address for the HTTP(S) server
    #[arg(long, env = "MORIO_CORE_BIND", default_value = "0.0.0.0:3007")]
    bind: String,

    /// Directory holding the database and the at-rest key
    #[arg(long, env = "MORIO_CORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// FQDN of this node (taken from the setup request when unset)
    #[arg(long, env = "MORIO_CORE_FQDN")]
    fqdn: Option<String>,

    /// Port peers listen on
    #[arg(long, env = "MORIO_CORE_PORT", default_value_t = 3007)]
    peer_port: u16,

    /// Scheme used to reach peers
    #[arg(long, env = "MORIO_CORE_SCHEME", default_value = "http", value_parser = ["http", "https"])]
    peer_scheme: String,

    #[arg(long, env = "MORIO_CORE_CLUSTER_HEARTBEAT_INTERVAL", default_value_t = 30_000)]
    heartbeat_interval_ms: u64,

    #[arg(long, env = "MORIO_CORE_CLUSTER_HEARTBEAT_TIMEOUT", default_value_t = 5_000)]
    heartbeat_timeout_ms: u64,

    /// Heartbeats slower than this are logged
    #[arg(long, env = "MORIO_CORE_CLUSTER_HEARTBEAT_MAX_RTT", default_value_t = 150)]
    heartbeat_max_rtt_ms: u64,

    /// Missed heartbeat intervals before a node is unreachable
    #[arg(long, env = "MORIO_CORE_CLUSTER_LIVENESS_MISSED", default_value_t = 4)]
    liveness_missed: u32,

    /// Failed heartbeats to the leader before re-electing
    #[arg(long, env = "MORIO_CORE_CLUSTER_LEADER_FAILURES", default_value_t = 3)]
    leader_failures: u32,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// TLS certificate (PEM)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// CA for verifying peer certificates (enables mTLS)
    #[arg(long, requires = "tls_cert")]
    tls_ca: Option<PathBuf>,
}

impl Args {
    fn core_config(&self) -> CoreConfig {
        let data_dir = self
            .data_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join("morio")));

        CoreConfig {
            data_dir,
            fqdn: self.fqdn.as_ref().map(|f| f.to_lowercase()),
            peer_port: self.peer_port,
            peer_scheme: self.peer_scheme.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            heartbeat_max_rtt: Duration::from_millis(self.heartbeat_max_rtt_ms),
            liveness_missed: self.liveness_missed,
            leader_failures: self.leader_failures,
            ..CoreConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let log_level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Starting Morio core {}", env!("CARGO_PKG_VERSION"));

    let config = args.core_config();
    if let Some(dir) = &config.data_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {:?}", dir))?;
        info!("Data directory: {:?}", dir);
    }

    let ca_pem = args
        .tls_ca
        .as_ref()
        .map(|path| std::fs::read(path).with_context(|| format!("Failed to read {:?}", path)))
        .transpose()?;
    let peers = Arc::new(HttpPeerClient::new(&config, ca_pem.as_deref())?);

    let coordinator = Coordinator::open(config, Collaborators::with_peers(peers)).await?;
    coordinator.start();

    // Create router
    let app = api::create_router(coordinator.clone());

    // Parse bind address
    let addr: SocketAddr = args.bind.parse()?;

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let server_config = tls::load_server_config(cert, key, args.tls_ca.as_deref())?;
            let rustls = RustlsConfig::from_config(Arc::new(server_config));
            let handle = axum_server::Handle::new();

            let shutdown = handle.clone();
            let c = coordinator.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                c.shutdown();
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            info!("Listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let c = coordinator.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_signal().await;
                    c.shutdown();
                })
                .await?;
        }
    }

    info!("Morio core stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
