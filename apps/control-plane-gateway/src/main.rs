//! Control-Plane Gateway Binary
//!
//! Starts the peer and bootstrap gRPC listeners plus the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin control-plane-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `GATEWAY_GRPC_CA_CERT`: Peer channel CA certificate
//! - `GATEWAY_BOOTSTRAP_CA_CERT`: Bootstrap channel CA certificate
//! - `GATEWAY_GRPC_SERVER_CERT` / `GATEWAY_GRPC_SERVER_KEY`: Peer identity
//! - `GATEWAY_BOOTSTRAP_SERVER_CERT` / `GATEWAY_BOOTSTRAP_SERVER_KEY`:
//!   Bootstrap identity
//!
//! ## Optional
//! - `GATEWAY_GRPC_PORT`: Peer listener port (default: 6440)
//! - `GATEWAY_BOOTSTRAP_PORT`: Bootstrap listener port (default: 6439)
//! - `GATEWAY_NETWORK_PORT`: Advertised network-service port (default: 6441)
//! - `GATEWAY_BIND_IP`: Listener bind address (default: 0.0.0.0)
//! - `GATEWAY_ADVERTISE_IP`: Address handed to enrolling nodes
//! - `GATEWAY_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8086)
//! - `GATEWAY_DRAIN_TIMEOUT_SECS`: Graceful drain bound, 0 = unbounded (default: 30)
//! - `GATEWAY_REFLECTION_ENABLED`: Register gRPC reflection (default: true)
//! - `GATEWAY_ENROLLMENT_METHODS`: Comma-separated enrollment methods (default: GetToken)
//! - `GATEWAY_BOOTSTRAP_TOKENS`: Comma-separated accepted bootstrap tokens
//! - `GATEWAY_GRPC_CLIENT_CERT_DIR`: Client bundle handed out on enrollment
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use control_plane_gateway::infrastructure::health::{HealthServer, HealthServerState};
use control_plane_gateway::infrastructure::telemetry;
use control_plane_gateway::{
    AdvertisedEndpoint, GatewayConfig, GatewayInstance, NodeControlService, TokenRegistry,
    init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout when draining is unbounded.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered unregistration notices.
const UNREGISTER_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting control-plane gateway");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env().context("failed to load gateway configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let registry = Arc::new(TokenRegistry::new(config.bootstrap_tokens.iter()));
    if registry.bootstrap_token_count() == 0 {
        tracing::warn!("No bootstrap tokens configured, enrollment will reject every node");
    }

    let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_CHANNEL_CAPACITY);
    tokio::spawn(watch_unregistrations(unregister_rx, Arc::clone(&registry)));

    let service = Arc::new(NodeControlService::new(
        registry,
        AdvertisedEndpoint::new(advertise_ip(&config), &config.endpoint),
        config.peer_tls.clone(),
        unregister_tx.clone(),
    ));

    let instance = GatewayInstance::from_config(service, &config, unregister_tx);
    let handle = instance.handle();

    // Spawn health server
    if config.settings.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            handle.clone(),
        ));
        let health_server = HealthServer::new(
            config.settings.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    let mut running = tokio::spawn(instance.run());

    tokio::select! {
        () = await_shutdown(shutdown_token.clone()) => {
            handle.stop();
            let deadline = config.settings.drain_timeout.unwrap_or(SHUTDOWN_TIMEOUT)
                + Duration::from_secs(1);
            match tokio::time::timeout(deadline, &mut running).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::error!(error = %e, "Gateway stopped with error"),
                Ok(Err(e)) => tracing::error!(error = %e, "Gateway task failed"),
                Err(_) => {
                    tracing::warn!("Gateway did not stop in time, aborting");
                    running.abort();
                }
            }
        }
        joined = &mut running => {
            shutdown_token.cancel();
            joined.context("gateway task failed")??;
        }
    }

    tracing::info!("Control-plane gateway stopped");
    Ok(())
}

/// Address handed to enrolling nodes.
fn advertise_ip(config: &GatewayConfig) -> IpAddr {
    config.advertise_ip.unwrap_or_else(|| {
        if config.settings.bind_ip.is_unspecified() {
            tracing::warn!("GATEWAY_ADVERTISE_IP not set, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            config.settings.bind_ip
        }
    })
}

/// Log nodes as they leave.
async fn watch_unregistrations(mut rx: mpsc::Receiver<String>, registry: Arc<TokenRegistry>) {
    while rx.recv().await.is_some() {
        tracing::info!(
            active_nodes = registry.active_nodes(),
            "Node left the control plane"
        );
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        grpc_port = config.endpoint.grpc_port,
        bootstrap_port = config.endpoint.bootstrap_port,
        network_port = config.endpoint.network_port,
        bind_ip = %config.settings.bind_ip,
        health_port = config.settings.health_port,
        reflection = config.settings.reflection_enabled,
        "Configuration loaded"
    );
    tracing::debug!(
        peer_ca = %config.peer_tls.ca_cert().display(),
        bootstrap_ca = %config.bootstrap_tls.ca_cert().display(),
        enrollment_methods = ?config.settings.enrollment_methods,
        "TLS and enrollment settings"
    );
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!("Graceful shutdown started");
}
