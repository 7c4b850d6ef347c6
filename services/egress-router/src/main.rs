//! plfm-vt Egress Router
//!
//! Transparent TCP bridge from local listener ports to fixed destinations.
//!
//! This service:
//! - Binds one listener per configured port
//! - Dials the listener's destination for every accepted connection
//! - Relays bytes both ways until both directions finish
//! - Logs connection lifecycle, byte counts and classified errors

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_egress_router::config::Config;
use plfm_egress_router::{serve, SharedObserver, TracingObserver};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EGRESS_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(server = %config.server_name, "Starting TCP egress router");
    for spec in &config.listeners {
        info!(
            server = %config.server_name,
            protocol = %spec.protocol_label,
            listen_port = spec.listen_port,
            destination = %spec.destination(),
            "Listener configured"
        );
    }
    info!(
        bind_ip = %config.bind_ip,
        max_connections = config.max_connections,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        half_close_timeout_ms = config.half_close_timeout.as_millis() as u64,
        listener_count = config.listeners.len(),
        "Configuration loaded"
    );

    let observer: SharedObserver = Arc::new(TracingObserver::new(config.server_name.clone()));
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    };

    serve(
        config.listeners.clone(),
        config.listener_config(),
        observer,
        shutdown,
    )
    .await?;

    info!("Egress router stopped");
    Ok(())
}
