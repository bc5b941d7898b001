mod config;
mod logging;
mod origin;
mod registry;
mod router;
mod server;
mod session;
mod sweeper;

use config::load_config;
use logging::init_logging;
use server::HubState;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    if let Err(err) = init_logging(&config) {
        eprintln!("logging_init_error: {err}");
    }
    if config.access_token.trim().is_empty() {
        error!(
            event = "invalid_config",
            error = "access token required (--access-token or SIGNAL_ACCESS_TOKEN)"
        );
        return;
    }
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        connect_timeout_s = config.connect_timeout.as_secs(),
        expiry_timeout_s = config.expiry_timeout.as_secs(),
        sweep_interval_s = config.sweep_interval.as_secs(),
        origins = config.allowed_origins.len()
    );

    let hub = Arc::new(HubState::new(config));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = server::serve(listener, hub.clone(), shutdown).await {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop", active = hub.registry().len().await);
}
