//! cok-server: public gateway and control-channel listener.
//!
//! Configuration comes from the environment (see `config`); the process
//! exits non-zero on configuration or bind errors and drains gracefully on
//! SIGINT/SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use cok_core::ServerError;
use cok_protocol::DisconnectReason;

use cok_server::config::ServerConfig;
use cok_server::control::run_control_listener;
use cok_server::gateway::run_gateway;
use cok_server::shutdown::Shutdown;
use cok_server::state::ServerState;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> ExitCode {
    let http_addr = format!("0.0.0.0:{}", config.http_port);
    let tcp_addr = format!("0.0.0.0:{}", config.tcp_port);

    let http_listener = match TcpListener::bind(&http_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %http_addr, error = %err, "failed to bind gateway port");
            return ExitCode::FAILURE;
        }
    };
    let control_listener = match TcpListener::bind(&tcp_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %tcp_addr, error = %err, "failed to bind control port");
            return ExitCode::FAILURE;
        }
    };

    info!(
        http = %http_addr,
        control = %tcp_addr,
        base_domain = %config.base_domain,
        max_tunnels = config.max_tunnels,
        "cok-server starting"
    );

    let shutdown_timeout = config.shutdown_timeout;
    let state = ServerState::new(config);
    let shutdown = Shutdown::new();

    let gateway = tokio::spawn(run_gateway(
        http_listener,
        state.clone(),
        shutdown.clone(),
    ));
    let control = tokio::spawn(run_control_listener(
        control_listener,
        state.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(log_metrics_periodically(state.clone(), shutdown.clone()));

    wait_for_signal().await;
    info!("shutdown signal received, draining");
    shutdown.trigger();

    // Ordered drain: stop accepting (listeners watch the signal), fail
    // what is pending, tell every tunnel goodbye, then wait a bounded
    // amount for the listener tasks.
    let failed = state
        .correlator
        .fail_all(ServerError::ServiceUnavailable { retry_after: None });
    if failed > 0 {
        info!(failed, "failed pending requests for shutdown");
    }
    let dropped = state.registry.disconnect_all(DisconnectReason::ServerShutdown);
    if !dropped.is_empty() {
        info!(tunnels = dropped.len(), "closed tunnels for shutdown");
    }

    let drain = async {
        let _ = gateway.await;
        let _ = control.await;
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        error!("drain timed out, exiting anyway");
    }

    info!("cok-server stopped");
    ExitCode::SUCCESS
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
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

/// Emit a metrics summary once a minute at debug level.
async fn log_metrics_periodically(state: Arc<ServerState>, shutdown: Shutdown) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                debug!(tunnels = state.registry.count(), "{}", state.metrics.snapshot().summary());
            }
            _ = shutdown.wait() => break,
        }
    }
}
