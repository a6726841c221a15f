//! Health probe endpoints.
//!
//! All configured health paths answer with the same JSON document shape:
//! `{status, checks, version, timestamp}`. Liveness paths report on the
//! process only; readiness folds in capacity and shutdown state. Healthy
//! and degraded both answer 200 so load balancers keep routing; unhealthy
//! answers 503.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::shutdown::Shutdown;
use crate::state::{now_ms, ServerState};

/// Overall and per-check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One named check inside the document.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub detail: String,
}

/// The wire document.
#[derive(Debug, Clone, Serialize)]
pub struct HealthDocument {
    pub status: HealthStatus,
    pub checks: BTreeMap<&'static str, HealthCheck>,
    pub version: &'static str,
    pub timestamp: u64,
}

/// Capacity fraction above which the gateway reports degraded.
const DEGRADED_UTILIZATION: f64 = 0.9;

/// Evaluate the full readiness document.
pub fn evaluate(state: &ServerState, shutdown: &Shutdown) -> HealthDocument {
    let mut checks = BTreeMap::new();

    let utilization = state.registry.utilization();
    checks.insert(
        "tunnels",
        HealthCheck {
            status: if shutdown.is_triggered() {
                HealthStatus::Unhealthy
            } else if utilization >= DEGRADED_UTILIZATION {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            detail: format!(
                "{}/{} registered",
                state.registry.count(),
                state.config.max_tunnels
            ),
        },
    );

    let pending = state.correlator.pending_count();
    checks.insert(
        "pending_requests",
        HealthCheck {
            status: if pending >= state.config.pending_critical {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            detail: format!("{} in flight", pending),
        },
    );

    checks.insert(
        "uptime",
        HealthCheck {
            status: HealthStatus::Healthy,
            detail: format!("{}s", state.started_at.elapsed().as_secs()),
        },
    );

    let status = if shutdown.is_triggered() {
        HealthStatus::Unhealthy
    } else if checks
        .values()
        .any(|check| check.status == HealthStatus::Degraded)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthDocument {
        status,
        checks,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now_ms(),
    }
}

/// Liveness document: the process is running; nothing else is examined.
pub fn liveness() -> HealthDocument {
    HealthDocument {
        status: HealthStatus::Healthy,
        checks: BTreeMap::new(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now_ms(),
    }
}

/// Answer a configured health path.
pub fn respond(
    state: &Arc<ServerState>,
    shutdown: &Shutdown,
    path: &str,
) -> Response<Full<Bytes>> {
    let document = if path.ends_with("/live") {
        liveness()
    } else {
        evaluate(state, shutdown)
    };

    let status = match document.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = serde_json::to_vec(&document).unwrap_or_else(|_| b"{}".to_vec());

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::from(Bytes::from(body)))
        .expect("static response always builds")
}
