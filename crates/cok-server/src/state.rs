//! Shared gateway state assembled at startup.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use cok_core::{AuthService, RateLimiter, RateLimiterConfig, SubdomainValidator};

use crate::config::ServerConfig;
use crate::correlator::RequestCorrelator;
use crate::metrics::GatewayMetrics;
use crate::registry::TunnelRegistry;

/// Everything the listener tasks share.
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: TunnelRegistry,
    pub correlator: RequestCorrelator,
    pub auth: AuthService,
    pub validator: SubdomainValidator,
    /// Per-IP limiter for public HTTP traffic.
    pub http_limiter: RateLimiter,
    /// Per-IP limiter for control-connection attempts.
    pub conn_limiter: RateLimiter,
    pub metrics: GatewayMetrics,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(ServerState {
            registry: TunnelRegistry::new(config.max_tunnels),
            correlator: RequestCorrelator::new(config.request_timeout),
            auth: AuthService::new(config.api_key_secret.clone()),
            validator: SubdomainValidator::with_deny_list(config.profanity_list.clone()),
            http_limiter: RateLimiter::new(RateLimiterConfig::http()),
            conn_limiter: RateLimiter::new(RateLimiterConfig::connection()),
            metrics: GatewayMetrics::new(),
            started_at: Instant::now(),
            config,
        })
    }

    /// Public URL a tunnel is reachable under.
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("https://{}.{}", subdomain, self.config.base_domain)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
