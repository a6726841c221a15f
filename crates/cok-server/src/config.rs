//! Server configuration from environment variables.
//!
//! Everything has a default except `API_KEY_SECRET`, which is required and
//! must be at least 32 bytes: a short secret makes every derived API key
//! guessable. Invalid configuration is a startup failure, never a warning.

use std::time::Duration;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Why configuration loading failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `API_KEY_SECRET` is not set.
    MissingSecret,
    /// `API_KEY_SECRET` is shorter than the minimum.
    SecretTooShort { len: usize },
    /// A numeric variable did not parse.
    InvalidNumber { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingSecret => {
                write!(f, "API_KEY_SECRET is required")
            }
            ConfigError::SecretTooShort { len } => {
                write!(
                    f,
                    "API_KEY_SECRET is {} bytes, minimum is {}",
                    len, MIN_SECRET_LEN
                )
            }
            ConfigError::InvalidNumber { var, value } => {
                write!(f, "{} has invalid value {:?}", var, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Gateway process configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public HTTP port.
    pub http_port: u16,
    /// Control-channel TCP port.
    pub tcp_port: u16,
    /// Base domain under which tunnels are exposed.
    pub base_domain: String,
    /// Maximum simultaneous tunnels.
    pub max_tunnels: usize,
    /// Secret behind the stateless key derivation.
    pub api_key_secret: Vec<u8>,
    /// When non-empty, only these exact hosts (beyond tunnel hosts under
    /// the base domain) are served.
    pub allowed_hosts: Vec<String>,
    /// Paths answered by the health endpoint.
    pub health_check_paths: Vec<String>,
    /// Exact-match subdomain deny list.
    pub profanity_list: Vec<String>,
    /// How long the correlator waits for a tunnel's response.
    pub request_timeout: Duration,
    /// How long the first frame of a control connection may take.
    pub handshake_timeout: Duration,
    /// Bounded drain on shutdown.
    pub shutdown_timeout: Duration,
    /// Pending-request count above which new requests are refused.
    pub pending_critical: usize,
    /// Lifetime reported in connect responses.
    pub tunnel_ttl: Duration,
}

impl ServerConfig {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from any variable source; the seam tests use.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secret = match lookup("API_KEY_SECRET") {
            Some(s) if !s.is_empty() => s.into_bytes(),
            _ => return Err(ConfigError::MissingSecret),
        };
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort { len: secret.len() });
        }

        Ok(ServerConfig {
            http_port: parse_number(&lookup, "HTTP_PORT", 8080)?,
            tcp_port: parse_number(&lookup, "TCP_PORT", 5000)?,
            base_domain: lookup("BASE_DOMAIN").unwrap_or_else(|| "localhost".to_string()),
            max_tunnels: parse_number(&lookup, "MAX_TUNNELS", 1000)?,
            api_key_secret: secret,
            allowed_hosts: parse_csv(&lookup, "ALLOWED_HOSTS"),
            health_check_paths: {
                let paths = parse_csv(&lookup, "HEALTH_CHECK_PATHS");
                if paths.is_empty() {
                    vec![
                        "/health".to_string(),
                        "/health/live".to_string(),
                        "/health/ready".to_string(),
                    ]
                } else {
                    paths
                }
            },
            profanity_list: parse_csv(&lookup, "PROFANITY_LIST"),
            request_timeout: Duration::from_secs(parse_number(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                30u64,
            )?),
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(parse_number(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                30u64,
            )?),
            pending_critical: parse_number(&lookup, "PENDING_CRITICAL", 10_000)?,
            tunnel_ttl: Duration::from_secs(86_400),
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            var,
            value,
        }),
        None => Ok(default),
    }
}

fn parse_csv(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Vec<String> {
    lookup(var)
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
