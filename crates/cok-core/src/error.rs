//! Error taxonomy shared by the server and client crates.
//!
//! Three families live here: client-side conditions, server-side
//! conditions, and transport conditions. Protocol (codec) errors are a
//! fourth family defined next to the codec in `cok-protocol` and re-exported
//! from this crate's root.
//!
//! Recoverable variants carry a retry hint where one is meaningful; the
//! gateway maps variants to HTTP statuses via [`ClientError::http_status`]
//! and [`ServerError::http_status`].

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::subdomain::SubdomainError;

/// Conditions originating from a client's request or its local environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Requested subdomain failed validation.
    InvalidSubdomain(SubdomainError),
    /// Presented API key did not validate.
    AuthenticationFailed,
    /// Caller exhausted its token bucket.
    RateLimitExceeded {
        /// How long until a retry can succeed.
        retry_after: Duration,
    },
    /// Request was malformed at the gateway boundary.
    InvalidRequest { message: String },
    /// The client could not reach its loopback origin.
    LocalOriginUnreachable { host: String, port: u16 },
    /// The control connection could not be established.
    ConnectionFailed { message: String },
    /// The operation did not finish in time.
    Timeout,
}

impl ClientError {
    /// HTTP status the gateway answers with for this condition.
    pub fn http_status(&self) -> u16 {
        match self {
            ClientError::InvalidSubdomain(_) => 400,
            ClientError::AuthenticationFailed => 401,
            ClientError::RateLimitExceeded { .. } => 429,
            ClientError::InvalidRequest { .. } => 400,
            ClientError::LocalOriginUnreachable { .. } => 502,
            ClientError::ConnectionFailed { .. } => 502,
            ClientError::Timeout => 504,
        }
    }

    /// Retry hint, when one is meaningful.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::InvalidSubdomain(reason) => {
                write!(f, "invalid subdomain: {}", reason)
            }
            ClientError::AuthenticationFailed => write!(f, "authentication failed"),
            ClientError::RateLimitExceeded { retry_after } => {
                write!(
                    f,
                    "rate limit exceeded, retry in {:.1}s",
                    retry_after.as_secs_f64()
                )
            }
            ClientError::InvalidRequest { message } => {
                write!(f, "invalid request: {}", message)
            }
            ClientError::LocalOriginUnreachable { host, port } => {
                write!(f, "local origin {}:{} is unreachable", host, port)
            }
            ClientError::ConnectionFailed { message } => {
                write!(f, "connection failed: {}", message)
            }
            ClientError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::InvalidSubdomain(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<SubdomainError> for ClientError {
    fn from(err: SubdomainError) -> Self {
        ClientError::InvalidSubdomain(err)
    }
}

/// Conditions raised inside the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Unexpected internal failure.
    Internal { message: String },
    /// The gateway is at capacity.
    ServiceUnavailable {
        /// How long the caller should wait before retrying, if known.
        retry_after: Option<Duration>,
    },
    /// Another live tunnel already owns the subdomain.
    SubdomainTaken { subdomain: String },
    /// No tunnel with this id is registered.
    TunnelNotFound { id: Uuid },
    /// A tracked request hit its correlation timeout.
    RequestTimeout,
    /// The gateway gave up waiting on the tunnel.
    GatewayTimeout,
}

impl ServerError {
    /// HTTP status the gateway answers with for this condition.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::Internal { .. } => 500,
            ServerError::ServiceUnavailable { .. } => 503,
            ServerError::SubdomainTaken { .. } => 409,
            ServerError::TunnelNotFound { .. } => 404,
            ServerError::RequestTimeout => 504,
            ServerError::GatewayTimeout => 504,
        }
    }

    /// Retry hint, when one is meaningful.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServerError::ServiceUnavailable { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Internal { message } => write!(f, "internal error: {}", message),
            ServerError::ServiceUnavailable { .. } => write!(f, "service unavailable"),
            ServerError::SubdomainTaken { subdomain } => {
                write!(f, "subdomain {:?} is already in use", subdomain)
            }
            ServerError::TunnelNotFound { id } => write!(f, "tunnel {} not found", id),
            ServerError::RequestTimeout => write!(f, "request timed out"),
            ServerError::GatewayTimeout => write!(f, "gateway timed out waiting for tunnel"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Transport-level conditions on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Peer went away mid-stream.
    ConnectionLost,
    /// Peer refused the connection.
    ConnectionRefused {
        /// Backoff hint for the reconnect loop.
        retry_after: Option<Duration>,
    },
    /// Host name did not resolve.
    DnsFailure { host: String },
    /// TLS negotiation with an upstream proxy failed.
    TlsHandshake,
    /// Socket write failed.
    Write { message: String },
    /// Socket read failed.
    Read { message: String },
    /// An internal channel's peer was dropped.
    ChannelClosed,
}

impl NetworkError {
    /// Retry hint, when one is meaningful.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            NetworkError::ConnectionRefused { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a socket error into this taxonomy.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => NetworkError::ConnectionRefused { retry_after: None },
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => NetworkError::ConnectionLost,
            ErrorKind::NotFound => NetworkError::DnsFailure {
                host: String::new(),
            },
            ErrorKind::WriteZero => NetworkError::Write {
                message: err.to_string(),
            },
            _ => NetworkError::Read {
                message: err.to_string(),
            },
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::ConnectionLost => write!(f, "connection lost"),
            NetworkError::ConnectionRefused { .. } => write!(f, "connection refused"),
            NetworkError::DnsFailure { host } => write!(f, "dns lookup failed for {:?}", host),
            NetworkError::TlsHandshake => write!(f, "tls handshake failed"),
            NetworkError::Write { message } => write!(f, "write failed: {}", message),
            NetworkError::Read { message } => write!(f, "read failed: {}", message),
            NetworkError::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for NetworkError {}
