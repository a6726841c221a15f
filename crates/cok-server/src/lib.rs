//! Gateway side of the cok tunnel: accepts public HTTP on one port and
//! persistent control connections on another, correlating forwarded
//! requests with the responses tunnelled back by remote clients.

#![deny(unsafe_code)]

pub mod config;
pub mod control;
pub mod correlator;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod shutdown;
pub mod state;

pub use config::{ConfigError, ServerConfig};
pub use correlator::RequestCorrelator;
pub use registry::{Tunnel, TunnelLink, TunnelRegistry};
pub use shutdown::Shutdown;
pub use state::ServerState;
