//! Shared services for the cok tunnel: authentication, subdomain
//! validation, rate limiting, circuit breaking, and the error taxonomy used
//! by both the gateway and the client.

#![deny(unsafe_code)]

mod auth;
mod breaker;
mod error;
mod ratelimit;
mod subdomain;

pub use auth::*;
pub use breaker::*;
pub use error::*;
pub use ratelimit::*;
pub use subdomain::*;

// Protocol-level errors complete the taxonomy.
pub use cok_protocol::ProtocolError;
