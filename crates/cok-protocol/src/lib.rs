//! Wire protocol for the cok tunnel: a fixed-header, CRC-protected frame
//! envelope carrying a closed set of control and data messages over a
//! persistent TCP connection.
//!
//! The [`frame`] module owns the envelope (header, length prefix, checksum)
//! and the streaming decoder; [`message`] owns the payload records; [`wire`]
//! holds the little-endian primitives both are built on. Size limits shared
//! by server and client live in [`limits`].

#![deny(unsafe_code)]

mod error;
mod frame;
mod limits;
mod message;
mod wire;

pub use error::*;
pub use frame::*;
pub use limits::*;
pub use message::*;
pub use wire::*;
