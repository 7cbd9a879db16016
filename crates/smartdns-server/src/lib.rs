//! # SmartDNS Server
//!
//! The serving half of SmartDNS:
//!
//! - **UDP/TCP listeners** dispatching one task per query or connection
//! - **Query engine** answering from local zones, with wildcard and CNAME
//!   handling, additional-section synthesis, and dual caching
//! - **Reload coordinator** swapping zones on file changes, gated on a
//!   strictly increasing serial
//!
//! Graceful shutdown flows through a `tokio::sync::watch` channel: every
//! listener selects on it and stops accepting; the binary drains in-flight
//! handlers with a bounded timeout.

use thiserror::Error;

pub mod engine;
pub mod handler;
pub mod reload;
pub mod tcp;
pub mod udp;

pub use engine::QueryEngine;
pub use handler::{QueryContext, QueryHandler};
pub use reload::ReloadCoordinator;
pub use tcp::TcpServer;
pub use udp::UdpServer;

/// Maximum UDP payload we advertise and honor (EDNS0).
pub const MAX_UDP_PAYLOAD: u16 = 4096;

/// Transport a query arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// Returns the lowercase protocol name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
