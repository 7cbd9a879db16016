//! # SmartDNS Iterative Resolver
//!
//! Resolution for names outside every local zone, starting at the IANA
//! root servers and following the delegation chain:
//!
//! - **Referral following** with glue from the additional section
//! - **Glue bootstrap**: when a referral carries no glue, the first NS
//!   target's A record is resolved against the current server set
//! - **CNAME chasing** against the same server set when the answer lacks
//!   the requested type
//! - **Truncation fallback** from UDP to TCP per server
//!
//! Resolution is strictly non-recursive upstream and bounded: at most 16
//! referral steps, 3 s per UDP attempt, 5 s per TCP attempt. A resolution
//! that exhausts its servers yields no response at all; the caller treats
//! that as a soft failure.

use thiserror::Error;

pub mod iterative;
pub mod roots;

pub use iterative::{IterativeResolver, ResolverConfig};
pub use roots::{root_server_addrs, ROOT_SERVERS};

/// Errors from a single upstream exchange.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed query or reply.
    #[error("protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// The server did not answer within the attempt timeout.
    #[error("upstream timed out")]
    Timeout,
}

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, ResolveError>;
