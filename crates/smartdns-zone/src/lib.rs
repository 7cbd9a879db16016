//! # SmartDNS Zone Management
//!
//! This crate owns everything zone-shaped in SmartDNS:
//!
//! - **Zone file model**: JSON zone files decoded into typed records
//! - **Zone index**: an immutable, lookup-ready representation of one zone
//! - **Zone loader**: directory walking and per-file parsing
//! - **Zone store**: the process-wide registry with longest-suffix lookup
//!   and atomic swap
//!
//! A [`ZoneIndex`] is never mutated after it is built. The [`ZoneStore`]
//! hands out `Arc<ZoneIndex>` handles; readers drop the store lock
//! immediately and work against the immutable index lock-free. Replacing a
//! zone is a single map insert under the write lock.

use std::path::PathBuf;

use thiserror::Error;

pub mod loader;
pub mod model;
pub mod store;

pub use loader::{is_zone_file, load_dir, read_zone_file};
pub use model::{
    ensure_fqdn, normalize_fqdn, MxRecord, RecordKind, Rrset, RrsetData, Soa, SrvRecord, ZoneFile,
    ZoneIndex,
};
pub use store::ZoneStore;

/// Errors that can occur while loading or indexing zones.
#[derive(Debug, Error)]
pub enum ZoneError {
    /// I/O error reading a zone file or walking the zones directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a zone file.
    #[error("zone file parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// DNS wire-format error while building records.
    #[error("protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// Zone data that fails validation; rejects the whole zone.
    #[error("invalid zone data: {0}")]
    Invalid(String),

    /// The zones directory produced no loadable zones.
    #[error("no zones loaded from {}", dir.display())]
    NoZones {
        /// The directory that was scanned.
        dir: PathBuf,
    },
}

impl ZoneError {
    /// Creates a new invalid-zone error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Result type for zone operations.
pub type Result<T> = std::result::Result<T, ZoneError>;
