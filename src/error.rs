//! Error taxonomy for the sidecar core.
//!
//! Validation failures and link outages are recoverable and surface to the
//! caller as plain errors. `StorageDiverged` is the one unrecoverable case:
//! the stored-item registry and the disk no longer agree, and the embedding
//! process must treat it as fatal.

use std::time::Duration;

use thiserror::Error;

use crate::link::protocol::Route;

#[derive(Debug, Error)]
pub enum DepotError {
    #[error("invalid item id {0:?}")]
    InvalidId(String),

    #[error("control-plane link is down")]
    LinkLost,

    #[error("{route} call timed out after {timeout:?}")]
    CallTimeout { route: Route, timeout: Duration },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("invalid control-plane host {0:?}")]
    InvalidHost(String),

    #[error("storage diverged from registry for item {id}")]
    StorageDiverged {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for sidecar operations.
pub type Result<T> = std::result::Result<T, DepotError>;
