//! Disk usage reporting for the storage volume.
//!
//! The control plane uses these reports to decide whether it can grant more
//! uploads, so a failed probe must not fail the caller: it logs and reports
//! zeroes instead.

use std::path::Path;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::link::protocol::{payload, Payload};

/// Byte counts for the filesystem backing the storage root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl DiskUsage {
    /// Read filesystem statistics for the volume containing `path`.
    ///
    /// Errors are logged and yield a zeroed report.
    pub fn probe(path: &Path) -> Self {
        match fs2::statvfs(path) {
            Ok(stats) => {
                let total = stats.total_space();
                // Space available to unprivileged writers, not raw free blocks.
                let free = stats.available_space();
                Self {
                    total,
                    used: total.saturating_sub(free),
                    free,
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "disk usage probe failed");
                Self::default()
            }
        }
    }

    pub fn to_payload(&self) -> Payload {
        payload([
            ("total", json!(self.total)),
            ("used", json!(self.used)),
            ("free", json!(self.free)),
        ])
    }
}
