//! Authoritative local state: expected-upload permissions and stored items.
//!
//! The stored-item set mirrors the storage directory. `scan` rebuilds it at
//! startup; every later mutation (upload, delete) keeps the two in step.
//! Expected uploads are single-use grants from the control plane, consumed
//! on the first matching upload attempt whether or not the upload succeeds.
//!
//! Locks here guard only the in-memory sets; file and network I/O happen
//! after the lock is released.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::disk::DiskUsage;
use crate::error::{DepotError, Result};
use crate::link::protocol::{payload, Envelope, Route};
use crate::link::LinkHandle;

/// Extension for item backing files: `<storage-root>/<id>.zip`.
const ITEM_EXTENSION: &str = "zip";

pub struct FileRegistry {
    storage_root: PathBuf,
    expected: Mutex<HashSet<String>>,
    stored: Mutex<HashSet<String>>,
    link: LinkHandle,
}

fn is_valid_uuid(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

/// Extract the item id from a directory entry name: the leading
/// dot-delimited segment, if it parses as a UUID.
fn item_id_from_name(name: &str) -> Option<String> {
    let stem = name.split('.').next()?;
    is_valid_uuid(stem).then(|| stem.to_string())
}

impl FileRegistry {
    pub fn new(storage_root: PathBuf, link: LinkHandle) -> Self {
        Self {
            storage_root,
            expected: Mutex::new(HashSet::new()),
            stored: Mutex::new(HashSet::new()),
            link,
        }
    }

    /// Rebuild the stored-item set from the storage directory.
    ///
    /// Entries whose name does not start with a valid UUID segment are
    /// ignored; the directory may contain stray files. Must complete before
    /// the set is treated as authoritative.
    pub async fn scan(&self) -> Result<usize> {
        let mut found = HashSet::new();
        let mut entries = tokio::fs::read_dir(&self.storage_root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            match item_id_from_name(&name.to_string_lossy()) {
                Some(id) => {
                    found.insert(id);
                }
                None => debug!(entry = %name.to_string_lossy(), "ignoring non-item entry"),
            }
        }

        let count = found.len();
        let mut stored = self.stored.lock().await;
        *stored = found;
        info!(items = count, root = %self.storage_root.display(), "storage scan complete");
        Ok(count)
    }

    pub async fn item_exists(&self, id: &str) -> bool {
        self.stored.lock().await.contains(id)
    }

    pub async fn stored_count(&self) -> usize {
        self.stored.lock().await.len()
    }

    pub fn item_path(&self, id: &str) -> PathBuf {
        self.storage_root.join(format!("{id}.{ITEM_EXTENSION}"))
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Grant a single-use upload permission for `id`.
    ///
    /// Invalid ids are reported and not registered.
    pub async fn expect_upload(&self, id: &str) -> Result<()> {
        if !is_valid_uuid(id) {
            warn!(%id, "told to expect an upload for an invalid id");
            return Err(DepotError::InvalidId(id.to_string()));
        }

        self.expected.lock().await.insert(id.to_string());
        Ok(())
    }

    /// Atomic check-and-remove against the expected-upload set.
    ///
    /// This is the sole authorization gate for accepting an upload body.
    /// The grant is consumed even if the subsequent write fails; a failed
    /// upload needs a fresh grant to retry.
    pub async fn consume_expected_upload(&self, id: &str) -> bool {
        self.expected.lock().await.remove(id)
    }

    /// Record a durably written upload and report it upstream.
    ///
    /// Called only after the bytes are on disk. A stat failure at this
    /// point means the registry and the disk have diverged, which is
    /// unrecoverable.
    pub async fn record_uploaded(&self, id: &str) -> Result<u64> {
        self.stored.lock().await.insert(id.to_string());

        let path = self.item_path(id);
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                error!(%id, path = %path.display(), error = %err,
                    "cannot stat a just-written upload; registry and disk have diverged");
                return Err(DepotError::StorageDiverged {
                    id: id.to_string(),
                    source: err,
                });
            }
        };

        self.emit(Envelope::event(
            Route::Uploaded,
            payload([("id", json!(id)), ("size", json!(size))]),
        ))
        .await;

        Ok(size)
    }

    /// Remove a stored item and its backing file.
    ///
    /// Unknown ids are a no-op. Returns whether anything was removed.
    pub async fn delete_item(&self, id: &str) -> bool {
        if !self.stored.lock().await.remove(id) {
            return false;
        }

        let path = self.item_path(id);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(%id, path = %path.display(), error = %err, "failed to remove backing file");
        }

        self.send_disk_usage().await;
        true
    }

    /// Report current disk usage to the control plane.
    pub async fn send_disk_usage(&self) {
        let usage = DiskUsage::probe(&self.storage_root);
        self.emit(Envelope::event(Route::DiskUsage, usage.to_payload()))
            .await;
    }

    /// Notify the control plane that an item was served.
    pub async fn downloaded(&self, id: &str) {
        self.emit(Envelope::event(
            Route::Downloaded,
            payload([("id", json!(id))]),
        ))
        .await;
    }

    /// Best-effort event delivery; a downed link only costs the event.
    async fn emit(&self, envelope: Envelope) {
        if let Err(err) = self.link.send(envelope).await {
            warn!(error = %err, "dropping outbound event");
        }
    }
}
