//! The sidecar service object.
//!
//! [`Depot`] owns the registries and the link handle, constructed once at
//! startup and shared by reference with the transfer routes. The HTTP layer
//! that accepts upload bytes and serves downloads lives outside this crate;
//! it drives the sidecar exclusively through this surface and never touches
//! the connection or the registries directly.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::link::correlation::CorrelationTable;
use crate::link::protocol::{payload, Route};
use crate::link::router::MessageRouter;
use crate::link::{LinkHandle, LinkManager, OUTBOUND_QUEUE_SIZE};
use crate::registry::FileRegistry;

pub struct Depot {
    registry: Arc<FileRegistry>,
    link: LinkHandle,
}

impl Depot {
    /// Build the service and its link manager.
    ///
    /// Scans the storage directory before returning, so the stored-item set
    /// is authoritative by the time anything can query it. The returned
    /// [`LinkManager`] must be driven (`run`) for the link to come up.
    pub async fn new(config: Arc<Config>) -> Result<(Arc<Self>, LinkManager)> {
        let correlation = Arc::new(CorrelationTable::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let link = LinkHandle::new(outbound_tx, correlation.clone());

        let registry = Arc::new(FileRegistry::new(config.storage_path.clone(), link.clone()));
        registry.scan().await?;

        let router = MessageRouter::new(correlation.clone(), registry.clone(), link.clone());
        let manager = LinkManager::new(config, correlation, router, registry.clone(), outbound_rx);

        let depot = Arc::new(Self { registry, link });
        Ok((depot, manager))
    }

    pub async fn item_exists(&self, id: &str) -> bool {
        self.registry.item_exists(id).await
    }

    pub async fn stored_count(&self) -> usize {
        self.registry.stored_count().await
    }

    pub fn item_path(&self, id: &str) -> PathBuf {
        self.registry.item_path(id)
    }

    pub async fn expect_upload(&self, id: &str) -> Result<()> {
        self.registry.expect_upload(id).await
    }

    pub async fn consume_expected_upload(&self, id: &str) -> bool {
        self.registry.consume_expected_upload(id).await
    }

    pub async fn record_uploaded(&self, id: &str) -> Result<u64> {
        self.registry.record_uploaded(id).await
    }

    pub async fn delete_item(&self, id: &str) -> bool {
        self.registry.delete_item(id).await
    }

    pub async fn downloaded(&self, id: &str) {
        self.registry.downloaded(id).await;
    }

    /// Ask the control plane whether a download token grants access to an
    /// item. Short-circuits to denied when the item is not stored here at
    /// all; malformed responses and link failures also deny.
    pub async fn verify_download_token(&self, id: &str, token: &str) -> (bool, String) {
        if !self.item_exists(id).await {
            return (false, String::new());
        }

        let response = self
            .link
            .call(
                Route::VerifyDownloadToken,
                payload([("id", json!(id)), ("token", json!(token))]),
            )
            .await;

        let data = match response {
            Ok(data) => data,
            Err(err) => {
                warn!(%id, error = %err, "verify-download-token call failed");
                return (false, String::new());
            }
        };

        let allowed = data.get("allowed").and_then(|v| v.as_bool());
        let name = data.get("name").and_then(|v| v.as_str());
        match (allowed, name) {
            (Some(allowed), Some(name)) => (allowed, name.to_string()),
            _ => {
                warn!(%id, "malformed verify-download-token response");
                (false, String::new())
            }
        }
    }
}
