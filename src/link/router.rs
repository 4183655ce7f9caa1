//! Inbound envelope classification and command dispatch.
//!
//! Responses to our own calls are matched against the correlation table
//! first. Everything else is a command from the control plane, dispatched
//! over the closed route set. Unknown routes and malformed payloads are
//! logged and dropped; a live peer must never be able to kill the service
//! with a bad message.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, trace, warn};

use crate::link::correlation::CorrelationTable;
use crate::link::protocol::{payload, string_field, Envelope, Route};
use crate::link::LinkHandle;
use crate::registry::FileRegistry;

#[derive(Clone)]
pub struct MessageRouter {
    correlation: Arc<CorrelationTable>,
    registry: Arc<FileRegistry>,
    link: LinkHandle,
}

impl MessageRouter {
    pub fn new(
        correlation: Arc<CorrelationTable>,
        registry: Arc<FileRegistry>,
        link: LinkHandle,
    ) -> Self {
        Self {
            correlation,
            registry,
            link,
        }
    }

    /// Handle one inbound envelope. Runs on its own task so a slow command
    /// handler never stalls the read loop.
    pub async fn route(&self, mut envelope: Envelope) {
        if let Some(id) = envelope.correlation_id.clone() {
            match self.correlation.resolve(&id, envelope.data) {
                None => {
                    trace!(correlation_id = %id, "resolved pending call");
                    return;
                }
                // Not a response we are waiting on; dispatch as a command.
                Some(data) => envelope.data = data,
            }
        }

        match Route::parse(&envelope.route) {
            Some(Route::Delete) => self.handle_delete(envelope).await,
            Some(Route::ExpectUpload) => self.handle_expect_upload(envelope).await,
            Some(Route::VerifyDownloadToken) => {
                // Only ever initiated by us; a control-plane-initiated
                // variant is not part of the protocol.
                debug!("ignoring control-plane-initiated verify-download-token");
            }
            Some(other) => {
                warn!(route = %other, correlation_id = ?envelope.correlation_id,
                    "unexpected route from control plane");
            }
            None => {
                warn!(route = %envelope.route, "no handler for route; dropping");
            }
        }
    }

    async fn handle_delete(&self, envelope: Envelope) {
        let Some(id) = string_field(&envelope.data, "id") else {
            warn!("delete command without a string id");
            return;
        };

        let removed = self.registry.delete_item(&id).await;
        debug!(%id, removed, "processed delete command");

        self.ack(Envelope::reply(
            Route::Deleted,
            envelope.correlation_id,
            payload([("id", json!(id))]),
        ))
        .await;
    }

    async fn handle_expect_upload(&self, envelope: Envelope) {
        let Some(id) = string_field(&envelope.data, "id") else {
            warn!("expect-upload command without a string id");
            return;
        };

        // An invalid id is reported and skipped; the command is still acked
        // so the control plane does not hang on it.
        if let Err(err) = self.registry.expect_upload(&id).await {
            warn!(%id, error = %err, "expect-upload rejected");
        }

        self.ack(Envelope::reply(
            Route::ExpectUpload,
            envelope.correlation_id,
            payload([]),
        ))
        .await;
    }

    async fn ack(&self, envelope: Envelope) {
        if let Err(err) = self.link.send(envelope).await {
            warn!(error = %err, "dropping command ack");
        }
    }
}
