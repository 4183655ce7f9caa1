//! Pending-call registry for request/response correlation.
//!
//! A `call` registers its correlation id here *before* the request is
//! transmitted, so a response cannot race past an unregistered waiter.
//! Each slot resolves at most once; resolution removes the entry outright.
//! When the connection drops, `abandon_all` clears the table and the dropped
//! senders wake every waiter with a link-lost error.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::link::protocol::Payload;

#[derive(Debug, Default)]
pub struct CorrelationTable {
    slots: DashMap<String, oneshot::Sender<Payload>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a waiting slot for `id`. Must be called before the request
    /// carrying that id is sent.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id.to_string(), tx);
        rx
    }

    /// Deliver `data` to the slot registered under `id`, removing it.
    ///
    /// Returns the payload back if no slot is registered — either the
    /// envelope is an inbound command that happens to carry a correlation
    /// id, or an orphaned response from a connection that already abandoned
    /// its callers. The caller decides which.
    pub fn resolve(&self, id: &str, data: Payload) -> Option<Payload> {
        match self.slots.remove(id) {
            Some((_, tx)) => {
                // A dropped receiver means the caller timed out; nothing to do.
                if tx.send(data).is_err() {
                    debug!(%id, "response arrived after the caller gave up");
                }
                None
            }
            None => Some(data),
        }
    }

    /// Remove a slot without resolving it (call timeout expiry).
    pub fn remove(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Drop every outstanding slot. Waiters observe the closed channel and
    /// report the link as lost. Returns how many calls were abandoned.
    pub fn abandon_all(&self) -> usize {
        let abandoned = self.slots.len();
        self.slots.clear();
        abandoned
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::protocol::payload;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_then_resolve() {
        let table = CorrelationTable::new();
        let rx = table.register("a");

        assert!(table.resolve("a", payload([("ok", json!(true))])).is_none());
        let data = rx.await.unwrap();
        assert_eq!(data.get("ok").and_then(|v| v.as_bool()), Some(true));
        assert!(table.is_empty());
    }

    #[test]
    fn test_orphan_resolution_returns_payload() {
        let table = CorrelationTable::new();
        let data = payload([("id", json!("x"))]);

        let returned = table.resolve("never-registered", data).unwrap();
        assert_eq!(returned.get("id").and_then(|v| v.as_str()), Some("x"));
    }

    #[test]
    fn test_remove_unregisters() {
        let table = CorrelationTable::new();
        let _rx = table.register("a");

        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert!(table.resolve("a", Payload::new()).is_some());
    }

    #[tokio::test]
    async fn test_abandon_all_wakes_waiters() {
        let table = CorrelationTable::new();
        let rx1 = table.register("a");
        let rx2 = table.register("b");

        assert_eq!(table.abandon_all(), 2);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_independently() {
        let table = Arc::new(CorrelationTable::new());

        let waiters: Vec<_> = (0..16)
            .map(|i| {
                let rx = table.register(&format!("call-{i}"));
                tokio::spawn(async move { rx.await.unwrap() })
            })
            .collect();

        // Resolve in reverse order to shake out any accidental coupling.
        for i in (0..16).rev() {
            let delivered = table
                .resolve(&format!("call-{i}"), payload([("n", json!(i))]))
                .is_none();
            assert!(delivered);
        }

        for (i, waiter) in waiters.into_iter().enumerate() {
            let data = waiter.await.unwrap();
            assert_eq!(data.get("n").and_then(|v| v.as_u64()), Some(i as u64));
        }
    }
}
