//! depot - file-transfer sidecar.
//!
//! Stores uploaded archives, serves them back on authorized download, and
//! stays synchronized with a remote control plane over one persistent
//! connection. The connection carries three kinds of traffic on a single
//! asynchronous stream: fire-and-forget events, correlated RPC, and
//! inbound commands.
//!
//! ```text
//! transfer routes (external) ──> Depot ──> FileRegistry ──┐
//!                                  │                      │ events
//!                                  └── LinkHandle <───────┘
//!                                         │
//!                                    LinkManager <──> control plane
//!                                         │
//!                                   MessageRouter ──> FileRegistry
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod link;
pub mod registry;
pub mod service;

pub use config::Config;
pub use error::{DepotError, Result};
pub use service::Depot;
