//! Persistence layer: graph, audit ledger, settings and raw-message archive.

mod blob;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use blob::FsBlobStore;
pub use libsql_backend::LibSqlBackend;
pub use traits::{AuditStore, BlobStore, EdgeWrite, GraphStore, SettingsStore};
