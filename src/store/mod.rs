//! Persistence layer: the triage ledger and audit log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{LogEntry, LogQuery, LogStats, TriageLog};
