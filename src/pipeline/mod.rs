//! Triage pipeline.
//!
//! Every unread message flows through:
//! 1. `TriageLog::has_seen()`: skip anything already handled
//! 2. Model call + `parse_judgment()`: category, confidence, draft reply
//! 3. `decide()`: auto-send or hold for review
//! 4. Side effect, then exactly one `LogEntry`

pub mod handle;
pub mod judgment;
#[cfg(test)]
pub(crate) mod mocks;
pub mod policy;
pub mod processor;
pub mod types;
pub mod worker;

pub use handle::{TriageHandle, build_processor};
pub use processor::{ManualSend, TriageLocks, TriageProcessor};
pub use types::{BatchOutcome, Category, InboundMessage, Judgment, LogAction, Mailbox};
pub use worker::{InboxWorker, spawn_inbox_worker};
