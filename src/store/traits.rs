//! `TriageLog` trait: dedup ledger, audit log and query surface in one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::{Category, InboundMessage, Judgment, LogAction};

/// Default page size for log listings.
pub const DEFAULT_LOG_LIMIT: usize = 200;

/// Default page size for the review queue.
pub const DEFAULT_REVIEW_LIMIT: usize = 50;

/// Number of entries in the dashboard's "recent" list.
pub const RECENT_ENTRIES: usize = 10;

/// One row of the audit log. Exactly one per message identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Row id assigned by the store; 0 before insertion.
    pub id: i64,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub category: Category,
    pub confidence: f32,
    pub reply_text: String,
    pub action: LogAction,
    /// Judgment came from the parser's fallback path.
    pub parse_fallback: bool,
    pub timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        message: &InboundMessage,
        judgment: &Judgment,
        action: LogAction,
        parse_fallback: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            category: judgment.category,
            confidence: judgment.confidence,
            reply_text: judgment.reply.clone(),
            action,
            parse_fallback,
            timestamp: now,
            updated_at: now,
        }
    }
}

/// Filter for `query_entries`. All bounds are inclusive.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub action: Option<LogAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            action: None,
            since: None,
            until: None,
            limit: DEFAULT_LOG_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub category: Category,
    pub count: u64,
}

/// Aggregates for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogStats {
    pub total: u64,
    /// Entries since midnight UTC.
    pub today: u64,
    /// Entries in the last seven days.
    pub week: u64,
    pub auto_sent: u64,
    pub manual_sent: u64,
    pub skipped: u64,
    pub error_sending: u64,
    /// auto-sent / total × 100, one decimal.
    pub automation_rate: f64,
    /// Mean confidence × 100, one decimal.
    pub avg_confidence: f64,
    pub fallback_judgments: u64,
    /// Ordered by count, descending.
    pub categories: Vec<CategoryCount>,
    pub recent: Vec<LogEntry>,
}

/// Persistence for triage decisions.
#[async_trait]
pub trait TriageLog: Send + Sync {
    /// Create or upgrade the schema.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Whether an entry exists for this message.
    async fn has_seen(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Append an entry. Returns `false` if the message was already present,
    /// in which case nothing is written.
    async fn record(&self, entry: &LogEntry) -> Result<bool, DatabaseError>;

    async fn get_entry(&self, message_id: &str) -> Result<Option<LogEntry>, DatabaseError>;

    /// Move an entry from `from` to `to`. Returns `false` when the entry is
    /// missing or no longer in `from`.
    async fn transition_action(
        &self,
        message_id: &str,
        from: LogAction,
        to: LogAction,
    ) -> Result<bool, DatabaseError>;

    /// Entries matching the filter, newest first.
    async fn query_entries(&self, query: &LogQuery) -> Result<Vec<LogEntry>, DatabaseError>;

    /// `skipped` entries, newest first.
    async fn review_queue(&self, limit: usize) -> Result<Vec<LogEntry>, DatabaseError>;

    /// Dashboard aggregates relative to `now`.
    async fn stats(&self, now: DateTime<Utc>) -> Result<LogStats, DatabaseError>;
}
