//! libSQL backend: `TriageLog` over a local file or an in-memory database.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::{Category, LogAction};
use crate::store::migrations;
use crate::store::traits::{CategoryCount, LogEntry, LogQuery, LogStats, RECENT_ENTRIES, TriageLog};

/// libSQL database backend.
///
/// One connection reused for every operation; each ledger write is a single
/// statement, so no explicit transactions are needed.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn fetch_entries(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const ENTRY_COLUMNS: &str = "id, message_id, sender, subject, body, category, confidence, \
     reply_text, action, parse_fallback, timestamp, updated_at";

/// Fixed-width UTC timestamp so string comparison orders chronologically.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("bad timestamp '{s}': {e}")))
}

fn opt_ts(ts: Option<&DateTime<Utc>>) -> libsql::Value {
    match ts {
        Some(ts) => libsql::Value::Text(format_ts(ts)),
        None => libsql::Value::Null,
    }
}

/// Round to one decimal place.
fn one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Column order matches `ENTRY_COLUMNS`.
fn row_to_entry(row: &libsql::Row) -> Result<LogEntry, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let action_str: String = row.get(8).map_err(read)?;
    let action = action_str
        .parse::<LogAction>()
        .map_err(DatabaseError::Query)?;
    let category: String = row.get(5).map_err(read)?;
    let timestamp: String = row.get(10).map_err(read)?;
    let updated_at: String = row.get(11).map_err(read)?;

    Ok(LogEntry {
        id: row.get(0).map_err(read)?,
        message_id: row.get(1).map_err(read)?,
        sender: row.get(2).map_err(read)?,
        subject: row.get(3).map_err(read)?,
        body: row.get(4).map_err(read)?,
        category: Category::from_label(&category),
        confidence: row.get::<f64>(6).map_err(read)? as f32,
        reply_text: row.get(7).map_err(read)?,
        action,
        parse_fallback: row.get::<i64>(9).map_err(read)? != 0,
        timestamp: parse_ts(&timestamp)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TriageLog for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn has_seen(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM email_logs WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_seen: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("has_seen: {e}")))?;
        Ok(row.is_some())
    }

    async fn record(&self, entry: &LogEntry) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO email_logs (message_id, sender, subject, body, category,
                    confidence, reply_text, action, parse_fallback, timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.message_id.as_str(),
                    entry.sender.as_str(),
                    entry.subject.as_str(),
                    entry.body.as_str(),
                    entry.category.as_str(),
                    f64::from(entry.confidence),
                    entry.reply_text.as_str(),
                    entry.action.as_str(),
                    i64::from(entry.parse_fallback),
                    format_ts(&entry.timestamp),
                    format_ts(&entry.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record: {e}")))?;

        if inserted == 0 {
            debug!(message_id = %entry.message_id, "Entry already present, nothing written");
        }
        Ok(inserted > 0)
    }

    async fn get_entry(&self, message_id: &str) -> Result<Option<LogEntry>, DatabaseError> {
        let mut entries = self
            .fetch_entries(
                "get_entry",
                &format!("SELECT {ENTRY_COLUMNS} FROM email_logs WHERE message_id = ?1"),
                params![message_id],
            )
            .await?;
        Ok(entries.pop())
    }

    async fn transition_action(
        &self,
        message_id: &str,
        from: LogAction,
        to: LogAction,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE email_logs SET action = ?3, updated_at = ?4
                 WHERE message_id = ?1 AND action = ?2",
                params![message_id, from.as_str(), to.as_str(), format_ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_action: {e}")))?;
        Ok(updated == 1)
    }

    async fn query_entries(&self, query: &LogQuery) -> Result<Vec<LogEntry>, DatabaseError> {
        let action = match query.action {
            Some(a) => libsql::Value::Text(a.as_str().to_string()),
            None => libsql::Value::Null,
        };
        self.fetch_entries(
            "query_entries",
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM email_logs
                 WHERE (?1 IS NULL OR action = ?1)
                   AND (?2 IS NULL OR timestamp >= ?2)
                   AND (?3 IS NULL OR timestamp <= ?3)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?4"
            ),
            params![
                action,
                opt_ts(query.since.as_ref()),
                opt_ts(query.until.as_ref()),
                query.limit as i64,
            ],
        )
        .await
    }

    async fn review_queue(&self, limit: usize) -> Result<Vec<LogEntry>, DatabaseError> {
        self.query_entries(&LogQuery {
            action: Some(LogAction::Skipped),
            limit,
            ..Default::default()
        })
        .await
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<LogStats, DatabaseError> {
        let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let week_ago = now - chrono::Duration::days(7);

        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(timestamp >= ?1), 0),
                        COALESCE(SUM(timestamp >= ?2), 0),
                        COALESCE(SUM(action = 'auto-sent'), 0),
                        COALESCE(SUM(action = 'manual-sent'), 0),
                        COALESCE(SUM(action = 'skipped'), 0),
                        COALESCE(SUM(action = 'error_sending'), 0),
                        COALESCE(AVG(confidence), 0.0),
                        COALESCE(SUM(parse_fallback), 0)
                 FROM email_logs",
                params![format_ts(&midnight), format_ts(&week_ago)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?
            .ok_or_else(|| DatabaseError::Query("stats: aggregate returned no row".into()))?;

        let count = |i: i32| -> Result<u64, DatabaseError> {
            row.get::<i64>(i)
                .map(|n| n.max(0) as u64)
                .map_err(|e| DatabaseError::Query(format!("stats column {i}: {e}")))
        };
        let total = count(0)?;
        let today = count(1)?;
        let week = count(2)?;
        let auto_sent = count(3)?;
        let manual_sent = count(4)?;
        let skipped = count(5)?;
        let error_sending = count(6)?;
        let avg_confidence = row
            .get::<f64>(7)
            .map_err(|e| DatabaseError::Query(format!("stats column 7: {e}")))?;
        let fallback_judgments = count(8)?;

        let automation_rate = if total == 0 {
            0.0
        } else {
            one_decimal(auto_sent as f64 / total as f64 * 100.0)
        };

        let mut categories = Vec::new();
        let mut rows = self
            .conn()
            .query(
                "SELECT category, COUNT(*) FROM email_logs
                 GROUP BY category ORDER BY COUNT(*) DESC, category ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats categories: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats categories: {e}")))?
        {
            let label: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("stats categories: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("stats categories: {e}")))?;
            categories.push(CategoryCount {
                category: Category::from_label(&label),
                count: n.max(0) as u64,
            });
        }

        let recent = self
            .query_entries(&LogQuery {
                limit: RECENT_ENTRIES,
                ..Default::default()
            })
            .await?;

        Ok(LogStats {
            total,
            today,
            week,
            auto_sent,
            manual_sent,
            skipped,
            error_sending,
            automation_rate,
            avg_confidence: one_decimal(avg_confidence * 100.0),
            fallback_judgments,
            categories,
            recent,
        })
    }
}
