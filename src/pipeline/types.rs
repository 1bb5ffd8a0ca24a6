//! Shared types for the triage pipeline.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

// ── Inbound message ─────────────────────────────────────────────────

/// An unread email fetched from the mailbox.
///
/// Immutable once fetched; the pipeline only borrows it for one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Stable identifier within the mailbox (the `Message-ID` header when present).
    pub id: String,
    /// Raw `From` header, e.g. `Jane Doe <jane@example.com>`.
    pub sender: String,
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// IMAP UID, used to flag the message as read once handled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox_uid: Option<u32>,
}

impl InboundMessage {
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
            mailbox_uid: None,
        }
    }

    pub fn with_mailbox_uid(mut self, uid: u32) -> Self {
        self.mailbox_uid = Some(uid);
        self
    }
}

// ── Category ────────────────────────────────────────────────────────

/// Closed set of email categories the model may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Price Request")]
    PriceRequest,
    #[serde(rename = "Repair Inquiry")]
    RepairInquiry,
    #[serde(rename = "Appointment Request")]
    AppointmentRequest,
    #[serde(rename = "Other")]
    Other,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::PriceRequest,
        Category::RepairInquiry,
        Category::AppointmentRequest,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceRequest => "Price Request",
            Self::RepairInquiry => "Repair Inquiry",
            Self::AppointmentRequest => "Appointment Request",
            Self::Other => "Other",
        }
    }

    /// Map a label to a category, falling back to `Other` for anything unknown.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or(Self::Other)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    /// Case-insensitive, whitespace-tolerant match on the display label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown category '{wanted}'"))
    }
}

// ── Judgment ────────────────────────────────────────────────────────

/// Reply used whenever the model output cannot be trusted.
pub const FALLBACK_REPLY: &str =
    "Thank you for contacting us. We have received your message and will get back to you shortly.";

/// Structured classification of one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub category: Category,
    /// Always within `[0.0, 1.0]`.
    pub confidence: f32,
    pub reply: String,
}

impl Judgment {
    /// Build a judgment, clamping confidence into `[0, 1]`.
    pub fn new(category: Category, confidence: f32, reply: impl Into<String>) -> Self {
        Self {
            category,
            confidence: confidence.clamp(0.0, 1.0),
            reply: reply.into(),
        }
    }

    /// The conservative default: `Other`, zero confidence, generic reply.
    pub fn fallback() -> Self {
        Self::new(Category::Other, 0.0, FALLBACK_REPLY)
    }
}

/// Outcome of parsing model output. Always carries a judgment.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    Valid(Judgment),
    Fallback(Judgment),
}

impl ParseResult {
    pub fn judgment(&self) -> &Judgment {
        match self {
            Self::Valid(j) | Self::Fallback(j) => j,
        }
    }

    pub fn into_judgment(self) -> Judgment {
        match self {
            Self::Valid(j) | Self::Fallback(j) => j,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

// ── Decisions and actions ───────────────────────────────────────────

/// What the policy wants done with a judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    AttemptAutoSend,
    QueueForReview,
}

/// Recorded outcome for a message in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogAction {
    #[serde(rename = "auto-sent")]
    AutoSent,
    #[serde(rename = "manual-sent")]
    ManualSent,
    /// Awaiting human review; the stored reply is only a suggestion.
    #[serde(rename = "skipped")]
    Skipped,
    #[serde(rename = "error_sending")]
    ErrorSending,
}

impl LogAction {
    pub const ALL: [LogAction; 4] = [
        LogAction::AutoSent,
        LogAction::ManualSent,
        LogAction::Skipped,
        LogAction::ErrorSending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoSent => "auto-sent",
            Self::ManualSent => "manual-sent",
            Self::Skipped => "skipped",
            Self::ErrorSending => "error_sending",
        }
    }
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action '{s}'"))
    }
}

// ── Batch results ───────────────────────────────────────────────────

/// A message held for human review with its suggested reply.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub message: InboundMessage,
    pub judgment: Judgment,
}

/// Result of one `process_batch` call. Vectors keep input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub sent: Vec<InboundMessage>,
    pub queued: Vec<QueuedMessage>,
    /// Auto-send attempted and failed; logged as `error_sending`.
    pub send_failures: Vec<InboundMessage>,
    /// Already present in the ledger; no model call was made.
    pub already_seen: Vec<InboundMessage>,
    /// Judgments that came from the parser's fallback path.
    pub fallback_judgments: usize,
    /// The batch stopped early on a cancellation request.
    pub cancelled: bool,
}

impl BatchOutcome {
    /// Every message that now has a ledger entry or already had one.
    pub fn handled(&self) -> impl Iterator<Item = &InboundMessage> {
        self.sent
            .iter()
            .chain(self.queued.iter().map(|q| &q.message))
            .chain(self.send_failures.iter())
            .chain(self.already_seen.iter())
    }

    /// Number of messages that got a new ledger entry in this batch.
    pub fn processed(&self) -> usize {
        self.sent.len() + self.queued.len() + self.send_failures.len()
    }
}

// ── Mailbox collaborator ────────────────────────────────────────────

/// Mailbox adapter. Pure I/O with no triage logic.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Adapter name for logs (e.g. "imap").
    fn name(&self) -> &str;

    /// Fetch unread messages without flagging them as read.
    async fn fetch_unread(&self) -> Result<Vec<InboundMessage>, ChannelError>;

    /// Deliver a message.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError>;

    /// Flag messages as read once the pipeline has handled them.
    async fn mark_read(&self, _messages: &[InboundMessage]) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_is_case_insensitive() {
        assert_eq!(
            "  repair inquiry ".parse::<Category>().unwrap(),
            Category::RepairInquiry
        );
        assert_eq!(
            "PRICE REQUEST".parse::<Category>().unwrap(),
            Category::PriceRequest
        );
        assert!("Complaint".parse::<Category>().is_err());
    }

    #[test]
    fn category_unknown_label_maps_to_other() {
        assert_eq!(Category::from_label("Spam"), Category::Other);
        assert_eq!(
            Category::from_label("Appointment Request"),
            Category::AppointmentRequest
        );
    }

    #[test]
    fn category_serializes_to_label() {
        let json = serde_json::to_value(Category::AppointmentRequest).unwrap();
        assert_eq!(json, "Appointment Request");
    }

    #[test]
    fn judgment_new_clamps_confidence() {
        assert_eq!(Judgment::new(Category::Other, 1.5, "").confidence, 1.0);
        assert_eq!(Judgment::new(Category::Other, -0.2, "").confidence, 0.0);
        assert_eq!(Judgment::new(Category::Other, 0.42, "").confidence, 0.42);
    }

    #[test]
    fn fallback_judgment_is_conservative() {
        let j = Judgment::fallback();
        assert_eq!(j.category, Category::Other);
        assert_eq!(j.confidence, 0.0);
        assert_eq!(j.reply, FALLBACK_REPLY);
    }

    #[test]
    fn parse_result_exposes_path() {
        let valid = ParseResult::Valid(Judgment::new(Category::PriceRequest, 0.9, "x"));
        let fallback = ParseResult::Fallback(Judgment::fallback());
        assert!(!valid.is_fallback());
        assert!(fallback.is_fallback());
        assert_eq!(valid.judgment().category, Category::PriceRequest);
        assert_eq!(fallback.into_judgment(), Judgment::fallback());
    }

    #[test]
    fn log_action_labels_round_trip() {
        for action in LogAction::ALL {
            assert_eq!(action.as_str().parse::<LogAction>().unwrap(), action);
        }
        assert_eq!(
            serde_json::to_value(LogAction::ErrorSending).unwrap(),
            "error_sending"
        );
        assert!("sent".parse::<LogAction>().is_err());
    }

    #[test]
    fn batch_outcome_handled_covers_every_bucket() {
        let outcome = BatchOutcome {
            sent: vec![InboundMessage::new("a", "x@y.com", "s", "b")],
            queued: vec![QueuedMessage {
                message: InboundMessage::new("b", "x@y.com", "s", "b"),
                judgment: Judgment::fallback(),
            }],
            send_failures: vec![InboundMessage::new("c", "x@y.com", "s", "b")],
            already_seen: vec![InboundMessage::new("d", "x@y.com", "s", "b")],
            ..Default::default()
        };
        let ids: Vec<&str> = outcome.handled().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(outcome.processed(), 3);
    }
}
