//! Triage processor: judgment → policy → side effect → one log entry.
//!
//! Messages are handled strictly one at a time in input order. The model
//! call and the send are the only suspension points, each bounded by a
//! timeout. The ledger entry is written once, after the side effect has
//! completed, so a crash mid-batch only leaves unprocessed messages behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channels::address::{EmailAddress, reply_subject};
use crate::config::TriageConfig;
use crate::error::{ChannelError, LlmError, PipelineError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::judgment::parse_judgment;
use crate::pipeline::policy::decide;
use crate::pipeline::types::{
    BatchOutcome, Category, DecisionKind, InboundMessage, LogAction, Mailbox, ParseResult,
    QueuedMessage,
};
use crate::store::traits::{LogEntry, TriageLog};

/// Max tokens for the judgment call.
const JUDGE_MAX_TOKENS: u32 = 500;

const JUDGE_TEMPERATURE: f32 = 0.0;

/// Result of a manual send request.
#[derive(Debug)]
pub enum ManualSend {
    /// Reply sent; carries the entry as it now stands.
    Sent(LogEntry),
    NotFound,
    /// The entry exists but is no longer awaiting review.
    AlreadyHandled(LogAction),
}

/// Serialization points for everything that writes to one log.
///
/// Processors that replace each other on a `TriageHandle` share one
/// instance, so a batch on a retired processor still excludes a batch on
/// its successor.
#[derive(Debug, Default)]
pub struct TriageLocks {
    /// Held for a whole batch; batches never interleave.
    batch: Mutex<()>,
    manual_send: Mutex<()>,
}

pub struct TriageProcessor {
    llm: Arc<dyn LlmProvider>,
    mailbox: Arc<dyn Mailbox>,
    log: Arc<dyn TriageLog>,
    config: TriageConfig,
    cancel: Arc<AtomicBool>,
    locks: Arc<TriageLocks>,
}

impl TriageProcessor {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        mailbox: Arc<dyn Mailbox>,
        log: Arc<dyn TriageLog>,
        config: TriageConfig,
    ) -> Self {
        Self {
            llm,
            mailbox,
            log,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            locks: Arc::new(TriageLocks::default()),
        }
    }

    /// Share a cancellation flag, checked between messages.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share batch and manual-send locks with other processors on the same log.
    pub fn with_locks(mut self, locks: Arc<TriageLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    /// Fetch unread mail, process it, then flag handled messages as read.
    pub async fn poll_inbox(&self) -> Result<BatchOutcome, PipelineError> {
        let messages = self
            .mailbox
            .fetch_unread()
            .await
            .map_err(PipelineError::Fetch)?;
        if messages.is_empty() {
            debug!(mailbox = self.mailbox.name(), "No unread messages");
            return Ok(BatchOutcome::default());
        }

        let outcome = self.process_batch(messages).await?;

        let handled: Vec<InboundMessage> = outcome.handled().cloned().collect();
        if !handled.is_empty()
            && let Err(e) = self.mailbox.mark_read(&handled).await
        {
            warn!(error = %e, count = handled.len(), "Failed to flag handled messages as read");
        }
        Ok(outcome)
    }

    /// Process messages in order, writing exactly one entry per new message.
    ///
    /// A model failure stops the batch: the failing message gets no entry
    /// and is picked up again on the next run.
    pub async fn process_batch(
        &self,
        messages: Vec<InboundMessage>,
    ) -> Result<BatchOutcome, PipelineError> {
        let _batch = self.locks.batch.lock().await;
        let total = messages.len();
        info!(count = total, "Processing message batch");

        let mut outcome = BatchOutcome::default();
        for message in messages {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Batch cancelled, leaving remaining messages for the next run");
                outcome.cancelled = true;
                break;
            }

            if self.log.has_seen(&message.id).await? {
                debug!(id = %message.id, "Already handled, skipping");
                outcome.already_seen.push(message);
                continue;
            }

            let parsed = self.judge(&message).await?;
            let parse_fallback = parsed.is_fallback();
            if parse_fallback {
                outcome.fallback_judgments += 1;
            }
            let judgment = parsed.into_judgment();

            let action = match decide(&judgment, &self.config) {
                DecisionKind::AttemptAutoSend => {
                    match self
                        .deliver(&message.sender, &message.subject, &judgment.reply)
                        .await
                    {
                        Ok(()) => LogAction::AutoSent,
                        Err(e) => {
                            warn!(id = %message.id, error = %e, "Auto-send failed");
                            LogAction::ErrorSending
                        }
                    }
                }
                DecisionKind::QueueForReview => LogAction::Skipped,
            };

            let entry = LogEntry::new(&message, &judgment, action, parse_fallback);
            if !self.log.record(&entry).await? {
                warn!(id = %message.id, "Entry appeared concurrently, kept the existing one");
            }
            info!(
                id = %message.id,
                category = judgment.category.as_str(),
                confidence = judgment.confidence,
                action = action.as_str(),
                "Message triaged"
            );

            match action {
                LogAction::AutoSent => outcome.sent.push(message),
                LogAction::ErrorSending => outcome.send_failures.push(message),
                _ => outcome.queued.push(QueuedMessage { message, judgment }),
            }
        }

        info!(
            processed = outcome.processed(),
            sent = outcome.sent.len(),
            queued = outcome.queued.len(),
            send_failures = outcome.send_failures.len(),
            already_seen = outcome.already_seen.len(),
            total,
            "Batch complete"
        );
        Ok(outcome)
    }

    /// Send the stored suggestion for a `skipped` entry and mark it `manual-sent`.
    ///
    /// Serialized per processor so a repeated request cannot send twice.
    /// A send failure leaves the entry untouched.
    pub async fn mark_sent(&self, message_id: &str) -> Result<ManualSend, PipelineError> {
        let _guard = self.locks.manual_send.lock().await;

        let Some(mut entry) = self.log.get_entry(message_id).await? else {
            return Ok(ManualSend::NotFound);
        };
        if entry.action != LogAction::Skipped {
            debug!(id = %message_id, action = entry.action.as_str(), "Manual send refused");
            return Ok(ManualSend::AlreadyHandled(entry.action));
        }

        self.deliver(&entry.sender, &entry.subject, &entry.reply_text)
            .await
            .map_err(|source| PipelineError::ManualSend {
                message_id: message_id.to_string(),
                source,
            })?;

        let moved = self
            .log
            .transition_action(message_id, LogAction::Skipped, LogAction::ManualSent)
            .await?;
        if !moved {
            warn!(id = %message_id, "Entry changed while the manual reply was being sent");
        }
        info!(id = %message_id, "Manual reply sent");

        entry.action = LogAction::ManualSent;
        entry.updated_at = Utc::now();
        Ok(ManualSend::Sent(entry))
    }

    /// Model call plus parsing. Only the call itself can fail.
    async fn judge(&self, message: &InboundMessage) -> Result<ParseResult, PipelineError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(&self.config)),
            ChatMessage::user(build_user_prompt(message)),
        ])
        .with_temperature(JUDGE_TEMPERATURE)
        .with_max_tokens(JUDGE_MAX_TOKENS);

        let timeout = self.config.llm_timeout;
        let response = tokio::time::timeout(timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout,
            })??;

        Ok(parse_judgment(&response.content))
    }

    /// Reply to the sender header with `Re: <subject>`.
    ///
    /// The timeout stops waiting, not the send. A transport that blocks on its
    /// own thread may still deliver a reply that is then logged `error_sending`,
    /// so the transport needs its own bound (`ImapMailbox` sets SMTP socket
    /// timeouts).
    async fn deliver(&self, sender: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let to = EmailAddress::parse(sender)
            .map_err(|e| ChannelError::InvalidMessage(format!("sender '{sender}': {e}")))?;
        let subject = reply_subject(subject);

        let timeout = self.config.send_timeout;
        tokio::time::timeout(timeout, self.mailbox.send(&to.address, &subject, body))
            .await
            .map_err(|_| ChannelError::Timeout {
                name: self.mailbox.name().to_string(),
                timeout,
            })?
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(config: &TriageConfig) -> String {
    let categories = Category::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut prompt = format!(
        "You are a helpful, professional customer support assistant for {name}. \
         Reply to customer emails in a clear, polite and solution-oriented way.\n\n\
         Response style:\n\
         - Acknowledge the customer's issue before suggesting solutions.\n\
         - Offer clear pricing ranges when possible.\n\
         - Suggest next steps such as visiting the shop, booking an appointment or calling.\n\
         - Sign off warmly with the business name.\n\n\
         Possible categories: {categories}.\n\
         Return ONLY valid JSON with keys: category (one of the above), \
         confidence (0.00-1.00), and reply (a suggested reply).",
        name = config.business_name,
    );
    if !config.knowledge_base.trim().is_empty() {
        prompt.push_str("\n\nIf relevant, use the knowledge base below:\n");
        prompt.push_str(config.knowledge_base.trim());
    }
    prompt
}

fn build_user_prompt(message: &InboundMessage) -> String {
    format!(
        "Customer email:\n\nSubject: {}\n\n{}\n\nRespond with JSON only.",
        message.subject, message.body
    )
}
