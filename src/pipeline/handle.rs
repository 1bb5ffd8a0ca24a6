//! Swappable processor handle.
//!
//! The web layer and the worker hold a `TriageHandle`. Saving new
//! credentials builds a fresh `TriageProcessor` and swaps it in; anyone
//! already holding the old `Arc` finishes with it undisturbed. Every
//! installed processor shares the handle's locks and cancellation flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::channels::email::{EmailConfig, ImapMailbox};
use crate::config::{Credentials, Settings};
use crate::error::Error;
use crate::llm::{LlmConfig, create_provider};
use crate::pipeline::processor::{TriageLocks, TriageProcessor};
use crate::store::traits::TriageLog;

pub struct TriageHandle {
    current: RwLock<Option<Arc<TriageProcessor>>>,
    cancel: Arc<AtomicBool>,
    locks: Arc<TriageLocks>,
}

impl Default for TriageHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TriageHandle {
    /// An empty handle; nothing can run until a processor is installed.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
            locks: Arc::new(TriageLocks::default()),
        }
    }

    /// The active processor, if configured.
    pub async fn get(&self) -> Option<Arc<TriageProcessor>> {
        self.current.read().await.clone()
    }

    /// Install a processor, sharing this handle's locks and cancellation flag.
    pub async fn replace(&self, processor: TriageProcessor) {
        let processor = processor
            .with_cancel_flag(Arc::clone(&self.cancel))
            .with_locks(Arc::clone(&self.locks));
        *self.current.write().await = Some(Arc::new(processor));
        info!("Triage processor installed");
    }

    /// Ask any running batch to stop after its current message.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Build a processor wired to the real mailbox and model.
///
/// Fails with `ConfigError::MissingRequired` before touching the network
/// when any credential is blank.
pub fn build_processor(
    settings: &Settings,
    credentials: &Credentials,
    log: Arc<dyn TriageLog>,
) -> Result<TriageProcessor, Error> {
    credentials.require()?;

    let llm = create_provider(&LlmConfig {
        api_key: credentials.openai_api_key.clone(),
        model: settings.triage.model.clone(),
        base_url: settings.openai_base_url.clone(),
        timeout: settings.triage.llm_timeout + Duration::from_secs(5),
    })?;
    let mailbox = ImapMailbox::new(EmailConfig::new(
        &settings.mail,
        credentials,
        settings.triage.send_timeout,
    ));

    Ok(TriageProcessor::new(
        llm,
        Arc::new(mailbox),
        log,
        settings.triage.clone(),
    ))
}
