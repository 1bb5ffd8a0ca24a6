//! In-memory model and mailbox doubles shared by the pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ChannelError, LlmError};
use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::pipeline::types::{InboundMessage, Mailbox};

/// Returns a canned response keyed by a substring of the user prompt.
pub(crate) struct MockLlm {
    pub responses: HashMap<String, String>,
    pub fail_on: Option<String>,
    pub delay: Option<Duration>,
    /// Raised as soon as the first call starts.
    pub raise_on_call: Option<Arc<AtomicBool>>,
    pub calls: AtomicUsize,
}

impl MockLlm {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            responses: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fail_on: None,
            delay: None,
            raise_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn model_name(&self) -> &str {
        "mock-judge"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(flag) = &self.raise_on_call {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let prompt = &request.messages[1].content;
        if self.fail_on.as_ref().is_some_and(|key| prompt.contains(key)) {
            return Err(LlmError::RequestFailed {
                provider: "mock".into(),
                reason: "boom".into(),
            });
        }
        let content = self
            .responses
            .iter()
            .find(|(key, _)| prompt.contains(key.as_str()))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "not json at all".to_string());
        Ok(CompletionResponse {
            content,
            input_tokens: 100,
            output_tokens: 50,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[derive(Default)]
pub(crate) struct MockMailbox {
    pub inbox: Mutex<Vec<InboundMessage>>,
    pub sent: Mutex<Vec<(String, String, String)>>,
    pub marked: Mutex<Vec<String>>,
    pub fail_sends: AtomicBool,
    pub fail_fetch: bool,
    pub send_delay: Option<Duration>,
    /// Bumped when a send starts, before any delay.
    pub sends_started: AtomicUsize,
}

impl MockMailbox {
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailbox for MockMailbox {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_unread(&self) -> Result<Vec<InboundMessage>, ChannelError> {
        if self.fail_fetch {
            return Err(ChannelError::Disconnected {
                name: "mock".into(),
                reason: "offline".into(),
            });
        }
        Ok(self.inbox.lock().unwrap().clone())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        self.sends_started.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                name: "mock".into(),
                reason: "smtp down".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }

    async fn mark_read(&self, messages: &[InboundMessage]) -> Result<(), ChannelError> {
        self.marked
            .lock()
            .unwrap()
            .extend(messages.iter().map(|m| m.id.clone()));
        Ok(())
    }
}
