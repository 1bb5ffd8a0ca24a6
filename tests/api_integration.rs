//! Integration tests for the triage HTTP API.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory log, a stub model and a stub mailbox, then drives the real
//! REST contract with reqwest.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use inboxiq::config::{CredentialStore, Settings};
use inboxiq::error::{ChannelError, LlmError};
use inboxiq::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use inboxiq::pipeline::{InboundMessage, Mailbox, TriageHandle, TriageProcessor};
use inboxiq::store::{LibSqlBackend, TriageLog};
use inboxiq::web::{AppState, router};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Answers with a confident price quote when the email mentions a price,
/// otherwise with a low-confidence repair inquiry.
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.to_lowercase())
            .unwrap_or_default();
        let content = if prompt.contains("price") {
            r#"{"category": "Price Request", "confidence": 0.95, "reply": "Screen repairs start at $89."}"#
        } else {
            r#"{"category": "Repair Inquiry", "confidence": 0.5, "reply": "Could you describe the fault?"}"#
        };
        Ok(CompletionResponse {
            content: content.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[derive(Default)]
struct StubMailbox {
    inbox: Mutex<Vec<InboundMessage>>,
    sent: Mutex<Vec<(String, String, String)>>,
}

impl StubMailbox {
    fn deliver(&self, message: InboundMessage) {
        self.inbox.lock().unwrap().push(message);
    }

    fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailbox for StubMailbox {
    fn name(&self) -> &str {
        "stub"
    }

    async fn fetch_unread(&self) -> Result<Vec<InboundMessage>, ChannelError> {
        Ok(self.inbox.lock().unwrap().clone())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }

    async fn mark_read(&self, messages: &[InboundMessage]) -> Result<(), ChannelError> {
        self.inbox
            .lock()
            .unwrap()
            .retain(|m| !messages.iter().any(|read| read.id == m.id));
        Ok(())
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    mailbox: Arc<StubMailbox>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }
}

/// Start an Axum server on a random port. When `configured`, a processor
/// wired to the stubs is installed up front.
async fn start_server(configured: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::from_lookup(|_| None).unwrap();
    settings.credentials_path = dir.path().join("credentials.json");

    let log: Arc<dyn TriageLog> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mailbox = Arc::new(StubMailbox::default());
    let handle = Arc::new(TriageHandle::new());

    if configured {
        let processor = TriageProcessor::new(
            Arc::new(StubLlm),
            Arc::clone(&mailbox) as Arc<dyn Mailbox>,
            Arc::clone(&log),
            settings.triage.clone(),
        );
        handle.replace(processor).await;
    }

    let app = router(AppState {
        handle,
        log,
        credentials: Arc::new(CredentialStore::new(&settings.credentials_path)),
        settings: Arc::new(settings),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        mailbox,
        _dir: dir,
    }
}

fn seed_inbox(server: &TestServer) {
    server.mailbox.deliver(InboundMessage::new(
        "<price-1@example.com>",
        "Alice Smith <alice@example.com>",
        "Screen price",
        "What is the price to replace an iPhone 13 screen?",
    ));
    server.mailbox.deliver(InboundMessage::new(
        "<repair-1@example.com>",
        "bob@example.com",
        "Laptop noise",
        "My laptop makes a grinding noise when it boots.",
    ));
}

// ── Health & setup gating ────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "inboxiq");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unconfigured_server_requires_setup() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;

        let (status, body) = server.post("/api/triage/run", json!({})).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["setup_required"], true);

        let (status, body) = server
            .post("/api/send-email", json!({ "email_id": "<x@example.com>" }))
            .await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["setup_required"], true);

        let (status, body) = server.get("/api/setup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["configured"], false);

        // Read-only views work without credentials.
        let (status, body) = server.get("/api/review").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
    })
    .await
    .expect("test timed out");
}

// ── Triage & review ──────────────────────────────────────────────────

#[tokio::test]
async fn triage_run_sends_confident_and_queues_the_rest() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        seed_inbox(&server);

        let (status, body) = server.post("/api/triage/run", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sent"].as_array().unwrap().len(), 1);
        assert_eq!(body["sent"][0]["id"], "<price-1@example.com>");
        assert_eq!(body["queued"].as_array().unwrap().len(), 1);
        assert_eq!(body["queued"][0]["category"], "Repair Inquiry");
        assert_eq!(body["cancelled"], false);

        let sent = server.mailbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "alice@example.com");
        assert_eq!(sent[0].1, "Re: Screen price");

        // Handled messages were marked read, so a second run is empty.
        let (status, body) = server.post("/api/triage/run", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["sent"].as_array().unwrap().is_empty());
        assert!(body["queued"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn review_then_manual_send_exactly_once() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        seed_inbox(&server);
        server.post("/api/triage/run", json!({})).await;

        let (status, body) = server.get("/api/review").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        let entry = &body["entries"][0];
        assert_eq!(entry["message_id"], "<repair-1@example.com>");
        assert_eq!(entry["action"], "skipped");
        assert_eq!(entry["reply_text"], "Could you describe the fault?");

        let request = json!({ "email_id": "<repair-1@example.com>" });
        let (status, body) = server.post("/api/send-email", request.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Email sent successfully");
        assert_eq!(body["entry"]["action"], "manual-sent");

        let (status, _) = server.post("/api/send-email", request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let sent = server.mailbox.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, "bob@example.com");

        let (_, body) = server.get("/api/review").await;
        assert_eq!(body["count"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn send_unknown_email_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        let (status, body) = server
            .post("/api/send-email", json!({ "email_id": "<missing@example.com>" }))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Email not found");
        assert!(server.mailbox.sent().is_empty());
    })
    .await
    .expect("test timed out");
}

// ── Logs & dashboard ─────────────────────────────────────────────────

#[tokio::test]
async fn logs_filter_by_action() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        seed_inbox(&server);
        server.post("/api/triage/run", json!({})).await;

        let (status, body) = server.get("/api/logs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);

        let (_, body) = server.get("/api/logs?action=auto-sent").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["message_id"], "<price-1@example.com>");

        let (_, body) = server.get("/api/logs?action=skipped&since=2000-01-01").await;
        assert_eq!(body["count"], 1);

        let (_, body) = server.get("/api/logs?until=2000-01-01").await;
        assert_eq!(body["count"], 0);

        let (status, _) = server.get("/api/logs?action=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server.get("/api/logs?since=last-week").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dashboard_summarises_the_log() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(true).await;
        seed_inbox(&server);
        server.post("/api/triage/run", json!({})).await;

        let (status, body) = server.get("/api/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["today"], 2);
        assert_eq!(body["auto_sent"], 1);
        assert_eq!(body["skipped"], 1);
        assert_eq!(body["automation_rate"], 50.0);
        assert_eq!(body["recent"].as_array().unwrap().len(), 2);
    })
    .await
    .expect("test timed out");
}

// ── Setup ────────────────────────────────────────────────────────────

#[tokio::test]
async fn setup_rejects_missing_fields() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;
        let (status, body) = server
            .post(
                "/api/setup",
                json!({ "openai_key": "sk-test", "email_address": "  ", "email_password": "pw" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (_, body) = server.get("/api/setup").await;
        assert_eq!(body["configured"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn setup_installs_a_processor() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(false).await;
        let (status, body) = server
            .post(
                "/api/setup",
                json!({
                    "openai_key": " sk-test ",
                    "email_address": "shop@example.com",
                    "email_password": "app-password",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["configured"], true);

        let (_, body) = server.get("/api/setup").await;
        assert_eq!(body["configured"], true);
    })
    .await
    .expect("test timed out");
}
