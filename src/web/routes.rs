//! JSON API over the triage processor and the audit log.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::{CredentialStore, Settings};
use crate::error::PipelineError;
use crate::pipeline::handle::{TriageHandle, build_processor};
use crate::pipeline::processor::ManualSend;
use crate::pipeline::types::{BatchOutcome, InboundMessage, LogAction};
use crate::store::traits::{DEFAULT_LOG_LIMIT, DEFAULT_REVIEW_LIMIT, LogQuery, TriageLog};

/// Upper bound on `limit` for log listings.
const MAX_LOG_LIMIT: usize = 1000;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub handle: Arc<TriageHandle>,
    pub log: Arc<dyn TriageLog>,
    pub credentials: Arc<CredentialStore>,
    pub settings: Arc<Settings>,
}

type ApiResponse = (StatusCode, Json<Value>);

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/triage/run", post(run_triage))
        .route("/api/review", get(review_queue))
        .route("/api/send-email", post(send_email))
        .route("/api/logs", get(list_logs))
        .route("/api/dashboard", get(dashboard))
        .route("/api/setup", get(setup_status).post(save_setup))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

fn setup_required() -> ApiResponse {
    (
        StatusCode::PRECONDITION_FAILED,
        Json(json!({
            "error": "Credentials are not configured",
            "setup_required": true,
        })),
    )
}

fn pipeline_error_response(e: &PipelineError) -> ApiResponse {
    let status = match e {
        PipelineError::Fetch(_) | PipelineError::Llm(_) | PipelineError::ManualSend { .. } => {
            StatusCode::BAD_GATEWAY
        }
        PipelineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "inboxiq",
    }))
}

// ── Triage ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MessageSummary<'a> {
    id: &'a str,
    sender: &'a str,
    subject: &'a str,
}

impl<'a> From<&'a InboundMessage> for MessageSummary<'a> {
    fn from(m: &'a InboundMessage) -> Self {
        Self {
            id: &m.id,
            sender: &m.sender,
            subject: &m.subject,
        }
    }
}

fn summaries(messages: &[InboundMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!(MessageSummary::from(m)))
        .collect()
}

fn outcome_json(outcome: &BatchOutcome) -> Value {
    let queued: Vec<Value> = outcome
        .queued
        .iter()
        .map(|q| {
            json!({
                "id": q.message.id,
                "sender": q.message.sender,
                "subject": q.message.subject,
                "category": q.judgment.category,
                "confidence": q.judgment.confidence,
                "reply": q.judgment.reply,
            })
        })
        .collect();

    json!({
        "sent": summaries(&outcome.sent),
        "queued": queued,
        "send_failures": summaries(&outcome.send_failures),
        "already_seen": outcome.already_seen.len(),
        "fallback_judgments": outcome.fallback_judgments,
        "cancelled": outcome.cancelled,
    })
}

/// POST /api/triage/run
async fn run_triage(State(state): State<AppState>) -> ApiResponse {
    let Some(processor) = state.handle.get().await else {
        return setup_required();
    };
    match processor.poll_inbox().await {
        Ok(outcome) => (StatusCode::OK, Json(outcome_json(&outcome))),
        Err(e) => {
            error!(error = %e, "On-demand triage run failed");
            pipeline_error_response(&e)
        }
    }
}

/// GET /api/review
async fn review_queue(State(state): State<AppState>) -> ApiResponse {
    match state.log.review_queue(DEFAULT_REVIEW_LIMIT).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(json!({ "count": entries.len(), "entries": entries })),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct SendEmailRequest {
    email_id: String,
}

/// POST /api/send-email
async fn send_email(
    State(state): State<AppState>,
    Json(request): Json<SendEmailRequest>,
) -> ApiResponse {
    let Some(processor) = state.handle.get().await else {
        return setup_required();
    };
    match processor.mark_sent(&request.email_id).await {
        Ok(ManualSend::Sent(entry)) => (
            StatusCode::OK,
            Json(json!({ "message": "Email sent successfully", "entry": entry })),
        ),
        Ok(ManualSend::NotFound) => error_response(StatusCode::NOT_FOUND, "Email not found"),
        Ok(ManualSend::AlreadyHandled(action)) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Email is not awaiting review",
                "action": action,
            })),
        ),
        Err(e) => {
            warn!(email_id = %request.email_id, error = %e, "Manual send failed");
            pipeline_error_response(&e)
        }
    }
}

// ── Logs & dashboard ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct LogsParams {
    action: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<usize>,
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD`. A bare `until` date covers the whole day.
fn parse_bound(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)?
    } else {
        NaiveTime::MIN
    };
    Some(date.and_time(time).and_utc())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn build_log_query(params: &LogsParams) -> Result<LogQuery, String> {
    let action = non_empty(&params.action)
        .map(|a| a.parse::<LogAction>())
        .transpose()?;
    let since = non_empty(&params.since)
        .map(|s| parse_bound(&s, false).ok_or_else(|| format!("invalid 'since' value '{s}'")))
        .transpose()?;
    let until = non_empty(&params.until)
        .map(|s| parse_bound(&s, true).ok_or_else(|| format!("invalid 'until' value '{s}'")))
        .transpose()?;

    Ok(LogQuery {
        action,
        since,
        until,
        limit: params.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT),
    })
}

/// GET /api/logs
async fn list_logs(State(state): State<AppState>, Query(params): Query<LogsParams>) -> ApiResponse {
    let query = match build_log_query(&params) {
        Ok(q) => q,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    match state.log.query_entries(&query).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(json!({ "count": entries.len(), "entries": entries })),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /api/dashboard
async fn dashboard(State(state): State<AppState>) -> ApiResponse {
    match state.log.stats(Utc::now()).await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── Setup ───────────────────────────────────────────────────────────

/// GET /api/setup
async fn setup_status(State(state): State<AppState>) -> ApiResponse {
    let email_address = state
        .credentials
        .load()
        .map(|c| c.email_address)
        .unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({
            "configured": state.handle.get().await.is_some(),
            "email_address": email_address,
        })),
    )
}

#[derive(Debug, Default, Deserialize)]
struct SetupRequest {
    #[serde(default)]
    openai_key: String,
    #[serde(default)]
    email_address: String,
    #[serde(default)]
    email_password: String,
}

/// POST /api/setup
async fn save_setup(State(state): State<AppState>, Json(request): Json<SetupRequest>) -> ApiResponse {
    let openai_key = request.openai_key.trim();
    let email_address = request.email_address.trim();
    let email_password = request.email_password.trim();
    if openai_key.is_empty() || email_address.is_empty() || email_password.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "All fields are required");
    }

    if let Err(e) = state
        .credentials
        .save(openai_key, email_address, email_password)
    {
        error!(error = %e, "Failed to save credentials");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let credentials = match state.credentials.load() {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    match build_processor(&state.settings, &credentials, Arc::clone(&state.log)) {
        Ok(processor) => {
            state.handle.replace(processor).await;
            info!(email = %credentials.email_address, "Setup saved, processor rebuilt");
            (StatusCode::OK, Json(json!({ "configured": true })))
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
