//! Configuration types.
//!
//! Everything is read once at startup and passed down explicitly. A
//! credentials change builds a fresh `TriageProcessor` instead of mutating
//! shared state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::pipeline::types::Category;

/// Default confidence needed for an auto-send.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.80;

/// Default chat model for judgments.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Categories eligible for auto-send unless overridden.
pub const DEFAULT_AUTO_CATEGORIES: [Category; 3] = [
    Category::PriceRequest,
    Category::RepairInquiry,
    Category::AppointmentRequest,
];

// ── Triage policy ───────────────────────────────────────────────────

/// Policy and model settings threaded into the processor.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Categories that may be answered without human review.
    pub auto_categories: HashSet<Category>,
    /// Minimum confidence (inclusive) for an auto-send.
    pub confidence_threshold: f32,
    /// Model identifier passed to the provider.
    pub model: String,
    /// Business name used in the assistant persona.
    pub business_name: String,
    /// Free-form reference text injected into the judgment prompt.
    pub knowledge_base: String,
    /// Upper bound on one model call.
    pub llm_timeout: Duration,
    /// Upper bound on one outbound send.
    pub send_timeout: Duration,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            auto_categories: DEFAULT_AUTO_CATEGORIES.into_iter().collect(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            model: DEFAULT_MODEL.to_string(),
            business_name: "TechFix IT Repairs".to_string(),
            knowledge_base: String::new(),
            llm_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl TriageConfig {
    pub fn with_knowledge_base(mut self, knowledge_base: impl Into<String>) -> Self {
        self.knowledge_base = knowledge_base.into();
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_auto_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.auto_categories = categories.into_iter().collect();
        self
    }

    /// Reject thresholds outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "INBOXIQ_CONFIDENCE_THRESHOLD".into(),
                message: format!("{} is outside [0, 1]", self.confidence_threshold),
            });
        }
        Ok(())
    }
}

// ── Mail servers ────────────────────────────────────────────────────

/// IMAP/SMTP endpoints. Credentials live in `Credentials`.
#[derive(Debug, Clone)]
pub struct MailServerConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
}

impl Default for MailServerConfig {
    fn default() -> Self {
        Self {
            imap_host: "imap.gmail.com".to_string(),
            imap_port: 993,
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
        }
    }
}

// ── Process settings ────────────────────────────────────────────────

/// Process-level settings built from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub credentials_path: PathBuf,
    pub knowledge_base_path: PathBuf,
    /// Background poll interval. `None` disables the poller.
    pub poll_interval: Option<Duration>,
    /// Directory for rolling log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    pub openai_base_url: Option<String>,
    pub mail: MailServerConfig,
    pub triage: TriageConfig,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut triage = TriageConfig::default();
        if let Some(model) = var("INBOXIQ_MODEL") {
            triage.model = model;
        }
        if let Some(name) = var("INBOXIQ_BUSINESS_NAME") {
            triage.business_name = name;
        }
        if let Some(raw) = var("INBOXIQ_AUTO_CATEGORIES") {
            triage.auto_categories = parse_categories(&raw)?;
        }
        if let Some(threshold) = parse_var::<f32>(&var, "INBOXIQ_CONFIDENCE_THRESHOLD")? {
            triage.confidence_threshold = threshold;
        }
        if let Some(secs) = parse_var::<u64>(&var, "INBOXIQ_LLM_TIMEOUT_SECS")? {
            triage.llm_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&var, "INBOXIQ_SEND_TIMEOUT_SECS")? {
            triage.send_timeout = Duration::from_secs(secs);
        }
        triage.validate()?;

        let defaults = MailServerConfig::default();
        let imap_host = var("EMAIL_IMAP_HOST").unwrap_or(defaults.imap_host);
        let smtp_host = var("EMAIL_SMTP_HOST").unwrap_or(defaults.smtp_host);
        let mail = MailServerConfig {
            imap_host,
            imap_port: parse_var(&var, "EMAIL_IMAP_PORT")?.unwrap_or(defaults.imap_port),
            smtp_host,
            smtp_port: parse_var(&var, "EMAIL_SMTP_PORT")?.unwrap_or(defaults.smtp_port),
        };

        let poll_interval = match parse_var::<u64>(&var, "INBOXIQ_POLL_INTERVAL_SECS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "INBOXIQ_POLL_INTERVAL_SECS".into(),
                    message: "must be greater than zero".into(),
                });
            }
            other => other.map(Duration::from_secs),
        };

        Ok(Self {
            db_path: var("INBOXIQ_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/inboxiq.db")),
            http_port: parse_var(&var, "INBOXIQ_HTTP_PORT")?.unwrap_or(5000),
            credentials_path: var("INBOXIQ_CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./config.json")),
            knowledge_base_path: var("INBOXIQ_KNOWLEDGE_BASE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./knowledge_base.txt")),
            poll_interval,
            log_dir: var("INBOXIQ_LOG_DIR").map(PathBuf::from),
            openai_base_url: var("OPENAI_BASE_URL"),
            mail,
            triage,
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}

/// Parse a comma-separated category list against the closed set.
fn parse_categories(raw: &str) -> Result<HashSet<Category>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Category>().map_err(|message| ConfigError::InvalidValue {
                key: "INBOXIQ_AUTO_CATEGORIES".into(),
                message,
            })
        })
        .collect()
}

/// Read the knowledge base text. A missing file yields an empty string.
pub fn load_knowledge_base(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            info!(path = %path.display(), bytes = text.len(), "Knowledge base loaded");
            text
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Knowledge base unavailable, continuing without it");
            String::new()
        }
    }
}

// ── Credentials ─────────────────────────────────────────────────────

/// Secrets needed for any network operation.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub openai_api_key: SecretString,
    pub email_address: String,
    pub email_password: SecretString,
}

impl Credentials {
    pub fn new(
        openai_api_key: impl Into<String>,
        email_address: impl Into<String>,
        email_password: impl Into<String>,
    ) -> Self {
        Self {
            openai_api_key: SecretString::from(openai_api_key.into()),
            email_address: email_address.into(),
            email_password: SecretString::from(email_password.into()),
        }
    }

    /// Fail with the first missing credential.
    pub fn require(&self) -> Result<(), ConfigError> {
        let checks = [
            ("OPENAI_API_KEY", self.openai_api_key.expose_secret().is_empty()),
            ("EMAIL_ADDRESS", self.email_address.is_empty()),
            ("EMAIL_PASSWORD", self.email_password.expose_secret().is_empty()),
        ];
        match checks.into_iter().find(|(_, missing)| *missing) {
            Some((key, _)) => Err(ConfigError::MissingRequired {
                key: key.to_string(),
                hint: "Complete the setup step before processing email.".to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.require().is_ok()
    }
}

/// On-disk layout of the credentials file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "OPENAI_API_KEY", default)]
    openai_api_key: String,
    #[serde(rename = "EMAIL_ADDRESS", default)]
    email_address: String,
    #[serde(rename = "EMAIL_PASSWORD", default)]
    email_password: String,
}

/// JSON-file credential storage with environment overrides.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load credentials; process environment variables win over the file.
    pub fn load(&self) -> Result<Credentials, ConfigError> {
        self.load_with(|key| std::env::var(key).ok())
    }

    /// Load credentials with a custom override lookup.
    pub fn load_with<F>(&self, lookup: F) -> Result<Credentials, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = self.read_file()?;
        let pick = |key: &str, stored: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(stored)
        };
        Ok(Credentials::new(
            pick("OPENAI_API_KEY", file.openai_api_key),
            pick("EMAIL_ADDRESS", file.email_address),
            pick("EMAIL_PASSWORD", file.email_password),
        ))
    }

    /// Persist all three credentials, replacing the file.
    pub fn save(
        &self,
        openai_api_key: &str,
        email_address: &str,
        email_password: &str,
    ) -> Result<(), ConfigError> {
        let file = CredentialsFile {
            openai_api_key: openai_api_key.to_string(),
            email_address: email_address.to_string(),
            email_password: email_password.to_string(),
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        info!(path = %self.path.display(), "Credentials saved");
        Ok(())
    }

    /// True when every credential resolves to a non-empty value.
    pub fn is_configured(&self) -> bool {
        self.load().map(|c| c.is_complete()).unwrap_or(false)
    }

    fn read_file(&self) -> Result<CredentialsFile, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                ConfigError::ParseError(format!("{}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialsFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}
