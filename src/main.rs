use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inboxiq::config::{CredentialStore, Settings, load_knowledge_base};
use inboxiq::pipeline::{TriageHandle, build_processor, spawn_inbox_worker};
use inboxiq::store::{LibSqlBackend, TriageLog};
use inboxiq::web::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let mut settings = Settings::from_env().context("invalid configuration")?;

    // Stderr always; a daily-rolling file too when INBOXIQ_LOG_DIR is set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inboxiq.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    settings.triage.knowledge_base = load_knowledge_base(&settings.knowledge_base_path);

    eprintln!("📬 InboxIQ v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", settings.triage.model);
    eprintln!(
        "   Auto-send threshold: {:.2}",
        settings.triage.confidence_threshold
    );
    eprintln!("   API: http://0.0.0.0:{}/api", settings.http_port);
    match settings.poll_interval {
        Some(interval) => eprintln!("   Polling every {}s\n", interval.as_secs()),
        None => eprintln!("   Polling disabled; use POST /api/triage/run\n"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let log: Arc<dyn TriageLog> = Arc::new(
        LibSqlBackend::new_local(&settings.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", settings.db_path.display()))?,
    );

    // ── Processor ────────────────────────────────────────────────────────
    let credentials = Arc::new(CredentialStore::new(&settings.credentials_path));
    let handle = Arc::new(TriageHandle::new());

    match credentials.load() {
        Ok(creds) if creds.is_complete() => {
            let processor = build_processor(&settings, &creds, Arc::clone(&log))
                .context("failed to build triage processor")?;
            handle.replace(processor).await;
        }
        Ok(_) => tracing::warn!("Credentials incomplete; waiting for POST /api/setup"),
        Err(e) => tracing::warn!(error = %e, "Could not read credentials; waiting for setup"),
    }

    let worker = settings
        .poll_interval
        .map(|interval| spawn_inbox_worker(Arc::clone(&handle), interval));

    // Room for one message to finish: a model call, a send, and mailbox I/O.
    let drain_timeout =
        settings.triage.llm_timeout + settings.triage.send_timeout + Duration::from_secs(30);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let port = settings.http_port;
    let app = router(AppState {
        handle: Arc::clone(&handle),
        log,
        credentials,
        settings: Arc::new(settings),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!(port, "HTTP server started");

    let shutdown_handle = Arc::clone(&handle);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
            shutdown_handle.cancel();
        })
        .await
        .context("HTTP server error")?;

    if let Some(worker) = worker {
        handle.cancel();
        match tokio::time::timeout(drain_timeout, worker.shutdown()).await {
            Ok(Ok(())) => tracing::info!("Inbox worker stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Inbox worker task failed"),
            Err(_) => tracing::warn!(
                timeout_secs = drain_timeout.as_secs(),
                "Inbox worker did not finish in time"
            ),
        }
    }

    Ok(())
}
