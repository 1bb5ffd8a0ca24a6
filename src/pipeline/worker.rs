//! Background inbox poller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::pipeline::handle::TriageHandle;

/// A running poller. Dropping it detaches the task.
pub struct InboxWorker {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl InboxWorker {
    /// Stop polling and wait for the task to exit.
    ///
    /// A poll in progress is never interrupted here; pair this with
    /// `TriageHandle::cancel` so its batch stops after the current message,
    /// which is still sent and logged.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.task.await
    }
}

/// Spawn a task that runs `poll_inbox` on the current processor every
/// `interval`. Ticks are skipped while no processor is configured.
pub fn spawn_inbox_worker(handle: Arc<TriageHandle>, interval: Duration) -> InboxWorker {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let (shutdown_flag, wake_signal) = (Arc::clone(&shutdown), Arc::clone(&wake));

    let task = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Inbox worker started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Only the idle wait is raced against shutdown.
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake_signal.notified() => {}
            }

            if shutdown_flag.load(Ordering::SeqCst) {
                info!("Inbox worker shutting down");
                return;
            }

            let Some(processor) = handle.get().await else {
                debug!("Not configured yet, skipping poll");
                continue;
            };

            match processor.poll_inbox().await {
                Ok(outcome) if outcome.processed() > 0 => info!(
                    sent = outcome.sent.len(),
                    queued = outcome.queued.len(),
                    send_failures = outcome.send_failures.len(),
                    cancelled = outcome.cancelled,
                    "Inbox poll complete"
                ),
                Ok(_) => debug!("Inbox poll found nothing new"),
                Err(e) => error!(error = %e, "Inbox poll failed"),
            }
        }
    });

    InboxWorker {
        task,
        shutdown,
        wake,
    }
}
