//! Reminder sweep.
//!
//! A periodic task reads due, unsent reminders and delivers them. Delivery
//! and bookkeeping are decoupled from wall-clock time: `run_sweep` takes
//! `now` as a parameter, and the production loop feeds it the real clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{Notifier, OutgoingMessage};
use crate::config::ReminderConfig;
use crate::content;
use crate::error::Result;
use crate::store::Store;

/// Outcome counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Records the due query returned.
    pub due: usize,
    /// Delivered and marked sent.
    pub sent: usize,
    /// Send failed or timed out; the record stays unsent for the next sweep.
    pub failed: usize,
    /// Sent, but the mark-sent CAS found the record already marked.
    pub skipped: usize,
}

/// Delivers due reminders through a [`Notifier`].
pub struct ReminderScheduler {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    config: ReminderConfig,
}

impl ReminderScheduler {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, config: ReminderConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Run one sweep of everything due at `now`.
    ///
    /// Per-record failures are counted, logged and skipped; only a failure
    /// of the due query itself aborts the sweep.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let due = self.store.list_due_reminders(now).await?;
        let mut stats = SweepStats {
            due: due.len(),
            ..Default::default()
        };

        for (i, reminder) in due.iter().enumerate() {
            // Transport flood limit.
            if i > 0 {
                tokio::time::sleep(self.config.pacing_delay).await;
            }

            let message =
                OutgoingMessage::new(content::reminder_text(reminder.kind, &reminder.display_name));
            let send = self.notifier.send(&reminder.subject_id, &message);
            match tokio::time::timeout(self.config.send_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        subject_id = %reminder.subject_id,
                        kind = %reminder.kind,
                        error = %e,
                        "Reminder send failed, will retry next sweep"
                    );
                    stats.failed += 1;
                    continue;
                }
                Err(_) => {
                    warn!(
                        subject_id = %reminder.subject_id,
                        kind = %reminder.kind,
                        timeout = ?self.config.send_timeout,
                        "Reminder send timed out, will retry next sweep"
                    );
                    stats.failed += 1;
                    continue;
                }
            }

            match self.store.mark_reminder_sent(reminder.id, now).await {
                Ok(true) => {
                    debug!(
                        subject_id = %reminder.subject_id,
                        kind = %reminder.kind,
                        "Reminder delivered"
                    );
                    stats.sent += 1;
                }
                Ok(false) => {
                    // Another instance marked it between our query and CAS.
                    warn!(
                        subject_id = %reminder.subject_id,
                        kind = %reminder.kind,
                        "Reminder already marked sent by another instance"
                    );
                    stats.skipped += 1;
                }
                Err(e) => {
                    // Delivered but not recorded: the next sweep may resend.
                    error!(
                        subject_id = %reminder.subject_id,
                        kind = %reminder.kind,
                        error = %e,
                        "Failed to mark reminder sent after delivery"
                    );
                    stats.failed += 1;
                }
            }
        }

        if stats.due > 0 {
            info!(
                due = stats.due,
                sent = stats.sent,
                failed = stats.failed,
                skipped = stats.skipped,
                "Reminder sweep finished"
            );
        }
        Ok(stats)
    }
}

/// Spawn the periodic sweep loop. The first tick fires immediately so
/// reminders that came due while the process was down go out on startup.
/// Abort the returned handle to stop the loop.
pub fn spawn_sweep_task(scheduler: Arc<ReminderScheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = scheduler.run_sweep(Utc::now()).await {
                error!(error = %e, "Reminder sweep failed");
            }
        }
    })
}
