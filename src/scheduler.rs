//! Expiry scheduler
//!
//! Periodically moves APPROVED records past their `expires_at` to EXPIRED.
//! A sweep keeps going past per-record failures and is idempotent: records
//! already expired, overridden, or renewed are skipped. Due records are
//! paged with an `(expires_at, id)` cursor, so a run of failing records never
//! hides the ones behind it.

use crate::engine::LifecycleEngine;
use crate::error::Result;
use crate::store::ExpiryCursor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::interval;

/// Records fetched per store query during a sweep
const SWEEP_BATCH: usize = 500;

/// Scheduler events for monitoring
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Started,
    Stopped,
    SweepCompleted(SweepReport),
    /// A single record could not be expired; the sweep continued
    RecordFailed {
        verification_id: String,
        error: String,
    },
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Background expiry sweep over the verification store
#[derive(Clone)]
pub struct ExpiryScheduler {
    engine: LifecycleEngine,
    period: Duration,
    batch_size: usize,
    event_tx: broadcast::Sender<SchedulerEvent>,
    running: Arc<RwLock<bool>>,
    shutdown: Arc<Notify>,
}

impl ExpiryScheduler {
    /// Create a scheduler using the engine's configured sweep interval
    pub fn new(engine: LifecycleEngine) -> Self {
        let period = engine.config().sweep_interval();
        Self::with_period(engine, period)
    }

    pub fn with_period(engine: LifecycleEngine, period: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            engine,
            period,
            batch_size: SWEEP_BATCH,
            event_tx,
            running: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Records fetched per store query
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Run one pass over every record due for expiry
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.engine.now();
        let mut cursor: Option<ExpiryCursor> = None;

        loop {
            let due = self
                .engine
                .store()
                .find_approved_expired(now, cursor.as_ref(), self.batch_size)
                .await?;
            let batch_len = due.len();
            if let Some(last) = due.last() {
                cursor = ExpiryCursor::after(last);
            }

            for record in due {
                report.examined += 1;
                match self.engine.expire(&record.id).await {
                    Ok(Some(_)) => report.expired += 1,
                    Ok(None) => {}
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(
                            verification_id = %record.id,
                            user_id = %record.user_id,
                            error = %e,
                            "Failed to expire verification"
                        );
                        let _ = self.event_tx.send(SchedulerEvent::RecordFailed {
                            verification_id: record.id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }

            if batch_len < self.batch_size || cursor.is_none() {
                break;
            }
        }

        tracing::info!(
            examined = report.examined,
            expired = report.expired,
            failed = report.failed,
            "Expiry sweep completed"
        );
        let _ = self.event_tx.send(SchedulerEvent::SweepCompleted(report.clone()));
        Ok(report)
    }

    /// Start the background loop; the first sweep runs immediately
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        let _ = self.event_tx.send(SchedulerEvent::Started);
        tracing::info!(period_secs = self.period.as_secs(), "Expiry scheduler started");

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scheduler.shutdown.notified() => break,
                }

                if !*scheduler.running.read().await {
                    break;
                }

                if let Err(e) = scheduler.sweep().await {
                    tracing::error!(error = %e, "Expiry sweep aborted");
                }
            }

            let _ = scheduler.event_tx.send(SchedulerEvent::Stopped);
            tracing::info!("Expiry scheduler stopped");
        });

        Ok(())
    }

    /// Stop the background loop after any in-flight sweep finishes
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if *running {
            *running = false;
            self.shutdown.notify_one();
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
