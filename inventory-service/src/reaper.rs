use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::reservations::ReservationOrchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub sweep_timeout: Duration,
    pub batch_size: i64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            sweep_timeout: Duration::from_secs(30),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// Rows that had already left PENDING or were extended after being listed.
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically moves overdue PENDING reservations to EXPIRED and releases
/// their pending holds.
#[derive(Clone)]
pub struct ExpirationReaper {
    orchestrator: Arc<ReservationOrchestrator>,
    settings: ReaperSettings,
}

impl ExpirationReaper {
    pub fn new(orchestrator: Arc<ReservationOrchestrator>, settings: ReaperSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    /// One pass over the overdue reservations, `batch_size` rows at a time.
    /// A failing row is logged and counted; it does not stop the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let batch_size = self.settings.batch_size.max(1);
        let mut report = SweepReport::default();
        // Expired and skipped rows drop out of the overdue listing. Failed ones
        // stay in it, so each page is widened past them.
        let mut attempted = HashSet::new();
        let mut failed = 0i64;

        loop {
            let overdue = self
                .orchestrator
                .overdue_reservations(batch_size.saturating_add(failed))
                .await?;
            let page: Vec<_> = overdue
                .into_iter()
                .filter(|r| !attempted.contains(&r.reservation_id))
                .take(usize::try_from(batch_size).unwrap_or(usize::MAX))
                .collect();
            if page.is_empty() {
                break;
            }

            for reservation in page {
                report.examined += 1;
                match self.orchestrator.expire_reservation(&reservation.reservation_id).await {
                    Ok(Some(_)) => report.expired += 1,
                    Ok(None) => {
                        debug!(reservation_id = %reservation.reservation_id, "Reservation no longer overdue");
                        report.skipped += 1;
                    }
                    Err(e) => {
                        error!(
                            reservation_id = %reservation.reservation_id,
                            item_id = %reservation.item_id,
                            "Failed to expire reservation: {}",
                            e
                        );
                        report.failed += 1;
                        failed += 1;
                    }
                }
                attempted.insert(reservation.reservation_id);
            }
        }

        Ok(report)
    }

    /// Sweep on every tick until `shutdown` flips to `true`. Sweeps never
    /// overlap: a tick that fires while one is running is skipped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.settings.interval.as_secs(),
            batch_size = self.settings.batch_size,
            "Expiration reaper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match time::timeout(self.settings.sweep_timeout, self.sweep()).await {
                Ok(Ok(report)) if report.examined > 0 => info!(
                    examined = report.examined,
                    expired = report.expired,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Expiration sweep finished"
                ),
                Ok(Ok(_)) => debug!("Expiration sweep found nothing overdue"),
                Ok(Err(e)) => error!("Expiration sweep failed: {}", e),
                Err(_) => warn!(
                    timeout_secs = self.settings.sweep_timeout.as_secs(),
                    "Expiration sweep timed out"
                ),
            }
        }

        info!("Expiration reaper stopped");
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(receiver).await });
        ReaperHandle { shutdown, task }
    }
}

pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the loop and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Expiration reaper task failed: {}", e);
        }
    }
}
