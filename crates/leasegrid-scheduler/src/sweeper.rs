//! Lease sweeper — background expiry of over-deadline instances.
//!
//! Polls the scheduler's lease tasks on an interval and tears down every
//! instance whose stop time has passed without a shutdown request. Each
//! teardown flows through the same destroying notification path as an
//! externally requested destroy, so slot release and event publication
//! are identical.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::SchedulerResult;
use crate::home::InstanceHome;
use crate::scheduler::{epoch_secs, NotificationInfo, Scheduler};
use crate::states::STATE_DESTROYING;

pub struct Sweeper {
    scheduler: Arc<Scheduler>,
    home: Arc<dyn InstanceHome>,
    interval: Duration,
    /// Grace period handed to trash for a clean guest shutdown.
    grace_secs: u64,
}

impl Sweeper {
    pub fn new(
        scheduler: Arc<Scheduler>,
        home: Arc<dyn InstanceHome>,
        interval: Duration,
        grace_secs: u64,
    ) -> Self {
        Self {
            scheduler,
            home,
            interval,
            grace_secs,
        }
    }

    /// Sweep until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "lease sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "sweep pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("lease sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One sweep pass. Failures on one instance never stop the pass.
    pub async fn sweep_once(&self) -> SchedulerResult<()> {
        let now = epoch_secs();
        let due = self.scheduler.tasks_to_shutdown(now)?;
        if due.is_empty() {
            return Ok(());
        }
        info!(count = due.len(), "leases expired, tearing down");

        for id in due {
            // Release the slot and publish the destroying event first,
            // then drop the record itself.
            let notified = self
                .scheduler
                .state_notification(id, STATE_DESTROYING, NotificationInfo::default())
                .await;
            if let Err(e) = notified {
                error!(id, error = %e, "expiry notification failed, continuing");
                continue;
            }
            if let Err(e) = self.home.trash(id, self.grace_secs, "sweeper") {
                error!(id, error = %e, "trash failed, continuing");
            }
            debug!(id, "expired instance swept");
        }
        Ok(())
    }
}
