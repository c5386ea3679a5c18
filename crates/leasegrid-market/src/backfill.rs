//! Backfill driver — keeps backfill admission pressure on the market.
//!
//! While the number of alive backfill requests is under the configured
//! cap, periodically submits a new one from the template. Denials back
//! off exponentially up to a maximum interval; a successful submission
//! resets the cadence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::manager::{AsyncCreate, AsyncRequestManager};

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub enabled: bool,
    /// Maximum alive backfill requests at any time.
    pub cap: usize,
    pub instance_count: u32,
    pub memory_mb: u64,
    pub caller: String,
    pub interval: Duration,
    pub max_interval: Duration,
}

pub struct BackfillDriver {
    manager: Arc<AsyncRequestManager>,
    settings: BackfillSettings,
}

enum Tick {
    Submitted,
    AtCap,
    Denied,
}

impl BackfillDriver {
    pub fn new(manager: Arc<AsyncRequestManager>, settings: BackfillSettings) -> Self {
        Self { manager, settings }
    }

    /// Drive submissions until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.settings.enabled {
            info!("backfill driver disabled");
            return;
        }
        info!(
            cap = self.settings.cap,
            interval_secs = self.settings.interval.as_secs(),
            "backfill driver started"
        );
        let mut delay = self.settings.interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    delay = match self.tick() {
                        Tick::Submitted | Tick::AtCap => self.settings.interval,
                        Tick::Denied => {
                            let next = backoff(delay, self.settings.max_interval);
                            debug!(next_secs = next.as_secs(), "backfill denied, backing off");
                            next
                        }
                    };
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("backfill driver stopping");
                        return;
                    }
                }
            }
        }
    }

    fn tick(&self) -> Tick {
        if self.manager.alive_backfill_count() >= self.settings.cap {
            return Tick::AtCap;
        }
        let create = AsyncCreate {
            spot: false,
            max_bid: 0.0,
            persistent: false,
            caller: self.settings.caller.clone(),
            group_id: None,
            instance_count: self.settings.instance_count,
            memory_mb: self.settings.memory_mb,
        };
        match self.manager.add_request(create) {
            Ok(request) => {
                debug!(request = %request.id, "backfill request submitted");
                Tick::Submitted
            }
            Err(MarketError::Denied(reason)) => {
                debug!(reason, "backfill submission denied");
                Tick::Denied
            }
            Err(e) => {
                warn!(error = %e, "backfill submission failed");
                Tick::Denied
            }
        }
    }
}

/// Double the delay, saturating at the maximum.
fn backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
