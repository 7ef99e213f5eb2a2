//! Background loop that redelivers due dead-letter entries.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::engine::JobEngine;

/// Scans the dead-letter queue on a fixed interval and hands due jobs back to
/// the engine. Also runs the engine's housekeeping on every tick.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    engine: JobEngine,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(engine: JobEngine, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// One scan: redeliver what is due, then housekeeping.
    pub async fn tick(&self) -> usize {
        let redelivered = self.engine.redeliver_due().await;
        if redelivered > 0 {
            debug!(redelivered, "dead-letter scan");
        }
        self.engine.maintenance();
        redelivered
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "retry scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("retry scheduler stopped");
        })
    }
}
