//! Background periodic sync: a 30-second cadence that drains the queue
//! while the process is online. Overlapping ticks coalesce on the
//! engine's `is_syncing` guard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::offline::Connectivity;

pub struct PeriodicSync {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicSync {
    /// Spawn the background loop.
    #[must_use]
    pub fn start(
        engine: Arc<SyncEngine>,
        connectivity: Arc<Connectivity>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "Periodic sync started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !connectivity.is_online() {
                            continue;
                        }
                        let queued = match engine.queue().count().await {
                            Ok(count) => count,
                            Err(e) => {
                                warn!(error = %e, "Queue count failed in periodic sync");
                                continue;
                            }
                        };
                        if queued == 0 {
                            continue;
                        }
                        match engine.sync().await {
                            Ok(report) => {
                                debug!(
                                    synced = report.synced,
                                    failed = report.failed,
                                    conflicts = report.conflicts,
                                    "Periodic sync tick"
                                );
                            }
                            Err(SyncError::SyncInProgress) => {
                                debug!("Periodic tick coalesced, sync already running");
                            }
                            Err(e) => {
                                warn!(error = %e, "Periodic sync failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Periodic sync stopping");
                        break;
                    }
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Signal the loop to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
