//! Degraded-mode composition: storage pressure, auth expiry and queue
//! depth folded into one user-visible mode, cached briefly and exposed as
//! a watch subscription.

use std::sync::Arc;
use std::time::{Duration, Instant};

use config::DegradedConfig;
use ct_core::traits::SessionProbe;
use ct_core::types::DegradedMode;
use queue::OperationQueue;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StorageResult;
use crate::quota::StorageMonitor;

pub struct DegradedModeManager {
    monitor: Arc<StorageMonitor>,
    queue: OperationQueue,
    session: Arc<dyn SessionProbe>,
    config: DegradedConfig,
    cache: RwLock<Option<(DegradedMode, Instant)>>,
    tx: watch::Sender<DegradedMode>,
}

impl DegradedModeManager {
    #[must_use]
    pub fn new(
        monitor: Arc<StorageMonitor>,
        queue: OperationQueue,
        session: Arc<dyn SessionProbe>,
        config: DegradedConfig,
    ) -> Self {
        let (tx, _) = watch::channel(DegradedMode::Normal);
        Self {
            monitor,
            queue,
            session,
            config,
            cache: RwLock::new(None),
            tx,
        }
    }

    /// Current mode, cached for the configured TTL.
    pub async fn current(&self) -> StorageResult<DegradedMode> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        {
            let cache = self.cache.read().await;
            if let Some((mode, computed_at)) = cache.as_ref()
                && computed_at.elapsed() < ttl
            {
                return Ok(*mode);
            }
        }
        let mode = self.compute().await?;
        *self.cache.write().await = Some((mode, Instant::now()));
        Ok(mode)
    }

    /// Modes in priority order; the first match wins.
    async fn compute(&self) -> StorageResult<DegradedMode> {
        let metrics = self.monitor.metrics().await?;
        if metrics.percent >= self.monitor.config().emergency_percent {
            return Ok(DegradedMode::ReadOnlyStorage);
        }
        let queued = self.queue.count().await?;
        if self.session.session_expired() && queued > 0 {
            return Ok(DegradedMode::ReadOnlyAuth);
        }
        if queued > self.config.queue_pressure_threshold {
            return Ok(DegradedMode::QueuePressure);
        }
        Ok(DegradedMode::Normal)
    }

    /// Whether a create should be blocked right now. Queue pressure warns
    /// without blocking.
    pub async fn blocks_creation(&self) -> StorageResult<bool> {
        Ok(self.current().await?.blocks_creation())
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Subscribe to mode changes (driven by [`Self::start_polling`]).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DegradedMode> {
        self.tx.subscribe()
    }

    /// Poll at the configured cadence and publish changes to
    /// subscribers.
    #[must_use]
    pub fn start_polling(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(manager.config.poll_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                cadence_secs = manager.config.poll_interval_secs,
                "Degraded-mode polling started"
            );
            loop {
                ticker.tick().await;
                match manager.current().await {
                    Ok(mode) => {
                        let changed = *manager.tx.borrow() != mode;
                        if changed {
                            debug!(?mode, "Degraded mode changed");
                            let _ = manager.tx.send(mode);
                        }
                    }
                    Err(e) => warn!(error = %e, "Degraded-mode computation failed"),
                }
            }
        })
    }
}
