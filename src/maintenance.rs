//! Singleton periodic jobs, each run by whichever instance holds its lease

use crate::config::Settings;
use crate::database::ProxyDatabase;
use crate::error::EngineResult;
use crate::leader::LeaderElector;
use crate::queue::SchedulingQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const QUEUE_REPAIR_KEY: &str = "leader:queue-repair";
pub const STATISTICS_RETENTION_KEY: &str = "leader:statistics-retention";

/// Enqueue every owned proxy from the database. Items already scheduled keep
/// their due time and items a worker still holds are skipped; items whose
/// claim expired without a requeue come back.
pub async fn repair_queue(
    ctx: &CancellationToken,
    db: &ProxyDatabase,
    queue: &SchedulingQueue,
    page_size: usize,
) -> EngineResult<usize> {
    let limit = page_size.max(1) as i64;
    let mut after_id = 0;
    let mut restored = 0;
    loop {
        if ctx.is_cancelled() {
            return Err(crate::error::EngineError::Cancelled);
        }
        let page = db.proxies_page(after_id, limit).await?;
        let Some(last) = page.last() else { break };
        after_id = last.id;
        restored += queue.enqueue(&page).await?;
        if (page.len() as i64) < limit {
            break;
        }
    }
    Ok(restored)
}

/// Delete check statistics older than `retention_days` before `now`.
pub async fn prune_statistics(db: &ProxyDatabase, retention_days: u64, now: i64) -> EngineResult<u64> {
    let retention = i64::try_from(retention_days.saturating_mul(86_400)).unwrap_or(i64::MAX);
    db.delete_statistics_before(now.saturating_sub(retention)).await
}

/// Runs `pass` immediately and then every `every`, until `lease_ctx` ends.
async fn every<F, Fut>(lease_ctx: CancellationToken, every: Duration, mut pass: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    loop {
        pass().await?;
        tokio::select! {
            _ = lease_ctx.cancelled() => return Ok(()),
            _ = tokio::time::sleep(every) => {}
        }
    }
}

pub struct Maintenance {
    elector: Arc<LeaderElector>,
    db: ProxyDatabase,
    queue: Arc<SchedulingQueue>,
    settings: watch::Receiver<Settings>,
}

impl Maintenance {
    pub fn new(
        elector: Arc<LeaderElector>,
        db: ProxyDatabase,
        queue: Arc<SchedulingQueue>,
        settings: watch::Receiver<Settings>,
    ) -> Self {
        Self {
            elector,
            db,
            queue,
            settings,
        }
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.borrow().leadership.ttl_secs.max(1))
    }

    /// Periodic queue repair while this instance leads it.
    pub async fn run_queue_repair(&self, ctx: CancellationToken) {
        let ttl = self.lease_ttl();
        let result = self
            .elector
            .run_with_leader(&ctx, QUEUE_REPAIR_KEY, ttl, |lease_ctx| {
                let db = self.db.clone();
                let queue = Arc::clone(&self.queue);
                let settings = self.settings.clone();
                async move {
                    let interval = Duration::from_secs(
                        settings.borrow().maintenance.queue_repair_interval_secs.max(1),
                    );
                    every(lease_ctx.clone(), interval, || {
                        let db = db.clone();
                        let queue = Arc::clone(&queue);
                        let lease_ctx = lease_ctx.clone();
                        async move {
                            let page_size = queue.config().page_size;
                            match repair_queue(&lease_ctx, &db, &queue, page_size).await {
                                Ok(restored) => {
                                    info!(restored, "queue repair pass finished");
                                    Ok(())
                                }
                                Err(e) if e.is_cancelled() => Ok(()),
                                Err(e) => Err(e.into()),
                            }
                        }
                    })
                    .await
                }
            })
            .await;
        if let Err(e) = result {
            warn!(key = QUEUE_REPAIR_KEY, error = %e, "queue repair loop ended");
        }
    }

    /// Periodic statistics pruning while this instance leads it.
    pub async fn run_statistics_retention(&self, ctx: CancellationToken) {
        let ttl = self.lease_ttl();
        let result = self
            .elector
            .run_with_leader(&ctx, STATISTICS_RETENTION_KEY, ttl, |lease_ctx| {
                let db = self.db.clone();
                let settings = self.settings.clone();
                async move {
                    let interval = Duration::from_secs(
                        settings.borrow().maintenance.retention_interval_secs.max(1),
                    );
                    every(lease_ctx, interval, || {
                        let db = db.clone();
                        let days = settings.borrow().maintenance.statistics_retention_days;
                        async move {
                            let now = chrono::Utc::now().timestamp();
                            let deleted = prune_statistics(&db, days, now).await?;
                            info!(deleted, retention_days = days, "statistics pruned");
                            Ok(())
                        }
                    })
                    .await
                }
            })
            .await;
        if let Err(e) = result {
            warn!(key = STATISTICS_RETENTION_KEY, error = %e, "statistics retention loop ended");
        }
    }
}
