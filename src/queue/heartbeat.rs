//! Instance heartbeats used to size the worker pool

use crate::queue::store::WorkStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_TTL_BEATS: u32 = 3;

/// Periodically refreshes this instance's key under the heartbeat prefix.
///
/// The key lives for at least three beat intervals, so one late beat does not
/// drop the instance from the count.
pub struct Heartbeat {
    store: Arc<dyn WorkStore>,
    key: String,
    interval: Duration,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(
        store: Arc<dyn WorkStore>,
        prefix: &str,
        instance_id: &str,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: format!("{prefix}{instance_id}"),
            interval,
            ttl: ttl.max(interval.saturating_mul(MIN_TTL_BEATS)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Write the heartbeat once.
    pub async fn beat(&self) -> crate::error::EngineResult<()> {
        let now = chrono::Utc::now().timestamp().to_string();
        self.store.set_ex(&self.key, &now, self.ttl).await
    }

    /// Beat every interval until `ctx` is cancelled.
    pub async fn run(self, ctx: CancellationToken) {
        debug!(key = %self.key, "heartbeat started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(key = %self.key, error = %e, "heartbeat write failed");
                    }
                }
            }
        }
        debug!(key = %self.key, "heartbeat stopped");
    }
}
