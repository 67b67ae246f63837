//! Scheduling queue over the shared work store
//!
//! Each proxy lives in the store twice: a serialized [`WorkItem`] payload
//! under `payload_prefix + hash`, and a member of the due index scored by the
//! Unix second at which it should next be checked. While a worker holds a
//! claimed item, a marker under `claim_prefix + hash` keeps it from being
//! enqueued again; the marker expires after `claim_ttl` so items held by a
//! dead instance can be restored.

pub mod heartbeat;
pub mod memory;
pub mod store;

pub use heartbeat::Heartbeat;
pub use memory::MemoryWorkStore;
pub use store::{AddMode, ClaimedEntry, QueueKeys, WorkStore};

use crate::error::{EngineError, EngineResult};
use crate::proxy::models::WorkItem;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of the current Unix time in seconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

/// Store key layout and polling behaviour of the queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub index_key: String,
    pub payload_prefix: String,
    pub heartbeat_prefix: String,
    pub claim_prefix: String,
    /// How long a claim shields an item from re-enqueueing; must outlast
    /// the processing of one item
    pub claim_ttl: Duration,
    /// Sleep between claim attempts when nothing is due
    pub poll_interval: Duration,
    /// Members read or rewritten per store call during a reschedule
    pub page_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            index_key: "proxies:due".to_string(),
            payload_prefix: "proxies:payload:".to_string(),
            heartbeat_prefix: "instances:heartbeat:".to_string(),
            claim_prefix: "proxies:claimed:".to_string(),
            claim_ttl: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            page_size: 1000,
        }
    }
}

pub struct SchedulingQueue {
    store: Arc<dyn WorkStore>,
    config: QueueConfig,
    interval_secs: AtomicU64,
    clock: Clock,
}

impl SchedulingQueue {
    pub fn new(store: Arc<dyn WorkStore>, interval: Duration, config: QueueConfig) -> Self {
        Self::with_clock(store, interval, config, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn WorkStore>,
        interval: Duration,
        config: QueueConfig,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            config,
            interval_secs: AtomicU64::new(interval.as_secs().max(1)),
            clock,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::Relaxed))
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    fn keys(&self) -> QueueKeys<'_> {
        QueueKeys {
            index: &self.config.index_key,
            payload_prefix: &self.config.payload_prefix,
            claim_prefix: &self.config.claim_prefix,
        }
    }

    fn payload_key(&self, hash: &str) -> String {
        format!("{}{}", self.config.payload_prefix, hash)
    }

    fn encode_payloads(&self, items: &[WorkItem]) -> EngineResult<Vec<(String, String)>> {
        items
            .iter()
            .map(|item| Ok((self.payload_key(&item.hash), serde_json::to_string(item)?)))
            .collect()
    }

    /// Add items, spreading their due times linearly across one interval.
    ///
    /// Items already in the due index keep their position and items currently
    /// claimed by a worker are left alone. Returns the number of newly indexed
    /// items.
    pub async fn enqueue(&self, items: &[WorkItem]) -> EngineResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let now = self.now();
        let interval = self.interval_secs.load(Ordering::Relaxed) as i64;
        let n = items.len() as i64;

        self.store.put_payloads(self.encode_payloads(items)?).await?;
        let members = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.hash.clone(), now + (i as i64 * interval) / n))
            .collect();
        let added = self.store.add_unclaimed(self.keys(), members).await?;
        debug!(requested = items.len(), added, "enqueued proxies");
        Ok(added)
    }

    /// Wait for the next due item and claim it atomically.
    ///
    /// Returns `EngineError::Cancelled` as soon as `ctx` is cancelled. Entries
    /// whose payload is missing or unreadable are dropped and skipped.
    pub async fn claim_next(&self, ctx: &CancellationToken) -> EngineResult<WorkItem> {
        loop {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let claimed = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(EngineError::Cancelled),
                r = self.store.claim_due(self.keys(), self.now(), self.config.claim_ttl) => r?,
            };

            match claimed {
                Some(entry) => match decode_entry(&entry) {
                    Ok(item) => return Ok(item),
                    Err(e) => {
                        warn!(member = %entry.member, error = %e, "dropping unreadable queue entry");
                        continue;
                    }
                },
                None => {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Put a checked item back, due one interval after `max(now, last_check)`,
    /// and drop its claim.
    pub async fn requeue(&self, item: &WorkItem, last_check: i64) -> EngineResult<()> {
        let interval = self.interval_secs.load(Ordering::Relaxed) as i64;
        let due = self.now().max(last_check) + interval;
        self.store
            .put_payloads(self.encode_payloads(std::slice::from_ref(item))?)
            .await?;
        self.store.release(self.keys(), &item.hash, due).await
    }

    /// Drop items from the index and delete their payloads and claims.
    pub async fn remove_many(&self, items: &[WorkItem]) -> EngineResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let members: Vec<String> = items.iter().map(|i| i.hash.clone()).collect();
        self.store.remove_members(self.keys(), &members).await
    }

    /// Switch to a new interval and re-spread every queued due time across it,
    /// keeping the current queue order.
    ///
    /// Members are read in pages first and then rewritten in pages with
    /// update-only inserts, so items claimed in the meantime are not revived.
    /// Pages continue after the last `(score, member)` seen rather than at a
    /// rank, so concurrent claims cannot shift members past the reader.
    pub async fn reschedule(&self, new_interval: Duration) -> EngineResult<usize> {
        let interval = new_interval.as_secs().max(1);
        self.interval_secs.store(interval, Ordering::Relaxed);

        let page = self.config.page_size.max(1);
        let mut members: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<(i64, String)> = None;
        loop {
            let chunk = self
                .store
                .range_after(&self.config.index_key, cursor.as_ref(), page)
                .await?;
            let len = chunk.len();
            if let Some((member, score)) = chunk.last() {
                cursor = Some((*score, member.clone()));
            }
            for (member, _) in chunk {
                if seen.insert(member.clone()) {
                    members.push(member);
                }
            }
            if len < page {
                break;
            }
        }

        if members.is_empty() {
            return Ok(0);
        }
        let now = self.now();
        let total = members.len() as i64;
        let interval = interval as i64;
        let mut updated = 0;
        for (page_idx, chunk) in members.chunks(page).enumerate() {
            let updates = chunk
                .iter()
                .enumerate()
                .map(|(j, member)| {
                    let position = (page_idx * page + j) as i64;
                    (member.clone(), now + position * interval / total)
                })
                .collect();
            updated += self
                .store
                .zadd(&self.config.index_key, updates, AddMode::IfPresent)
                .await?;
        }
        debug!(updated, interval_secs = interval, "rescheduled queue");
        Ok(updated)
    }

    pub async fn count(&self) -> EngineResult<u64> {
        self.store.card(&self.config.index_key).await
    }

    pub async fn active_instance_count(&self) -> EngineResult<u64> {
        self.store.count_prefix(&self.config.heartbeat_prefix).await
    }
}

fn decode_entry(entry: &ClaimedEntry) -> EngineResult<WorkItem> {
    let payload = entry
        .payload
        .as_deref()
        .ok_or_else(|| EngineError::Store(format!("missing payload for {}", entry.member)))?;
    Ok(serde_json::from_str(payload)?)
}
