//! Consecutive-failure bookkeeping per (user, proxy)

use super::BatchHandler;
use crate::database::{FailureDelta, ProxyDatabase};
use crate::error::EngineResult;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Outcome of one check for one owner of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureUpdate {
    pub user_id: i64,
    pub proxy_id: i64,
    pub success: bool,
    /// Whether crossing `threshold` removes the relationship
    pub auto_remove: bool,
    pub threshold: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Counter after this flush; `None` when the relationship no longer exists
    pub failures: Option<u32>,
    /// The relationship was deleted by this flush
    pub removed: bool,
    /// The proxy lost its last owner and was deleted
    pub orphaned: bool,
}

type Pair = (i64, i64);

/// Net effect of all events for one pair within a flush
#[derive(Debug, Clone, Copy)]
struct Folded {
    saw_success: bool,
    /// Failures after the last success, or all of them if none succeeded
    trailing_failures: u32,
    auto_remove: bool,
    threshold: u32,
}

fn fold(batch: &[FailureUpdate]) -> HashMap<Pair, Folded> {
    let mut folded: HashMap<Pair, Folded> = HashMap::new();
    for update in batch {
        let entry = folded
            .entry((update.user_id, update.proxy_id))
            .or_insert(Folded {
                saw_success: false,
                trailing_failures: 0,
                auto_remove: update.auto_remove,
                threshold: update.threshold,
            });
        if update.success {
            entry.saw_success = true;
            entry.trailing_failures = 0;
        } else {
            entry.trailing_failures = entry.trailing_failures.saturating_add(1);
        }
        // the latest request carries the freshest user settings
        entry.auto_remove = update.auto_remove;
        entry.threshold = update.threshold;
    }
    folded
}

/// Applies failure updates with one statement per kind, then removes the
/// relationships that crossed their threshold with one more. All three run
/// in one transaction, so a flush either fully applies or fully fails.
pub struct FailureTracker {
    db: ProxyDatabase,
}

impl FailureTracker {
    pub fn new(db: ProxyDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BatchHandler for FailureTracker {
    type Request = FailureUpdate;
    type Response = FailureOutcome;

    fn name(&self) -> &'static str {
        "failure-tracker"
    }

    async fn handle(&self, batch: &[FailureUpdate]) -> EngineResult<Vec<FailureOutcome>> {
        let folded = fold(batch);

        let mut resets = Vec::new();
        let mut increments = Vec::new();
        for (&(user_id, proxy_id), f) in &folded {
            let delta = FailureDelta {
                user_id,
                proxy_id,
                value: f.trailing_failures,
            };
            if f.saw_success {
                resets.push(delta);
            } else {
                increments.push(delta);
            }
        }

        let mut writes = self.db.failure_writes().await?;
        let mut counts: HashMap<Pair, u32> = HashMap::with_capacity(folded.len());
        for row in writes.reset(&resets).await? {
            counts.insert((row.user_id, row.proxy_id), row.failures);
        }
        for row in writes.increment(&increments).await? {
            counts.insert((row.user_id, row.proxy_id), row.failures);
        }

        let crossed: Vec<Pair> = counts
            .iter()
            .filter(|(pair, failures)| {
                folded
                    .get(*pair)
                    .map(|f| f.auto_remove && **failures >= f.threshold.max(1))
                    .unwrap_or(false)
            })
            .map(|(pair, _)| *pair)
            .collect();

        let removal = writes.remove_relationships(&crossed).await?;
        writes.commit().await?;
        for (user_id, proxy_id) in &removal.removed {
            info!(user_id, proxy_id, "proxy removed for user after repeated failures");
        }
        let removed: HashSet<Pair> = removal.removed.into_iter().collect();
        let orphaned: HashSet<i64> = removal.orphaned.into_iter().collect();

        debug!(
            requests = batch.len(),
            pairs = folded.len(),
            removed = removed.len(),
            "failure batch applied"
        );

        Ok(batch
            .iter()
            .map(|update| {
                let pair = (update.user_id, update.proxy_id);
                let was_removed = removed.contains(&pair);
                FailureOutcome {
                    failures: if was_removed { None } else { counts.get(&pair).copied() },
                    removed: was_removed,
                    orphaned: was_removed && orphaned.contains(&update.proxy_id),
                }
            })
            .collect())
    }
}
