//! Per-item checking pipeline and the worker loop that drives it

use crate::coalesce::{Coalescer, FailureOutcome, FailureTracker, FailureUpdate, OwnershipVerifier};
use crate::config::Settings;
use crate::database::ProxyDatabase;
use crate::error::{EngineError, EngineResult};
use crate::proxy::checker::Checker;
use crate::proxy::judge::{Judge, JudgeRouter};
use crate::proxy::models::{CheckOutcome, Protocol, ProxyOwner, WorkItem};
use crate::queue::SchedulingQueue;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

/// What happened to an item after it was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Checked and put back in the queue
    Requeued,
    /// No owner is left; removed from the queue
    Dropped,
}

/// One outbound check shared by every owner that routed to the same judge
struct CheckGroup {
    judge: Arc<Judge>,
    protocol: Protocol,
    timeout_ms: u64,
    retries: u32,
    users: Vec<i64>,
}

/// Groups (owner, protocol) assignments by (judge URL, protocol) so owners
/// that share a judge trigger a single request.
fn build_groups(owners: &[ProxyOwner], router: &JudgeRouter, enabled: &[Protocol]) -> Vec<CheckGroup> {
    let mut groups: Vec<CheckGroup> = Vec::new();
    let mut index: HashMap<(String, Protocol), usize> = HashMap::new();

    for owner in owners {
        for protocol in owner.protocols.iter().filter(|p| enabled.contains(p)) {
            let judge_protocol = protocol.judge_protocol(owner.socks_judge_protocol);
            let Some(judge) = router.select(owner.user_id, judge_protocol) else {
                debug!(user_id = owner.user_id, %protocol, "no judge configured");
                continue;
            };
            let key = (judge.url.clone(), *protocol);
            match index.get(&key) {
                Some(&i) => {
                    let group = &mut groups[i];
                    group.timeout_ms = group.timeout_ms.max(owner.timeout_ms);
                    group.retries = group.retries.max(owner.retries);
                    if !group.users.contains(&owner.user_id) {
                        group.users.push(owner.user_id);
                    }
                }
                None => {
                    index.insert(key, groups.len());
                    groups.push(CheckGroup {
                        judge,
                        protocol: *protocol,
                        timeout_ms: owner.timeout_ms,
                        retries: owner.retries,
                        users: vec![owner.user_id],
                    });
                }
            }
        }
    }
    groups
}

pub struct Pipeline {
    queue: Arc<SchedulingQueue>,
    db: ProxyDatabase,
    router: Arc<JudgeRouter>,
    checker: Arc<Checker>,
    failures: Coalescer<FailureTracker>,
    ownership: Coalescer<OwnershipVerifier>,
    settings: watch::Receiver<Settings>,
}

impl Pipeline {
    pub fn new(
        queue: Arc<SchedulingQueue>,
        db: ProxyDatabase,
        router: Arc<JudgeRouter>,
        checker: Arc<Checker>,
        failures: Coalescer<FailureTracker>,
        ownership: Coalescer<OwnershipVerifier>,
        settings: watch::Receiver<Settings>,
    ) -> Self {
        Self {
            queue,
            db,
            router,
            checker,
            failures,
            ownership,
            settings,
        }
    }

    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    /// Check one claimed item for all of its owners and put it back or drop it.
    pub async fn process(&self, ctx: &CancellationToken, item: &WorkItem) -> EngineResult<Disposition> {
        let owners = self.db.owners_of(item.id).await?;
        if owners.is_empty() {
            debug!(proxy_id = item.id, "proxy has no owner; dropping");
            self.queue.remove_many(std::slice::from_ref(item)).await?;
            return Ok(Disposition::Dropped);
        }

        let (enabled, auto_remove_enabled) = {
            let settings = self.settings.borrow();
            (settings.checker.protocols.clone(), settings.auto_remove.enabled)
        };

        let groups = build_groups(&owners, &self.router, &enabled);
        let checks = groups.iter().map(|g| {
            self.checker.run_check(
                ctx,
                item,
                g.protocol,
                &g.judge,
                Duration::from_millis(g.timeout_ms),
                g.retries,
            )
        });
        let outcomes: Vec<CheckOutcome> = join_all(checks)
            .await
            .into_iter()
            .collect::<EngineResult<_>>()?;
        let checked_at = chrono::Utc::now().timestamp();

        if let Err(e) = self.db.insert_statistics(item.id, &outcomes, checked_at).await {
            warn!(proxy_id = item.id, error = %e, "failed to record check statistics");
        }

        let mut alive_for: HashMap<i64, bool> = HashMap::new();
        for (group, outcome) in groups.iter().zip(&outcomes) {
            for user_id in &group.users {
                *alive_for.entry(*user_id).or_insert(false) |= outcome.alive;
            }
        }

        let updates: Vec<FailureUpdate> = owners
            .iter()
            .filter_map(|owner| {
                alive_for.get(&owner.user_id).map(|alive| FailureUpdate {
                    user_id: owner.user_id,
                    proxy_id: item.id,
                    success: *alive,
                    auto_remove: auto_remove_enabled && owner.auto_remove,
                    threshold: owner.auto_remove_threshold,
                })
            })
            .collect();
        let results: Vec<FailureOutcome> = join_all(updates.iter().map(|u| self.failures.submit(ctx, *u)))
            .await
            .into_iter()
            .collect::<EngineResult<_>>()?;

        let removed: Vec<i64> = updates
            .iter()
            .zip(&results)
            .filter(|(_, r)| r.removed)
            .map(|(u, _)| u.user_id)
            .collect();
        let remaining = owners.iter().filter(|o| !removed.contains(&o.user_id)).count();
        debug!(
            proxy_id = item.id,
            checks = outcomes.len(),
            alive = outcomes.iter().any(|o| o.alive),
            removed_for = removed.len(),
            remaining,
            "proxy checked"
        );

        // another instance may have removed the last owner meanwhile
        if !self.ownership.submit(ctx, item.id).await? {
            self.queue.remove_many(std::slice::from_ref(item)).await?;
            return Ok(Disposition::Dropped);
        }
        self.queue.requeue(item, checked_at).await?;
        Ok(Disposition::Requeued)
    }

    async fn requeue_after_failure(&self, item: &WorkItem) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.queue.requeue(item, now).await {
            error!(proxy_id = item.id, error = %e, "failed to requeue proxy; queue repair will restore it");
        }
    }

    /// Claim and process items until `ctx` is cancelled. `busy` is set while
    /// an item is in flight.
    pub async fn run_worker(&self, ctx: CancellationToken, busy: Arc<AtomicBool>) {
        debug!("worker started");
        loop {
            let item = match self.queue.claim_next(&ctx).await {
                Ok(item) => item,
                Err(EngineError::Cancelled) => break,
                Err(e) => {
                    warn!(error = %e, "claim failed");
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(self.queue.config().poll_interval) => continue,
                    }
                }
            };

            busy.store(true, Ordering::SeqCst);
            let span = tracing::debug_span!("check", proxy_id = item.id, proxy = %item);
            let result = AssertUnwindSafe(self.process(&ctx, &item).instrument(span))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_cancelled() => {
                    self.requeue_after_failure(&item).await;
                }
                Ok(Err(e)) => {
                    warn!(proxy_id = item.id, error = %e, "processing failed");
                    self.requeue_after_failure(&item).await;
                }
                Err(_) => {
                    error!(proxy_id = item.id, "processing panicked");
                    self.requeue_after_failure(&item).await;
                }
            }
            busy.store(false, Ordering::SeqCst);

            if ctx.is_cancelled() {
                break;
            }
        }
        debug!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalesce::BatchConfig;
    use crate::database::tests::{new_user, proxy};
    use crate::database::NewUser;
    use crate::proxy::checker::tests::{ScriptedProber, AZENV_BODY};
    use crate::queue::{MemoryWorkStore, QueueConfig};

    struct Harness {
        db: ProxyDatabase,
        store: Arc<MemoryWorkStore>,
        router: Arc<JudgeRouter>,
        prober: Arc<ScriptedProber>,
        pipeline: Pipeline,
        _shutdown: tokio_util::sync::DropGuard,
    }

    async fn harness(prober: ScriptedProber) -> Harness {
        let db = ProxyDatabase::in_memory().await.unwrap();
        let store = Arc::new(MemoryWorkStore::new());
        let queue = Arc::new(SchedulingQueue::new(
            store.clone(),
            Duration::from_secs(60),
            QueueConfig {
                poll_interval: Duration::from_millis(10),
                ..QueueConfig::default()
            },
        ));
        let router = Arc::new(JudgeRouter::new());
        let prober = Arc::new(prober);
        let checker = Arc::new(Checker::new(prober.clone(), None));
        let shutdown = CancellationToken::new();
        let batch = BatchConfig {
            flush_interval: Duration::from_millis(5),
            ..BatchConfig::default()
        };
        let (failures, _) = Coalescer::spawn(FailureTracker::new(db.clone()), batch, shutdown.clone());
        let (ownership, _) = Coalescer::spawn(OwnershipVerifier::new(db.clone()), batch, shutdown.clone());
        let (_tx, rx) = watch::channel(Settings::default());
        let pipeline = Pipeline::new(queue, db.clone(), router.clone(), checker, failures, ownership, rx);
        Harness {
            db,
            store,
            router,
            prober,
            pipeline,
            _shutdown: shutdown.drop_guard(),
        }
    }

    fn owner(user_id: i64, protocols: Vec<Protocol>, timeout_ms: u64, retries: u32) -> ProxyOwner {
        ProxyOwner {
            user_id,
            timeout_ms,
            retries,
            auto_remove: false,
            auto_remove_threshold: 3,
            protocols,
            socks_judge_protocol: Protocol::Http,
        }
    }

    #[test]
    fn test_shared_judge_is_checked_once() {
        let router = JudgeRouter::new();
        let shared = Judge::new("http://judge.example/", None).unwrap();
        router.add_to_users(&[1, 2], vec![shared]);
        router.add(3, vec![Judge::new("http://other.example/", None).unwrap()]);

        let owners = vec![
            owner(1, vec![Protocol::Http], 1_000, 1),
            owner(2, vec![Protocol::Http, Protocol::Socks5], 3_000, 0),
            owner(3, vec![Protocol::Http], 500, 4),
        ];
        let groups = build_groups(&owners, &router, &Protocol::ALL);
        assert_eq!(groups.len(), 3);

        let http_shared = groups
            .iter()
            .find(|g| g.judge.url == "http://judge.example/" && g.protocol == Protocol::Http)
            .unwrap();
        assert_eq!(http_shared.users, vec![1, 2]);
        assert_eq!(http_shared.timeout_ms, 3_000);
        assert_eq!(http_shared.retries, 1);

        let socks = groups.iter().find(|g| g.protocol == Protocol::Socks5).unwrap();
        assert_eq!(socks.users, vec![2]);
    }

    #[test]
    fn test_disabled_protocols_and_missing_judges_skipped() {
        let router = JudgeRouter::new();
        router.add(1, vec![Judge::new("http://judge.example/", None).unwrap()]);
        let owners = vec![
            owner(1, vec![Protocol::Http, Protocol::Socks4], 1_000, 0),
            owner(2, vec![Protocol::Http], 1_000, 0),
        ];
        let groups = build_groups(&owners, &router, &[Protocol::Http]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].users, vec![1]);
    }

    #[tokio::test]
    async fn test_live_proxy_is_requeued_with_stats() {
        let h = harness(ScriptedProber::always(AZENV_BODY)).await;
        let user = h.db.add_user(&new_user("u", true, 1)).await.unwrap();
        h.router.add(user, vec![Judge::new("http://judge.example/", None).unwrap()]);
        let item = h.db.add_proxies_for_user(user, &[proxy("1.1.1.1")]).await.unwrap()[0].clone();

        let ctx = CancellationToken::new();
        let disposition = h.pipeline.process(&ctx, &item).await.unwrap();
        assert_eq!(disposition, Disposition::Requeued);
        assert!(h.store.score("proxies:due", &item.hash).await.is_some());
        assert_eq!(h.db.statistics_count(item.id).await.unwrap(), 1);
        assert_eq!(h.db.failure_count(user, item.id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_dead_proxy_removed_at_threshold_is_dropped() {
        let h = harness(ScriptedProber::default()).await;
        let user = h.db.add_user(&new_user("u", true, 1)).await.unwrap();
        h.router.add(user, vec![Judge::new("http://judge.example/", None).unwrap()]);
        let item = h.db.add_proxies_for_user(user, &[proxy("2.2.2.2")]).await.unwrap()[0].clone();

        let ctx = CancellationToken::new();
        let disposition = h.pipeline.process(&ctx, &item).await.unwrap();
        assert_eq!(disposition, Disposition::Dropped);
        assert!(h.store.score("proxies:due", &item.hash).await.is_none());
        assert!(h.db.owners_of(item.id).await.unwrap().is_empty());
        // retries = 1 for this user
        assert_eq!(h.prober.call_count(), 2);
    }

    #[tokio::test]
    async fn test_shared_proxy_survives_one_owner_removal() {
        let h = harness(ScriptedProber::default()).await;
        let strict = h.db.add_user(&new_user("strict", true, 1)).await.unwrap();
        let lenient = h
            .db
            .add_user(&NewUser {
                retries: 0,
                ..new_user("lenient", false, 1)
            })
            .await
            .unwrap();
        let judge = Judge::new("http://judge.example/", None).unwrap();
        h.router.add_to_users(&[strict, lenient], vec![judge]);
        let item = h.db.add_proxies_for_user(strict, &[proxy("3.3.3.3")]).await.unwrap()[0].clone();
        h.db.add_proxies_for_user(lenient, &[proxy("3.3.3.3")]).await.unwrap();

        let disposition = h.pipeline.process(&CancellationToken::new(), &item).await.unwrap();
        assert_eq!(disposition, Disposition::Requeued);
        let owners = h.db.owners_of(item.id).await.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user_id, lenient);
        // one shared request, retried to the larger budget
        assert_eq!(h.prober.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unowned_proxy_is_dropped_without_checks() {
        let h = harness(ScriptedProber::always(AZENV_BODY)).await;
        let item = WorkItem::new(42, "4.4.4.4".to_string(), 80, None);
        h.pipeline.queue().enqueue(std::slice::from_ref(&item)).await.unwrap();

        let disposition = h.pipeline.process(&CancellationToken::new(), &item).await.unwrap();
        assert_eq!(disposition, Disposition::Dropped);
        assert_eq!(h.prober.call_count(), 0);
        assert_eq!(h.pipeline.queue().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_requeues_when_cancelled_mid_flight() {
        let h = harness(ScriptedProber::always(AZENV_BODY)).await;
        let user = h.db.add_user(&new_user("u", false, 3)).await.unwrap();
        h.router.add(user, vec![Judge::new("http://judge.example/", None).unwrap()]);
        let item = h.db.add_proxies_for_user(user, &[proxy("5.5.5.5")]).await.unwrap()[0].clone();
        h.pipeline.queue().enqueue(std::slice::from_ref(&item)).await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        // a cancelled worker exits without claiming
        h.pipeline.run_worker(ctx, Arc::new(AtomicBool::new(false))).await;
        assert!(h.store.score("proxies:due", &item.hash).await.is_some());

        let ctx = CancellationToken::new();
        let busy = Arc::new(AtomicBool::new(false));
        let worker = {
            let ctx = ctx.clone();
            let busy = busy.clone();
            let pipeline = &h.pipeline;
            async move { pipeline.run_worker(ctx, busy).await }
        };
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.cancel();
        };
        tokio::join!(worker, stopper);
        assert!(!busy.load(Ordering::SeqCst));
        assert!(h.store.score("proxies:due", &item.hash).await.is_some());
        assert!(h.prober.call_count() >= 1);
    }
}
