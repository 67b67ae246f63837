//! Lease-based leadership for singleton periodic jobs
//!
//! A lease is a store key holding a random per-session token with a TTL.
//! It is taken with SET NX, kept alive by a renewal loop that extends the TTL
//! only while the stored token is still ours, and given back with a
//! compare-and-delete. Losing a renewal cancels the lease's context at once.

use crate::error::{EngineError, EngineResult};
use crate::queue::store::WorkStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// A held lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

/// Phase of one leadership session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePhase {
    Unacquired,
    Held,
    Released,
    Expired,
}

pub struct LeaderElector {
    store: Arc<dyn WorkStore>,
    instance_id: String,
    /// Wait between failed acquisitions and between sessions
    retry_backoff: Duration,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn WorkStore>, instance_id: String, retry_backoff: Duration) -> Self {
        Self {
            store,
            instance_id,
            retry_backoff,
        }
    }

    /// Try once to take the lease.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> EngineResult<Option<Lease>> {
        let token = format!("{}:{}", self.instance_id, uuid::Uuid::new_v4());
        if self.store.set_nx_ex(key, &token, ttl).await? {
            Ok(Some(Lease {
                key: key.to_string(),
                token,
                ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Retry until the lease is taken or `ctx` ends.
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> EngineResult<Lease> {
        let mut attempt: u32 = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.try_acquire(key, ttl).await {
                Ok(Some(lease)) => {
                    debug!(key, attempts = attempt, "lease acquired");
                    return Ok(lease);
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "lease acquire failed"),
            }
            attempt = attempt.wrapping_add(1);
            tokio::select! {
                _ = ctx.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.retry_backoff) => {}
            }
        }
    }

    /// Extend the lease if we still own it.
    pub async fn renew(&self, lease: &Lease) -> EngineResult<bool> {
        self.store
            .compare_and_expire(&lease.key, &lease.token, lease.ttl)
            .await
    }

    /// Delete the lease if we still own it.
    pub async fn release(&self, lease: &Lease) -> EngineResult<bool> {
        self.store.compare_and_delete(&lease.key, &lease.token).await
    }

    /// Renew every `ttl / 3` until `lease_ctx` is cancelled. A renewal that
    /// is refused, fails or takes longer than `ttl / 3` counts as lost
    /// leadership: `lease_ctx` is cancelled and the error returned.
    async fn keep_alive(&self, lease: &Lease, lease_ctx: &CancellationToken) -> EngineResult<()> {
        let period = (lease.ttl / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = lease_ctx.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let lost = match tokio::time::timeout(period, self.renew(lease)).await {
                        Ok(Ok(true)) => continue,
                        Ok(Ok(false)) | Err(_) => EngineError::LeadershipLost(lease.key.clone()),
                        Ok(Err(e)) => e,
                    };
                    lease_ctx.cancel();
                    return Err(lost);
                }
            }
        }
    }

    /// Run `job` for as long as this instance holds the lease for `key`, and
    /// re-enter the election whenever the job ends or leadership is lost,
    /// until `ctx` is cancelled.
    ///
    /// `job` gets a context that is cancelled when leadership is lost; it
    /// must stop as soon as that happens.
    pub async fn run_with_leader<F, Fut>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
        mut job: F,
    ) -> EngineResult<()>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        loop {
            let lease = match self.acquire(ctx, key, ttl).await {
                Ok(lease) => lease,
                Err(EngineError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
            info!(key, instance_id = %self.instance_id, "acquired leadership");

            let lease_ctx = ctx.child_token();
            let phase = {
                let span = tracing::info_span!("leader", key = %key);
                let work = job(lease_ctx.clone()).instrument(span);
                tokio::pin!(work);
                let renewal = self.keep_alive(&lease, &lease_ctx);
                tokio::pin!(renewal);

                tokio::select! {
                    result = &mut work => {
                        if let Err(e) = result {
                            warn!(key, error = %e, "leader job failed");
                        }
                        LeasePhase::Held
                    }
                    renewed = &mut renewal => match renewed {
                        Ok(()) => LeasePhase::Held,
                        Err(e) => {
                            warn!(key, error = %e, "leadership lost; stopping job");
                            // let the job observe the cancellation and unwind
                            let _ = (&mut work).await;
                            LeasePhase::Expired
                        }
                    },
                }
            };
            lease_ctx.cancel();

            let final_phase = if phase == LeasePhase::Expired {
                LeasePhase::Expired
            } else {
                match self.release(&lease).await {
                    Ok(_) => LeasePhase::Released,
                    Err(e) => {
                        warn!(key, error = %e, "lease release failed; waiting for expiry");
                        LeasePhase::Expired
                    }
                }
            };
            info!(key, phase = ?final_phase, "leadership ended");

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.retry_backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryWorkStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn elector(store: Arc<MemoryWorkStore>, id: &str) -> LeaderElector {
        LeaderElector::new(store, id.to_string(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_and_release_checks_token() {
        let store = Arc::new(MemoryWorkStore::new());
        let a = elector(store.clone(), "a");
        let b = elector(store.clone(), "b");
        let ttl = Duration::from_secs(5);

        let lease = a.try_acquire("job", ttl).await.unwrap().unwrap();
        assert!(b.try_acquire("job", ttl).await.unwrap().is_none());

        let forged = Lease {
            token: "b:forged".to_string(),
            ..lease.clone()
        };
        assert!(!b.release(&forged).await.unwrap());
        assert!(a.renew(&lease).await.unwrap());
        assert!(a.release(&lease).await.unwrap());
        assert!(b.try_acquire("job", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_honours_cancellation() {
        let store = Arc::new(MemoryWorkStore::new());
        let a = elector(store.clone(), "a");
        let _held = a.try_acquire("job", Duration::from_secs(5)).await.unwrap();
        let ctx = CancellationToken::new();
        let child = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            child.cancel();
        });
        let err = a.acquire(&ctx, "job", Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_lost_lease_cancels_job() {
        let store = Arc::new(MemoryWorkStore::new());
        let a = Arc::new(elector(store.clone(), "a"));
        let ctx = CancellationToken::new();
        let observed_loss = Arc::new(AtomicUsize::new(0));

        let runner = {
            let a = a.clone();
            let ctx = ctx.clone();
            let observed_loss = observed_loss.clone();
            tokio::spawn(async move {
                a.run_with_leader(&ctx, "job", Duration::from_millis(90), |lease_ctx| {
                    let observed_loss = observed_loss.clone();
                    async move {
                        lease_ctx.cancelled().await;
                        observed_loss.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        // another instance steals the key, as after an expiry
        store
            .set_ex("job", "intruder", Duration::from_millis(150))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(observed_loss.load(Ordering::SeqCst) >= 1);
        // the holder never deletes a lease it no longer owns
        assert_eq!(store.get("job").await.unwrap().as_deref(), Some("intruder"));

        ctx.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_renewal_counts_as_lost() {
        let store = Arc::new(MemoryWorkStore::new());
        let a = elector(store.clone(), "a");
        let lease = a
            .try_acquire("job", Duration::from_millis(90))
            .await
            .unwrap()
            .unwrap();

        store.set_latency(Duration::from_millis(200));
        let lease_ctx = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let err = a.keep_alive(&lease, &lease_ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::LeadershipLost(ref key) if key == "job"));
        assert!(lease_ctx.is_cancelled());
        // gave up well before the lease could run out
        assert!(started.elapsed() < Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_refused_renewal_reports_lost_leadership() {
        let store = Arc::new(MemoryWorkStore::new());
        let a = elector(store.clone(), "a");
        let lease = a
            .try_acquire("job", Duration::from_millis(60))
            .await
            .unwrap()
            .unwrap();
        store
            .set_ex("job", "intruder", Duration::from_secs(5))
            .await
            .unwrap();
        let err = a
            .keep_alive(&lease, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LeadershipLost(_)));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_across_instances() {
        let store = Arc::new(MemoryWorkStore::new());
        let ctx = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            let e = elector(store.clone(), &format!("node-{i}"));
            let ctx = ctx.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                e.run_with_leader(&ctx, "singleton", Duration::from_millis(300), |lease_ctx| {
                    let running = running.clone();
                    let max_seen = max_seen.clone();
                    let runs = runs.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::select! {
                            _ = lease_ctx.cancelled() => {}
                            _ = tokio::time::sleep(Duration::from_millis(15)) => {}
                        }
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        ctx.cancel();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
