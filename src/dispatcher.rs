//! Adaptive worker pool
//!
//! The dispatcher recomputes a target worker count from live settings and
//! queue depth, then converges towards it one tick at a time: missing
//! workers are spawned, and at most one idle surplus worker is stopped per
//! tick. Busy workers are never interrupted to shrink the pool.

use crate::config::{DispatcherSettings, Settings};
use crate::queue::SchedulingQueue;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Body of one worker task
#[async_trait]
pub trait WorkLoop: Send + Sync + 'static {
    async fn run(&self, ctx: CancellationToken, busy: Arc<AtomicBool>);
}

#[async_trait]
impl WorkLoop for crate::pipeline::Pipeline {
    async fn run(&self, ctx: CancellationToken, busy: Arc<AtomicBool>) {
        self.run_worker(ctx, busy).await
    }
}

/// Load figures the dynamic target is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub queued: u64,
    pub instances: u64,
    pub protocols: usize,
    pub retries: u32,
    pub timeout_ms: u64,
    pub period: Duration,
}

fn div_ceil(a: u64, b: u64) -> u64 {
    let b = b.max(1);
    a / b + u64::from(a % b != 0)
}

/// Worker count for the given settings and load.
///
/// Dynamic mode: instances and period are clamped to at least 1 before any
/// division, then
/// `ceil(ceil(queued / instances) * protocols * (retries + 1) * timeout_ms / period_ms)`
/// clamped to `[min_threads, max_threads]`. Fixed mode returns `threads`.
pub fn compute_target(settings: &DispatcherSettings, load: &LoadSnapshot) -> usize {
    if !settings.dynamic {
        return settings.threads;
    }
    let instances = load.instances.max(1);
    let period_ms = (load.period.as_millis().min(u128::from(u64::MAX)) as u64).max(1);
    let per_instance = div_ceil(load.queued, instances);
    let work_ms = per_instance
        .saturating_mul(load.protocols.max(1) as u64)
        .saturating_mul(u64::from(load.retries).saturating_add(1))
        .saturating_mul(load.timeout_ms);
    let target = usize::try_from(div_ceil(work_ms, period_ms)).unwrap_or(usize::MAX);

    let min = settings.min_threads;
    let max = settings.max_threads.max(min);
    target.clamp(min, max)
}

struct WorkerSlot {
    id: u64,
    ctx: CancellationToken,
    busy: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Shared view of the pool size
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    live: Arc<AtomicUsize>,
    target: Arc<AtomicUsize>,
}

impl PoolStats {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }
}

pub struct Dispatcher<W: WorkLoop> {
    body: Arc<W>,
    queue: Arc<SchedulingQueue>,
    settings: watch::Receiver<Settings>,
    workers: Vec<WorkerSlot>,
    next_id: u64,
    stats: PoolStats,
}

impl<W: WorkLoop> Dispatcher<W> {
    pub fn new(body: Arc<W>, queue: Arc<SchedulingQueue>, settings: watch::Receiver<Settings>) -> Self {
        Self {
            body,
            queue,
            settings,
            workers: Vec::new(),
            next_id: 0,
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    async fn load_snapshot(&self, settings: &Settings) -> Option<LoadSnapshot> {
        let queued = match self.queue.count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "queue depth unavailable; keeping current target");
                return None;
            }
        };
        let instances = match self.queue.active_instance_count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "instance count unavailable; assuming one");
                1
            }
        };
        Some(LoadSnapshot {
            queued,
            instances,
            protocols: settings.checker.protocols.len(),
            retries: settings.checker.retries,
            timeout_ms: settings.checker.timeout_ms,
            period: settings.checker.interval(),
        })
    }

    async fn refresh_target(&mut self) {
        let settings = self.settings.borrow_and_update().clone();
        let target = if settings.dispatcher.dynamic {
            match self.load_snapshot(&settings).await {
                Some(load) => compute_target(&settings.dispatcher, &load),
                None => return,
            }
        } else {
            compute_target(&settings.dispatcher, &LoadSnapshot {
                queued: 0,
                instances: 1,
                protocols: 0,
                retries: 0,
                timeout_ms: 0,
                period: Duration::from_secs(1),
            })
        };
        let previous = self.stats.target.swap(target, Ordering::Relaxed);
        if previous != target {
            info!(previous, target, dynamic = settings.dispatcher.dynamic, "worker target changed");
        }
    }

    fn spawn_worker(&mut self, parent: &CancellationToken) {
        let ctx = parent.child_token();
        let busy = Arc::new(AtomicBool::new(false));
        let body = Arc::clone(&self.body);
        let id = self.next_id;
        self.next_id += 1;
        let handle = {
            let ctx = ctx.clone();
            let busy = busy.clone();
            tokio::spawn(async move { body.run(ctx, busy).await })
        };
        self.workers.push(WorkerSlot { id, ctx, busy, handle });
    }

    /// Drop workers whose task already ended, logging panics.
    async fn reap(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].handle.is_finished() {
                let slot = self.workers.swap_remove(i);
                if let Err(e) = slot.handle.await {
                    if e.is_panic() {
                        error!(worker = slot.id, "worker panicked; it will be replaced");
                    }
                }
            } else {
                i += 1;
            }
        }
    }

    /// Stop one idle worker and wait for it to unwind. Returns false when
    /// every worker is busy; a later tick tries again.
    async fn stop_one(&mut self) -> bool {
        let Some(index) = self
            .workers
            .iter()
            .position(|w| !w.busy.load(Ordering::SeqCst))
        else {
            return false;
        };
        let slot = self.workers.swap_remove(index);
        slot.ctx.cancel();
        if let Err(e) = slot.handle.await {
            if e.is_panic() {
                error!(worker = slot.id, "worker panicked while stopping");
            }
        }
        debug!(worker = slot.id, "worker stopped");
        true
    }

    /// One convergence step towards the current target.
    async fn adjust(&mut self, ctx: &CancellationToken) {
        self.reap().await;
        let target = self.stats.target();
        let live = self.workers.len();
        if live < target {
            for _ in live..target {
                self.spawn_worker(ctx);
            }
            debug!(spawned = target - live, live = self.workers.len(), "workers spawned");
        } else if live > target && !self.stop_one().await {
            debug!(live, target, "no idle worker to stop");
        }
        self.stats.live.store(self.workers.len(), Ordering::Relaxed);
    }

    async fn shutdown(&mut self) {
        for slot in &self.workers {
            slot.ctx.cancel();
        }
        for slot in self.workers.drain(..) {
            if let Err(e) = slot.handle.await {
                if e.is_panic() {
                    error!(worker = slot.id, "worker panicked during shutdown");
                }
            }
        }
        self.stats.live.store(0, Ordering::Relaxed);
    }

    fn periods(&self) -> (Duration, Duration) {
        let s = self.settings.borrow();
        (
            Duration::from_millis(s.dispatcher.adjust_tick_ms.max(1)),
            Duration::from_secs(s.dispatcher.refresh_secs.max(1)),
        )
    }

    /// Supervise the pool until `ctx` is cancelled, then stop every worker.
    pub async fn run(mut self, ctx: CancellationToken) {
        let (mut adjust_period, mut refresh_period) = self.periods();
        let mut adjust = ticker(adjust_period);
        let mut refresh = ticker(refresh_period);
        let mut watching = true;

        info!("dispatcher started");
        self.refresh_target().await;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                changed = self.settings.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    self.refresh_target().await;
                    let (a, r) = self.periods();
                    if a != adjust_period {
                        adjust_period = a;
                        adjust = ticker(a);
                    }
                    if r != refresh_period {
                        refresh_period = r;
                        refresh = ticker(r);
                    }
                }
                _ = refresh.tick() => self.refresh_target().await,
                _ = adjust.tick() => self.adjust(&ctx).await,
            }
        }
        self.shutdown().await;
        info!("dispatcher stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryWorkStore, QueueConfig};

    fn dynamic(min: usize, max: usize) -> DispatcherSettings {
        DispatcherSettings {
            dynamic: true,
            min_threads: min,
            max_threads: max,
            ..DispatcherSettings::default()
        }
    }

    fn load(queued: u64, instances: u64, period_secs: u64) -> LoadSnapshot {
        LoadSnapshot {
            queued,
            instances,
            protocols: 2,
            retries: 1,
            timeout_ms: 5_000,
            period: Duration::from_secs(period_secs),
        }
    }

    #[test]
    fn test_target_formula() {
        // ceil(1000 / 3) = 334; 334 * 2 * 2 * 5000 / 60000 = 111.33 -> 112
        assert_eq!(compute_target(&dynamic(1, 10_000), &load(1_000, 3, 60)), 112);
        assert_eq!(compute_target(&dynamic(1, 10_000), &load(0, 3, 60)), 1);
        assert_eq!(compute_target(&dynamic(1, 50), &load(1_000, 3, 60)), 50);
    }

    #[test]
    fn test_degenerate_inputs_are_clamped() {
        let zero_instances = compute_target(&dynamic(0, usize::MAX), &load(10, 0, 60));
        assert_eq!(zero_instances, compute_target(&dynamic(0, usize::MAX), &load(10, 1, 60)));
        let zero_period = compute_target(&dynamic(0, usize::MAX), &load(1, 1, 0));
        assert_eq!(zero_period, 20_000);
        let huge = LoadSnapshot {
            queued: u64::MAX,
            timeout_ms: u64::MAX,
            ..load(0, 1, 1)
        };
        assert_eq!(compute_target(&dynamic(1, 2_000), &huge), 2_000);
    }

    #[test]
    fn test_fixed_mode_ignores_load() {
        let settings = DispatcherSettings {
            dynamic: false,
            threads: 7,
            ..DispatcherSettings::default()
        };
        assert_eq!(compute_target(&settings, &load(1_000_000, 1, 1)), 7);
    }

    /// Waits for cancellation, counting running instances
    struct Idle {
        running: AtomicUsize,
    }

    #[async_trait]
    impl WorkLoop for Idle {
        async fn run(&self, ctx: CancellationToken, _busy: Arc<AtomicBool>) {
            self.running.fetch_add(1, Ordering::SeqCst);
            ctx.cancelled().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn fixed(threads: usize) -> Settings {
        let mut settings = Settings::default();
        settings.dispatcher.dynamic = false;
        settings.dispatcher.threads = threads;
        settings.dispatcher.adjust_tick_ms = 10;
        settings
    }

    #[tokio::test]
    async fn test_pool_converges_one_stop_per_tick() {
        let store = Arc::new(MemoryWorkStore::new());
        let queue = Arc::new(SchedulingQueue::new(store, Duration::from_secs(60), QueueConfig::default()));
        let (tx, rx) = watch::channel(fixed(6));
        let body = Arc::new(Idle {
            running: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(body.clone(), queue, rx);
        let stats = dispatcher.stats();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.live(), 6);
        assert_eq!(body.running.load(Ordering::SeqCst), 6);

        tx.send(fixed(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        let midway = stats.live();
        assert!(midway < 6 && midway >= 2, "stopped gradually, got {midway}");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.live(), 2);
        assert_eq!(body.running.load(Ordering::SeqCst), 2);

        ctx.cancel();
        task.await.unwrap();
        assert_eq!(body.running.load(Ordering::SeqCst), 0);
        assert_eq!(stats.live(), 0);
    }

    /// Marks itself busy and holds on until cancelled
    struct AlwaysBusy {
        running: AtomicUsize,
    }

    #[async_trait]
    impl WorkLoop for AlwaysBusy {
        async fn run(&self, ctx: CancellationToken, busy: Arc<AtomicBool>) {
            busy.store(true, Ordering::SeqCst);
            self.running.fetch_add(1, Ordering::SeqCst);
            ctx.cancelled().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_busy_workers_survive_a_lower_target() {
        let store = Arc::new(MemoryWorkStore::new());
        let queue = Arc::new(SchedulingQueue::new(store, Duration::from_secs(60), QueueConfig::default()));
        let (tx, rx) = watch::channel(fixed(3));
        let body = Arc::new(AlwaysBusy {
            running: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(body.clone(), queue, rx);
        let stats = dispatcher.stats();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(body.running.load(Ordering::SeqCst), 3);

        tx.send(fixed(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(stats.target(), 1);
        assert_eq!(stats.live(), 3);
        assert_eq!(body.running.load(Ordering::SeqCst), 3);

        ctx.cancel();
        task.await.unwrap();
        assert_eq!(body.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tick_period_reloads_with_settings() {
        let store = Arc::new(MemoryWorkStore::new());
        let queue = Arc::new(SchedulingQueue::new(store, Duration::from_secs(60), QueueConfig::default()));
        let mut slow = fixed(1);
        slow.dispatcher.adjust_tick_ms = 60_000;
        let (tx, rx) = watch::channel(slow);
        let body = Arc::new(Idle {
            running: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(body.clone(), queue, rx);
        let stats = dispatcher.stats();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(stats.live(), 1);

        // only a reloaded tick period can bring the pool to 3 in time
        tx.send(fixed(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(stats.live(), 3);

        ctx.cancel();
        task.await.unwrap();
    }

    /// Panics on its first run only
    struct PanicsOnce {
        started: AtomicUsize,
    }

    #[async_trait]
    impl WorkLoop for PanicsOnce {
        async fn run(&self, ctx: CancellationToken, _busy: Arc<AtomicBool>) {
            if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("worker blew up");
            }
            ctx.cancelled().await;
        }
    }

    #[tokio::test]
    async fn test_panicked_worker_is_replaced() {
        let store = Arc::new(MemoryWorkStore::new());
        let queue = Arc::new(SchedulingQueue::new(store, Duration::from_secs(60), QueueConfig::default()));
        let (_tx, rx) = watch::channel(fixed(1));
        let body = Arc::new(PanicsOnce {
            started: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(body.clone(), queue, rx);
        let stats = dispatcher.stats();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(body.started.load(Ordering::SeqCst) >= 2);
        assert_eq!(stats.live(), 1);

        ctx.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dynamic_target_follows_queue_depth() {
        let store = Arc::new(MemoryWorkStore::new());
        let queue = Arc::new(SchedulingQueue::new(store, Duration::from_secs(60), QueueConfig::default()));
        let items: Vec<_> = (0..30)
            .map(|i| crate::proxy::models::WorkItem::new(i, format!("10.1.0.{i}"), 80, None))
            .collect();
        queue.enqueue(&items).await.unwrap();

        let mut settings = Settings::default();
        settings.dispatcher.min_threads = 0;
        settings.checker.protocols = vec![crate::proxy::models::Protocol::Http];
        settings.checker.retries = 0;
        settings.checker.timeout_ms = 10_000;
        settings.checker.interval_minutes = 0;
        settings.checker.interval_seconds = 60;
        let (_tx, rx) = watch::channel(settings);
        let body = Arc::new(Idle {
            running: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new(body, queue, rx);
        dispatcher.refresh_target().await;
        // 30 * 1 * 1 * 10s / 60s = 5
        assert_eq!(dispatcher.stats().target(), 5);
    }
}
