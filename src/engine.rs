//! Wiring of all engine components into one running instance

use crate::coalesce::{BatchConfig, Coalescer, FailureTracker, OwnershipVerifier};
use crate::config::Settings;
use crate::database::ProxyDatabase;
use crate::dispatcher::{Dispatcher, PoolStats};
use crate::leader::LeaderElector;
use crate::maintenance::Maintenance;
use crate::pipeline::Pipeline;
use crate::proxy::checker::{Checker, Prober};
use crate::proxy::judge::{Judge, JudgeRouter};
use crate::queue::{Heartbeat, QueueConfig, SchedulingQueue, WorkStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Load judges stored per user plus the configured defaults into `router`.
///
/// Invalid judges are logged and skipped. Returns the number of users routed.
pub async fn load_router(
    db: &ProxyDatabase,
    router: &JudgeRouter,
    settings: &Settings,
) -> crate::Result<usize> {
    let mut by_user: BTreeMap<i64, Vec<Judge>> = BTreeMap::new();
    for row in db.judges().await? {
        match Judge::new(&row.url, row.regex.as_deref()) {
            Ok(judge) => by_user.entry(row.user_id).or_default().push(judge),
            Err(e) => warn!(user_id = row.user_id, error = %e, "skipping stored judge"),
        }
    }
    for (user_id, judges) in by_user {
        router.replace_user(user_id, judges);
    }

    let defaults: Vec<Judge> = settings
        .default_judges
        .iter()
        .filter_map(|j| match Judge::new(&j.url, j.regex.as_deref()) {
            Ok(judge) => Some(judge),
            Err(e) => {
                warn!(error = %e, "skipping default judge");
                None
            }
        })
        .collect();
    if !defaults.is_empty() {
        let users = db.user_ids().await?;
        router.add_to_users(&users, defaults);
    }
    Ok(router.user_count())
}

/// Re-spread the queue whenever the configured interval changes.
async fn follow_interval(queue: Arc<SchedulingQueue>, mut settings: watch::Receiver<Settings>, ctx: CancellationToken) {
    let mut current = settings.borrow_and_update().checker.interval();
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = settings.borrow_and_update().checker.interval();
                if next == current {
                    continue;
                }
                match queue.reschedule(next).await {
                    Ok(updated) => info!(updated, interval_secs = next.as_secs(), "check interval changed"),
                    Err(e) => warn!(error = %e, "reschedule after interval change failed"),
                }
                current = next;
            }
        }
    }
}

/// A running engine
pub struct EngineHandle {
    pub instance_id: String,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    queue: Arc<SchedulingQueue>,
    router: Arc<JudgeRouter>,
    pool: PoolStats,
}

impl EngineHandle {
    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    pub fn router(&self) -> &Arc<JudgeRouter> {
        &self.router
    }

    pub fn pool(&self) -> &PoolStats {
        &self.pool
    }

    /// Token cancelled on shutdown, for tasks started alongside the engine
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Have `shutdown` wait for an extra task.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!(instance_id = %self.instance_id, "engine stopped");
    }
}

pub struct Engine;

impl Engine {
    pub async fn start(
        settings: watch::Receiver<Settings>,
        store: Arc<dyn WorkStore>,
        db: ProxyDatabase,
        prober: Arc<dyn Prober>,
    ) -> crate::Result<EngineHandle> {
        let current = settings.borrow().clone();
        let instance_id = uuid::Uuid::new_v4().to_string();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let queue_config = QueueConfig {
            poll_interval: Duration::from_millis(current.queue.poll_interval_ms.max(1)),
            page_size: current.queue.page_size.max(1),
            claim_ttl: Duration::from_secs(current.queue.claim_ttl_secs.max(1)),
            ..QueueConfig::default()
        };
        let queue = Arc::new(SchedulingQueue::new(
            Arc::clone(&store),
            current.checker.interval(),
            queue_config,
        ));

        let heartbeat = Heartbeat::new(
            Arc::clone(&store),
            &queue.config().heartbeat_prefix,
            &instance_id,
            Duration::from_secs(current.queue.heartbeat_interval_secs.max(1)),
            Duration::from_secs(current.queue.heartbeat_ttl_secs.max(1)),
        );
        // count this instance before the first sizing pass
        if let Err(e) = heartbeat.beat().await {
            warn!(error = %e, "initial heartbeat failed");
        }
        tasks.push(tokio::spawn(heartbeat.run(shutdown.clone())));

        let router = Arc::new(JudgeRouter::new());
        let routed = load_router(&db, &router, &current).await?;

        let batch = BatchConfig {
            flush_interval: Duration::from_millis(current.coalescer.flush_interval_ms.max(1)),
            max_batch: current.coalescer.max_batch.max(1),
            ..BatchConfig::default()
        };
        // the coalescers outlive the workers so in-flight submits still get answers
        let coalescer_shutdown = CancellationToken::new();
        let (failures, failures_task) =
            Coalescer::spawn(FailureTracker::new(db.clone()), batch, coalescer_shutdown.clone());
        let (ownership, ownership_task) =
            Coalescer::spawn(OwnershipVerifier::new(db.clone()), batch, coalescer_shutdown.clone());

        let checker = Arc::new(Checker::new(prober, current.checker.local_ip.clone()));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&queue),
            db.clone(),
            Arc::clone(&router),
            checker,
            failures,
            ownership,
            settings.clone(),
        ));

        let dispatcher = Dispatcher::new(pipeline, Arc::clone(&queue), settings.clone());
        let pool = dispatcher.stats();
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown.clone()));
        tasks.push(tokio::spawn(async move {
            if let Err(e) = dispatcher_task.await {
                warn!(error = %e, "dispatcher ended abnormally");
            }
            coalescer_shutdown.cancel();
            let _ = failures_task.await;
            let _ = ownership_task.await;
        }));

        tasks.push(tokio::spawn(follow_interval(
            Arc::clone(&queue),
            settings.clone(),
            shutdown.clone(),
        )));

        let elector = Arc::new(LeaderElector::new(
            Arc::clone(&store),
            instance_id.clone(),
            Duration::from_millis(current.leadership.retry_backoff_ms.max(1)),
        ));
        let maintenance = Arc::new(Maintenance::new(elector, db, Arc::clone(&queue), settings));
        {
            let maintenance = Arc::clone(&maintenance);
            let ctx = shutdown.clone();
            tasks.push(tokio::spawn(async move { maintenance.run_queue_repair(ctx).await }));
        }
        {
            let ctx = shutdown.clone();
            tasks.push(tokio::spawn(async move { maintenance.run_statistics_retention(ctx).await }));
        }

        info!(%instance_id, routed_users = routed, "engine started");
        Ok(EngineHandle {
            instance_id,
            shutdown,
            tasks,
            queue,
            router,
            pool,
        })
    }
}
