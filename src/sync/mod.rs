pub mod record;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::export::health::HealthMetrics;
use crate::schedule::ScheduleContext;
use crate::store::ShardStateStore;

use self::record::SlotStateRecord;

/// Outcome of one push or pull cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Shards processed without error.
    pub shards: usize,
    /// Records written (push) or merged into local state (pull).
    pub records: usize,
    /// Shards that failed and will be retried next cycle.
    pub errors: usize,
}

/// One synchronization direction, driven periodically by [`ShardStateWorker`].
pub trait SyncOperation: Send + Sync + 'static {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    fn perform_operation(&self) -> impl std::future::Future<Output = SyncStats> + Send;
}

fn observe_cycle(health: Option<&HealthMetrics>, operation: &str, stats: SyncStats, started: Instant) {
    let Some(health) = health else {
        return;
    };
    health.sync_cycles.with_label_values(&[operation]).inc();
    health
        .sync_records
        .with_label_values(&[operation])
        .inc_by(stats.records as f64);
    if stats.errors > 0 {
        health
            .sync_errors
            .with_label_values(&[operation])
            .inc_by(stats.errors as f64);
    }
    health
        .sync_cycle_duration
        .with_label_values(&[operation])
        .observe(started.elapsed().as_secs_f64());
}

/// Writes locally changed stamps of every tracked shard to the shared store.
pub struct ShardStatePusher<S> {
    schedule: Arc<ScheduleContext>,
    store: Arc<S>,
    shards: Vec<u32>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: ShardStateStore> ShardStatePusher<S> {
    pub fn new(
        schedule: Arc<ScheduleContext>,
        store: Arc<S>,
        shards: Vec<u32>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            schedule,
            store,
            shards,
            health,
        }
    }

    /// Pushes the dirty stamps of each shard. Stamps are marked clean only
    /// once written and only if they did not change in the meantime; a failed
    /// shard keeps its dirty stamps for the next cycle.
    pub async fn perform_operation(&self) -> SyncStats {
        let started = Instant::now();
        let mut stats = SyncStats::default();
        let state = self.schedule.shard_state();

        for &shard in &self.shards {
            let dirty = state.dirty_stamps(shard);
            if dirty.is_empty() {
                stats.shards += 1;
                continue;
            }

            let records: Vec<SlotStateRecord> = dirty.iter().map(SlotStateRecord::from).collect();
            match self.store.put_slot_states(shard, &records).await {
                Ok(()) => {
                    let cleaned = state.mark_clean(shard, &dirty);
                    debug!(shard, pushed = records.len(), cleaned, "pushed slot states");
                    stats.shards += 1;
                    stats.records += records.len();
                }
                Err(e) => {
                    error!(
                        shard,
                        store = self.store.name(),
                        error = %e,
                        "pushing slot states failed",
                    );
                    stats.errors += 1;
                }
            }
        }

        observe_cycle(self.health.as_deref(), "push", stats, started);
        stats
    }
}

impl<S: ShardStateStore + 'static> SyncOperation for ShardStatePusher<S> {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn perform_operation(&self) -> SyncStats {
        ShardStatePusher::perform_operation(self).await
    }
}

/// Merges shared store state of every tracked shard into local state.
pub struct ShardStatePuller<S> {
    schedule: Arc<ScheduleContext>,
    store: Arc<S>,
    shards: Vec<u32>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: ShardStateStore> ShardStatePuller<S> {
    pub fn new(
        schedule: Arc<ScheduleContext>,
        store: Arc<S>,
        shards: Vec<u32>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            schedule,
            store,
            shards,
            health,
        }
    }

    /// Pulls each shard and applies every record that is unknown locally or
    /// strictly newer than the local stamp. Applying the same records twice
    /// changes nothing.
    pub async fn perform_operation(&self) -> SyncStats {
        let started = Instant::now();
        let mut stats = SyncStats::default();
        let state = self.schedule.shard_state();

        for &shard in &self.shards {
            let records = match self.store.get_slot_states(shard).await {
                Ok(records) => records,
                Err(e) => {
                    error!(
                        shard,
                        store = self.store.name(),
                        error = %e,
                        "pulling slot states failed",
                    );
                    stats.errors += 1;
                    continue;
                }
            };

            let mut applied = 0;
            for record in &records {
                if state.apply_remote(shard, record.granularity, record.slot, record.stamp()) {
                    applied += 1;
                }
            }
            if applied > 0 {
                debug!(shard, read = records.len(), applied, "pulled slot states");
            }
            stats.shards += 1;
            stats.records += applied;
        }

        observe_cycle(self.health.as_deref(), "pull", stats, started);
        stats
    }
}

impl<S: ShardStateStore + 'static> SyncOperation for ShardStatePuller<S> {
    fn name(&self) -> &'static str {
        "pull"
    }

    async fn perform_operation(&self) -> SyncStats {
        ShardStatePuller::perform_operation(self).await
    }
}

/// Runs a [`SyncOperation`] every `period` until cancelled.
///
/// `force` wakes the loop for an immediate cycle; an inactive worker keeps
/// ticking but skips its cycles.
pub struct ShardStateWorker<O> {
    operation: Arc<O>,
    period: Duration,
    active: Arc<AtomicBool>,
    force: Arc<Notify>,
    run_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<O: SyncOperation> ShardStateWorker<O> {
    pub fn new(operation: O, period: Duration) -> Self {
        Self {
            operation: Arc::new(operation),
            period,
            active: Arc::new(AtomicBool::new(true)),
            force: Arc::new(Notify::new()),
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Requests a cycle now instead of waiting for the next tick.
    pub fn force(&self) {
        self.force.notify_one();
    }

    /// Spawns the periodic loop.
    pub async fn start(&self, ctx: CancellationToken) {
        let operation = Arc::clone(&self.operation);
        let active = Arc::clone(&self.active);
        let force = Arc::clone(&self.force);
        let period = self.period;

        let handle = tokio::spawn(async move {
            info!(operation = operation.name(), ?period, "shard state worker started");

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = force.notified() => {}
                }

                if !active.load(Ordering::Relaxed) {
                    continue;
                }

                operation.perform_operation().await;
            }

            info!(operation = operation.name(), "shard state worker stopped");
        });

        *self.run_task.lock().await = Some(handle);
    }

    /// Waits for the loop to exit after cancellation.
    pub async fn wait_for_shutdown(&self) {
        if let Some(handle) = self.run_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "shard state worker panicked");
            }
        }
    }
}
