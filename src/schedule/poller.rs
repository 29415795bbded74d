use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::export::health::HealthMetrics;
use crate::granularity::{Granularity, SlotKey};

use super::ScheduleContext;

/// What an executor did with a claimed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    /// The rollup was computed and saved; the slot may be marked rolled.
    Persisted,
    /// Nothing was saved; the slot keeps its stamp.
    Skipped,
}

/// Computes and persists the rollup of one claimed slot.
///
/// Implemented outside the scheduler; the poller only reports the outcome
/// back to the [`ScheduleContext`].
pub trait SlotExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        key: SlotKey,
    ) -> impl std::future::Future<Output = Result<RollupOutcome>> + Send;
}

/// Executor that only logs the slot range it would roll up. It saves
/// nothing, so slots it sees stay active.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

impl SlotExecutor for DryRunExecutor {
    async fn execute(&self, key: SlotKey) -> Result<RollupOutcome> {
        let range = key
            .granularity()
            .derive_range(key.slot(), SystemClock.now_millis());
        debug!(slot = %key, range = %range, "dry-run rollup");
        Ok(RollupOutcome::Skipped)
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub scheduled: usize,
    pub rolled: usize,
    /// Rollups that finished after the slot received new data.
    pub superseded: usize,
    /// Slots the executor left untouched.
    pub skipped: usize,
    pub failed: usize,
}

/// Drives a [`SlotExecutor`] from the schedule.
///
/// Every poll schedules slots idle for longer than `rollup_delay`, then
/// claims and executes them. Since a parent is only scheduled once its
/// children are done, a poll repeats scan and drain so one pass can walk a
/// slot up every tier.
pub struct RollupPoller<E> {
    schedule: Arc<ScheduleContext>,
    executor: Arc<E>,
    rollup_delay: Duration,
    period: Duration,
    health: Option<Arc<HealthMetrics>>,
    run_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<E: SlotExecutor> RollupPoller<E> {
    pub fn new(
        schedule: Arc<ScheduleContext>,
        executor: E,
        rollup_delay: Duration,
        period: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            schedule,
            executor: Arc::new(executor),
            rollup_delay,
            period,
            health,
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Runs scan and drain rounds until nothing makes progress.
    pub async fn poll_once(&self) -> PollStats {
        let max_age = i64::try_from(self.rollup_delay.as_millis()).unwrap_or(i64::MAX);
        let mut stats = PollStats::default();

        // One round per tier is enough to walk a quiet slot to the top.
        for _ in 0..=Granularity::ROLLUP.len() {
            let queued = self.schedule.schedule_slots_older_than(max_age);
            stats.scheduled += queued;
            if let Some(health) = &self.health {
                health.slots_scheduled.inc_by(queued as f64);
            }

            let budget = self.schedule.scheduled_count();
            if budget == 0 {
                break;
            }

            let mut progressed = false;
            for _ in 0..budget {
                let Some(key) = self.schedule.get_next_scheduled() else {
                    break;
                };
                if let Some(health) = &self.health {
                    health.slots_claimed.inc();
                }
                progressed |= self.run_one(key, &mut stats).await;
            }

            self.observe_queue();
            if !progressed {
                break;
            }
        }

        stats
    }

    async fn run_one(&self, key: SlotKey, stats: &mut PollStats) -> bool {
        match self.executor.execute(key).await {
            Ok(RollupOutcome::Skipped) => {
                self.schedule.clear_from_running(&key);
                stats.skipped += 1;
                false
            }
            Ok(RollupOutcome::Persisted) => {
                if self.schedule.mark_rolled(&key) {
                    stats.rolled += 1;
                    if let Some(health) = &self.health {
                        health.slots_rolled.inc();
                    }
                } else {
                    stats.superseded += 1;
                    if let Some(health) = &self.health {
                        health.slots_superseded.inc();
                    }
                }
                self.schedule.clear_from_running(&key);
                true
            }
            Err(e) => {
                warn!(slot = %key, error = %e, "rollup failed, rescheduling");
                self.schedule.push_back_to_scheduled(key, false);
                stats.failed += 1;
                if let Some(health) = &self.health {
                    health.rollup_errors.inc();
                    health.slots_pushed_back.inc();
                }
                false
            }
        }
    }

    fn observe_queue(&self) {
        if let Some(health) = &self.health {
            health
                .scheduled_slots
                .set(self.schedule.scheduled_count() as f64);
            health.running_slots.set(self.schedule.running_count() as f64);
        }
    }

    /// Spawns the periodic poll loop.
    pub async fn start(self: &Arc<Self>, ctx: CancellationToken) {
        let poller = Arc::clone(self);

        let handle = tokio::spawn(async move {
            info!(
                rollup_delay = ?poller.rollup_delay,
                period = ?poller.period,
                "rollup poller started",
            );

            let mut ticker = tokio::time::interval(poller.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = poller.poll_once().await;
                        if stats.rolled > 0 || stats.failed > 0 || stats.skipped > 0 {
                            debug!(
                                rolled = stats.rolled,
                                superseded = stats.superseded,
                                skipped = stats.skipped,
                                failed = stats.failed,
                                "rollup poll finished",
                            );
                        }
                    }
                }
            }

            info!("rollup poller stopped");
        });

        *self.run_task.lock().await = Some(handle);
    }

    /// Waits for the poll loop to exit after cancellation.
    pub async fn wait_for_shutdown(&self) {
        if let Some(handle) = self.run_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "rollup poller panicked");
            }
        }
    }
}
