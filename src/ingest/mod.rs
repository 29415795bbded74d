use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::granularity::shard::compute_shard;
use crate::rollup::Numeric;
use crate::schedule::ScheduleContext;

/// Samples drained per wakeup before yielding.
const BATCH_SIZE: usize = 256;

/// One ingested data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Stable identifier of the metric (tenant and metric name).
    pub locator: String,
    /// Collection time in epoch milliseconds.
    pub collection_time: i64,
    pub value: Numeric,
}

impl Sample {
    pub fn new(locator: impl Into<String>, collection_time: i64, value: impl Into<Numeric>) -> Self {
        Self {
            locator: locator.into(),
            collection_time,
            value: value.into(),
        }
    }

    pub fn shard(&self) -> u32 {
        compute_shard(&self.locator)
    }
}

/// Bounded ingestion front of the scheduler.
///
/// `submit` never blocks: when the target queue is full the sample is
/// rejected and counted. Each worker owns one queue and samples are routed by
/// shard, so updates of one shard are applied in submission order. Sample
/// values are not stored here; only their slots are marked for rollup.
pub struct IngestPipeline {
    schedule: Arc<ScheduleContext>,
    health: Option<Arc<HealthMetrics>>,
    senders: Vec<mpsc::Sender<(u32, Sample)>>,
    receivers: Vec<mpsc::Receiver<(u32, Sample)>>,
    run_tasks: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl IngestPipeline {
    /// Creates a pipeline with `workers` queues sharing `queue_size` slots.
    pub fn new(
        schedule: Arc<ScheduleContext>,
        queue_size: usize,
        workers: usize,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let workers = workers.max(1);
        let per_worker = (queue_size / workers).max(1);
        let (senders, receivers) = (0..workers).map(|_| mpsc::channel(per_worker)).unzip();

        Self {
            schedule,
            health,
            senders,
            receivers,
            run_tasks: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    /// Enqueues a sample. Returns false if it was rejected.
    pub fn submit(&self, sample: Sample) -> bool {
        let shard = sample.shard();
        let worker = shard as usize % self.senders.len();

        if self.senders[worker].try_send((shard, sample)).is_err() {
            warn!(shard, "ingest queue full, dropping sample");
            if let Some(health) = &self.health {
                health.ingest_rejected.inc();
            }
            return false;
        }

        if let Some(health) = &self.health {
            health.ingest_accepted.inc();
        }
        true
    }

    /// Samples waiting across all queues.
    pub fn queued(&self) -> usize {
        self.senders
            .iter()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .sum()
    }

    /// Spawns one worker per queue. Queued samples are applied before a
    /// worker exits on cancellation.
    pub async fn start(&mut self, ctx: CancellationToken) {
        assert!(!self.receivers.is_empty(), "start called more than once");
        let receivers = std::mem::take(&mut self.receivers);
        let mut tasks = self.run_tasks.lock().await;

        for (worker, mut rx) in receivers.into_iter().enumerate() {
            let schedule = Arc::clone(&self.schedule);
            let health = self.health.clone();
            let ctx = ctx.clone();

            tasks.push(tokio::spawn(async move {
                debug!(worker, "ingest worker started");

                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            let mut drained = 0usize;
                            while let Ok((shard, sample)) = rx.try_recv() {
                                apply(&schedule, health.as_deref(), shard, &sample);
                                drained += 1;
                            }
                            if drained > 0 {
                                debug!(worker, drained, "applied queued samples on shutdown");
                            }
                            break;
                        }

                        Some((shard, sample)) = rx.recv() => {
                            apply(&schedule, health.as_deref(), shard, &sample);

                            // Drain up to BATCH_SIZE-1 more samples without blocking.
                            for _ in 0..BATCH_SIZE - 1 {
                                match rx.try_recv() {
                                    Ok((shard, sample)) => {
                                        apply(&schedule, health.as_deref(), shard, &sample);
                                    }
                                    Err(_) => break,
                                }
                            }

                            if let Some(health) = &health {
                                health.ingest_queue_length.set(rx.len() as f64);
                            }
                        }
                    }
                }

                debug!(worker, "ingest worker stopped");
            }));
        }

        info!(workers = tasks.len(), "ingest pipeline started");
    }

    /// Waits for every worker to exit after cancellation.
    pub async fn wait_for_shutdown(&self) {
        let tasks = std::mem::take(&mut *self.run_tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "ingest worker panicked");
            }
        }
    }
}

fn apply(schedule: &ScheduleContext, health: Option<&HealthMetrics>, shard: u32, sample: &Sample) {
    schedule.update(sample.collection_time, shard);
    if let Some(health) = health {
        health.slot_updates.inc();
    }
}
