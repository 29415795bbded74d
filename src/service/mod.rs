use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseConnection;
use crate::granularity::{granularity_from_points_in_interval, Granularity, GranularityError};
use crate::ingest::{IngestPipeline, Sample};
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::schedule::poller::{DryRunExecutor, RollupPoller, SlotExecutor};
use crate::schedule::ScheduleContext;
use crate::store::{MemoryStateStore, ShardStateStore, StateStore};
use crate::sync::{ShardStatePuller, ShardStatePusher, ShardStateWorker};

/// Service orchestrates all components: schedule, store, sync workers,
/// ingest pipeline, rollup poller and the health server.
pub struct Service<E = DryRunExecutor> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    schedule: Arc<ScheduleContext>,
    all_shards: Vec<u32>,
    ingest: IngestPipeline,
    executor: Option<E>,
    connection: Option<ClickHouseConnection>,
    pusher: Option<ShardStateWorker<ShardStatePusher<StateStore>>>,
    puller: Option<ShardStateWorker<ShardStatePuller<StateStore>>>,
    poller: Option<Arc<RollupPoller<E>>>,
    cancel: CancellationToken,
}

impl Service<DryRunExecutor> {
    /// Creates a service whose poller, when enabled, only logs the rollups it
    /// would run and leaves every slot active.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_executor(cfg, DryRunExecutor, Arc::new(SystemClock))
    }
}

impl<E: SlotExecutor> Service<E> {
    /// Creates a service driving `executor`, with `clock` as the time source
    /// of scheduling decisions.
    pub fn with_executor(cfg: Config, executor: E, clock: Arc<dyn Clock>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let managed = cfg.shards.managed_shards()?;
        let all_shards = cfg.shards.all_shards()?;
        health.managed_shards.set(managed.len() as f64);

        let mut schedule = ScheduleContext::new(managed, clock);
        if let Some(policy) = cfg.schedule.reroll_policy() {
            schedule = schedule.with_reroll_policy(policy);
        }
        let schedule = Arc::new(schedule);
        let ingest = IngestPipeline::new(
            Arc::clone(&schedule),
            cfg.ingest.queue_size,
            cfg.ingest.workers,
            Some(Arc::clone(&health)),
        );

        Ok(Self {
            cfg,
            health,
            schedule,
            all_shards,
            ingest,
            executor: Some(executor),
            connection: None,
            pusher: None,
            puller: None,
            poller: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn schedule(&self) -> &Arc<ScheduleContext> {
        &self.schedule
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Hands a sample to the ingest pipeline. Returns false if rejected.
    pub fn submit(&self, sample: Sample) -> bool {
        self.ingest.submit(sample)
    }

    /// Picks the granularity for about `points` data points over `[from, to]`
    /// with the configured selection algorithm.
    pub fn granularity_for_points(
        &self,
        from: i64,
        to: i64,
        points: u32,
    ) -> Result<Granularity, GranularityError> {
        let assumed = i64::try_from(self.cfg.query.assumed_full_interval.as_millis())
            .unwrap_or(i64::MAX);
        granularity_from_points_in_interval(from, to, points, assumed, self.cfg.query.selection)
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond.
        let phase = Instant::now();
        self.health
            .start(Arc::clone(&self.schedule))
            .await
            .context("starting health metrics server")?;
        self.observe_phase("health", phase);

        // 1. Open the shared store.
        let phase = Instant::now();
        let store = Arc::new(self.open_store().await?);
        self.observe_phase("store", phase);

        // 2. Sync workers. The puller's first tick fires immediately, so peer
        //    state is loaded before the first rollup poll.
        if self.cfg.sync.enabled {
            let puller = ShardStateWorker::new(
                ShardStatePuller::new(
                    Arc::clone(&self.schedule),
                    Arc::clone(&store),
                    self.all_shards.clone(),
                    Some(Arc::clone(&self.health)),
                ),
                self.cfg.sync.pull_period,
            );
            puller.start(self.cancel.child_token()).await;

            let pusher = ShardStateWorker::new(
                ShardStatePusher::new(
                    Arc::clone(&self.schedule),
                    Arc::clone(&store),
                    self.all_shards.clone(),
                    Some(Arc::clone(&self.health)),
                ),
                self.cfg.sync.push_period,
            );
            pusher.start(self.cancel.child_token()).await;

            self.puller = Some(puller);
            self.pusher = Some(pusher);
            info!(
                store = store.name(),
                shards = self.all_shards.len(),
                "shard state sync started",
            );
        }

        // 3. Ingest workers.
        self.ingest.start(self.cancel.child_token()).await;

        // 4. Rollup poller.
        if self.cfg.schedule.enabled {
            if let Some(executor) = self.executor.take() {
                let poller = Arc::new(RollupPoller::new(
                    Arc::clone(&self.schedule),
                    executor,
                    self.cfg.schedule.rollup_delay,
                    self.cfg.schedule.poll_period,
                    Some(Arc::clone(&self.health)),
                ));
                poller.start(self.cancel.child_token()).await;
                self.poller = Some(poller);
            }
        }

        self.spawn_queue_monitor();

        info!(
            managed = self.schedule.managed_shards().len(),
            "service fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components. Queued samples are applied and local
    /// changes pushed once more before returning.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        self.ingest.wait_for_shutdown().await;

        if let Some(poller) = &self.poller {
            poller.wait_for_shutdown().await;
        }

        if let Some(puller) = &self.puller {
            puller.wait_for_shutdown().await;
        }

        if let Some(pusher) = &self.pusher {
            pusher.wait_for_shutdown().await;
            let stats = pusher.operation().perform_operation().await;
            info!(records = stats.records, errors = stats.errors, "final shard state push");
        }

        if let Some(connection) = &mut self.connection {
            if let Err(e) = connection.stop().await {
                error!(error = %e, "error stopping ClickHouse connection");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    async fn open_store(&mut self) -> Result<StateStore> {
        match self.cfg.store.backend {
            StoreBackend::Memory => {
                info!("using in-memory shard state store");
                Ok(StateStore::Memory(MemoryStateStore::new()))
            }
            StoreBackend::ClickHouse => {
                let ch_cfg = self.cfg.store.clickhouse.clone();
                let mut connection = ClickHouseConnection::new(ch_cfg.clone());
                connection
                    .start()
                    .await
                    .context("starting ClickHouse connection")?;

                if ch_cfg.migrations.enabled {
                    let pool = connection
                        .pool()
                        .context("ClickHouse pool missing after start")?
                        .clone();
                    let migrator = ClickHouseMigrator::new(pool, ch_cfg.database, ch_cfg.table);
                    migrator
                        .up()
                        .await
                        .context("applying ClickHouse migrations")?;
                }

                let store = connection.state_store(Some(Arc::clone(&self.health)))?;
                self.connection = Some(connection);
                Ok(StateStore::ClickHouse(store))
            }
        }
    }

    fn observe_phase(&self, phase: &str, started: Instant) {
        self.health
            .start_duration
            .with_label_values(&[phase])
            .set(started.elapsed().as_secs_f64());
    }

    /// Periodically publishes queue sizes.
    fn spawn_queue_monitor(&self) {
        let cancel = self.cancel.child_token();
        let schedule = Arc::clone(&self.schedule);
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        health.scheduled_slots.set(schedule.scheduled_count() as f64);
                        health.running_slots.set(schedule.running_count() as f64);
                        health.managed_shards.set(schedule.managed_shards().len() as f64);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ShardsConfig;
    use crate::granularity::SelectionAlgorithm;

    fn test_config() -> Config {
        Config {
            shards: ShardsConfig {
                managed: "0,1,2".to_string(),
                all: "ALL".to_string(),
            },
            health: crate::config::HealthConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_new_service() {
        let service = Service::new(test_config()).expect("service");
        assert_eq!(service.schedule().managed_shards(), vec![0, 1, 2]);
        assert_eq!(service.all_shards.len(), 128);
    }

    #[test]
    fn test_granularity_for_points() {
        let service = Service::new(test_config()).expect("service");
        let day = 86_400_000;
        assert_eq!(
            service.granularity_for_points(0, day, 1440),
            Ok(Granularity::Full)
        );
        assert_eq!(
            service.granularity_for_points(0, day, 288),
            Ok(Granularity::Min5)
        );
        assert_eq!(
            service.granularity_for_points(0, day, 24),
            Ok(Granularity::Min60)
        );
        assert!(service.granularity_for_points(day, 0, 10).is_err());
    }

    #[test]
    fn test_granularity_for_points_uses_configured_selection() {
        let mut cfg = test_config();
        let day = 86_400_000;
        assert_eq!(
            Service::new(test_config())
                .expect("service")
                .granularity_for_points(0, day, 800),
            Ok(Granularity::Full)
        );

        cfg.query.selection = SelectionAlgorithm::Linear;
        let service = Service::new(cfg).expect("service");
        assert_eq!(service.granularity_for_points(0, day, 800), Ok(Granularity::Min5));
    }

    #[tokio::test]
    async fn test_start_ingest_stop() {
        let clock = Arc::new(ManualClock::new(0));
        let mut service =
            Service::with_executor(test_config(), DryRunExecutor, clock.clone()).expect("service");
        service.start().await.expect("start");

        let sample = Sample::new("tenant.requests", 1_000, 3i64);
        let shard = sample.shard();
        assert!(service.submit(sample));

        service.stop().await.expect("stop");
        assert_eq!(service.schedule().shard_state().stamp_count(shard), 5);
        // The final push leaves nothing dirty.
        assert!(service.schedule().shard_state().dirty_stamps(shard).is_empty());
    }
}
