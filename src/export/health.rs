use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::granularity::shard::NUMBER_OF_SHARDS;
use crate::granularity::Granularity;
use crate::schedule::ScheduleContext;
use crate::sync::record::SlotStateRecord;

/// Prometheus metrics for scheduler health and observability.
///
/// All metrics use the "rollwheel" namespace. Organized into groups:
/// - Schedule: slot lifecycle counters and queue gauges
/// - Sync: push/pull cycles against the shared store
/// - Ingest: bounded queue admission
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Schedule ===
    /// Slot updates applied from ingested samples.
    pub slot_updates: Counter,
    /// Slots queued for rollup.
    pub slots_scheduled: Counter,
    /// Slots claimed by the executor.
    pub slots_claimed: Counter,
    /// Slots marked rolled.
    pub slots_rolled: Counter,
    /// Rollups that completed after the slot received new data.
    pub slots_superseded: Counter,
    /// Slots re-queued after a failed rollup.
    pub slots_pushed_back: Counter,
    /// Failed rollup executions.
    pub rollup_errors: Counter,
    /// Slots currently scheduled.
    pub scheduled_slots: Gauge,
    /// Slots currently claimed.
    pub running_slots: Gauge,
    /// Shards this instance schedules rollups for.
    pub managed_shards: Gauge,

    // === Sync ===
    /// Push/pull cycles by operation.
    pub sync_cycles: CounterVec,
    /// Records written or merged by operation.
    pub sync_records: CounterVec,
    /// Shards that failed a cycle, by operation.
    pub sync_errors: CounterVec,
    /// Push/pull cycle duration (1ms-10s buckets).
    pub sync_cycle_duration: HistogramVec,
    /// Store errors by store and operation.
    pub store_errors: CounterVec,

    // === Ingest ===
    /// Samples accepted into the ingest queue.
    pub ingest_accepted: Counter,
    /// Samples rejected because the ingest queue was full.
    pub ingest_rejected: Counter,
    /// Current ingest queue length.
    pub ingest_queue_length: Gauge,

    // === Lifecycle ===
    /// Service startup duration by phase.
    pub start_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Schedule ===
        let slot_updates = Counter::with_opts(
            Opts::new(
                "slot_updates_total",
                "Total slot updates applied from ingested samples.",
            )
            .namespace("rollwheel"),
        )?;
        let slots_scheduled = Counter::with_opts(
            Opts::new("slots_scheduled_total", "Total slots queued for rollup.")
                .namespace("rollwheel"),
        )?;
        let slots_claimed = Counter::with_opts(
            Opts::new("slots_claimed_total", "Total slots claimed for rollup.")
                .namespace("rollwheel"),
        )?;
        let slots_rolled = Counter::with_opts(
            Opts::new("slots_rolled_total", "Total slots marked rolled.").namespace("rollwheel"),
        )?;
        let slots_superseded = Counter::with_opts(
            Opts::new(
                "slots_superseded_total",
                "Total rollups that completed after the slot received new data.",
            )
            .namespace("rollwheel"),
        )?;
        let slots_pushed_back = Counter::with_opts(
            Opts::new(
                "slots_pushed_back_total",
                "Total slots re-queued after a failed rollup.",
            )
            .namespace("rollwheel"),
        )?;
        let rollup_errors = Counter::with_opts(
            Opts::new("rollup_errors_total", "Total failed rollup executions.")
                .namespace("rollwheel"),
        )?;
        let scheduled_slots = Gauge::with_opts(
            Opts::new("scheduled_slots", "Number of slots currently scheduled.")
                .namespace("rollwheel"),
        )?;
        let running_slots = Gauge::with_opts(
            Opts::new("running_slots", "Number of slots currently claimed.")
                .namespace("rollwheel"),
        )?;
        let managed_shards = Gauge::with_opts(
            Opts::new(
                "managed_shards",
                "Number of shards this instance schedules rollups for.",
            )
            .namespace("rollwheel"),
        )?;

        // === Sync ===
        let sync_cycles = CounterVec::new(
            Opts::new(
                "sync_cycles_total",
                "Total shard state sync cycles by operation.",
            )
            .namespace("rollwheel"),
            &["operation"],
        )?;
        let sync_records = CounterVec::new(
            Opts::new(
                "sync_records_total",
                "Total slot state records written or merged by operation.",
            )
            .namespace("rollwheel"),
            &["operation"],
        )?;
        let sync_errors = CounterVec::new(
            Opts::new(
                "sync_errors_total",
                "Total shards that failed a sync cycle by operation.",
            )
            .namespace("rollwheel"),
            &["operation"],
        )?;
        let sync_cycle_duration = HistogramVec::new(
            HistogramOpts::new(
                "sync_cycle_duration_seconds",
                "Shard state sync cycle duration by operation.",
            )
            .namespace("rollwheel")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["operation"],
        )?;
        let store_errors = CounterVec::new(
            Opts::new(
                "store_errors_total",
                "Total shard state store errors by store and operation.",
            )
            .namespace("rollwheel"),
            &["store", "operation"],
        )?;

        // === Ingest ===
        let ingest_accepted = Counter::with_opts(
            Opts::new(
                "ingest_accepted_total",
                "Total samples accepted into the ingest queue.",
            )
            .namespace("rollwheel"),
        )?;
        let ingest_rejected = Counter::with_opts(
            Opts::new(
                "ingest_rejected_total",
                "Total samples rejected because the ingest queue was full.",
            )
            .namespace("rollwheel"),
        )?;
        let ingest_queue_length = Gauge::with_opts(
            Opts::new("ingest_queue_length", "Current ingest queue length.")
                .namespace("rollwheel"),
        )?;

        // === Lifecycle ===
        let start_duration = GaugeVec::new(
            Opts::new(
                "start_duration_seconds",
                "Service startup duration by phase.",
            )
            .namespace("rollwheel"),
            &["phase"],
        )?;

        // Schedule
        registry.register(Box::new(slot_updates.clone()))?;
        registry.register(Box::new(slots_scheduled.clone()))?;
        registry.register(Box::new(slots_claimed.clone()))?;
        registry.register(Box::new(slots_rolled.clone()))?;
        registry.register(Box::new(slots_superseded.clone()))?;
        registry.register(Box::new(slots_pushed_back.clone()))?;
        registry.register(Box::new(rollup_errors.clone()))?;
        registry.register(Box::new(scheduled_slots.clone()))?;
        registry.register(Box::new(running_slots.clone()))?;
        registry.register(Box::new(managed_shards.clone()))?;

        // Sync
        registry.register(Box::new(sync_cycles.clone()))?;
        registry.register(Box::new(sync_records.clone()))?;
        registry.register(Box::new(sync_errors.clone()))?;
        registry.register(Box::new(sync_cycle_duration.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;

        // Ingest
        registry.register(Box::new(ingest_accepted.clone()))?;
        registry.register(Box::new(ingest_rejected.clone()))?;
        registry.register(Box::new(ingest_queue_length.clone()))?;

        // Lifecycle
        registry.register(Box::new(start_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            slot_updates,
            slots_scheduled,
            slots_claimed,
            slots_rolled,
            slots_superseded,
            slots_pushed_back,
            rollup_errors,
            scheduled_slots,
            running_slots,
            managed_shards,
            sync_cycles,
            sync_records,
            sync_errors,
            sync_cycle_duration,
            store_errors,
            ingest_accepted,
            ingest_rejected,
            ingest_queue_length,
            start_duration,
        })
    }

    /// Returns the metrics registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving /metrics, /healthz and /state.
    pub async fn start(&self, schedule: Arc<ScheduleContext>) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry, schedule });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/state/{shard}/{granularity}", get(state_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    schedule: Arc<ScheduleContext>,
}

/// Body of `GET /state/{shard}/{granularity}`.
#[derive(Debug, Serialize)]
struct ShardStateResponse {
    shard: u32,
    granularity: &'static str,
    managed: bool,
    /// Slot-state column to stamp timestamp.
    slots: BTreeMap<String, i64>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /state/{shard}/{granularity} - Slot states of one shard tier.
async fn state_handler(
    State(state): State<Arc<AppState>>,
    Path((shard, granularity)): Path<(u32, String)>,
) -> impl IntoResponse {
    match shard_state(&state.schedule, shard, &granularity) {
        Ok(body) => Json(body).into_response(),
        Err(status) => (status, format!("unknown shard or granularity: {shard}/{granularity}"))
            .into_response(),
    }
}

fn shard_state(
    schedule: &ScheduleContext,
    shard: u32,
    granularity: &str,
) -> Result<ShardStateResponse, StatusCode> {
    if shard >= NUMBER_OF_SHARDS {
        return Err(StatusCode::BAD_REQUEST);
    }
    let g = Granularity::from_name(granularity).ok_or(StatusCode::NOT_FOUND)?;

    let slots = schedule
        .get_slot_stamps(g, shard)
        .into_iter()
        .map(|(slot, stamp)| {
            let record = SlotStateRecord::new(g, slot, stamp.state(), stamp.timestamp());
            (record.column(), record.timestamp)
        })
        .collect();

    Ok(ShardStateResponse {
        shard,
        granularity: g.name(),
        managed: schedule.shard_state().contains(shard),
        slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_metrics_registered() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.slots_rolled.inc();
        health.sync_cycles.with_label_values(&["push"]).inc();

        let names: Vec<String> = health
            .registry()
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"rollwheel_slots_rolled_total".to_string()));
        assert!(names.contains(&"rollwheel_sync_cycles_total".to_string()));
    }

    #[test]
    fn test_shard_state_body() {
        let schedule = ScheduleContext::new([2], Arc::new(ManualClock::new(0)));
        schedule.update(1_234_000, 2);

        let body = shard_state(&schedule, 2, "5m").expect("valid");
        assert_eq!(body.granularity, "metrics_5m");
        assert!(body.managed);
        assert_eq!(body.slots.get("metrics_5m,4,A"), Some(&1_234_000));

        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["slots"]["metrics_5m,4,A"], 1_234_000);
        assert_eq!(json["shard"], 2);
    }

    #[test]
    fn test_shard_state_rejects_bad_input() {
        let schedule = ScheduleContext::new([], Arc::new(ManualClock::new(0)));
        assert_eq!(
            shard_state(&schedule, NUMBER_OF_SHARDS, "5m").err(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            shard_state(&schedule, 1, "7m").err(),
            Some(StatusCode::NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        let schedule = Arc::new(ScheduleContext::new([], Arc::new(ManualClock::new(0))));
        health.start(schedule).await.expect("start");
        health.stop().await.expect("stop");
    }
}
