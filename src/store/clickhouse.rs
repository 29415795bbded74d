use std::fmt::Write;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::export::health::HealthMetrics;
use crate::sync::record::SlotStateRecord;

use super::ShardStateStore;

/// Shard state store backed by a ClickHouse table.
///
/// Every push appends rows; the table is a `ReplacingMergeTree` keyed by
/// `(shard, state_key)` with `timestamp` as the version, and reads take
/// `max(timestamp)` per key so unmerged parts never surface older state.
pub struct ClickHouseStateStore {
    pool: Pool,
    database: String,
    table: String,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStateStore {
    pub fn new(
        pool: Pool,
        database: String,
        table: String,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            pool,
            database,
            table,
            health,
        }
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    fn record_error(&self, operation: &str) {
        if let Some(health) = &self.health {
            health
                .store_errors
                .with_label_values(&["clickhouse", operation])
                .inc();
        }
    }

    fn insert_sql(&self, shard: u32, records: &[SlotStateRecord], now: SystemTime) -> String {
        let table = self.qualified_table();
        let updated = format_datetime(now);
        let mut sql = String::with_capacity(128 + records.len() * 64);
        let _ = write!(
            sql,
            "INSERT INTO {table} (shard, state_key, timestamp, updated_date_time) VALUES "
        );

        for (idx, record) in records.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            let _ = write!(
                sql,
                "({shard}, '{}', {}, {updated})",
                escape_sql(&record.column()),
                record.timestamp,
            );
        }

        sql
    }

    fn select_sql(&self, shard: u32) -> String {
        format!(
            "SELECT state_key, max(timestamp) AS ts FROM {} WHERE shard = {shard} GROUP BY state_key",
            self.qualified_table()
        )
    }
}

impl ShardStateStore for ClickHouseStateStore {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn put_slot_states(&self, shard: u32, records: &[SlotStateRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let sql = self.insert_sql(shard, records, SystemTime::now());

        let mut handle = match self.pool.get_handle().await {
            Ok(handle) => handle,
            Err(e) => {
                self.record_error("put");
                return Err(e).context("getting handle for slot state insert");
            }
        };

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_error("put");
            return Err(e).with_context(|| format!("writing slot states for shard {shard}"));
        }

        Ok(())
    }

    async fn get_slot_states(&self, shard: u32) -> Result<Vec<SlotStateRecord>> {
        let sql = self.select_sql(shard);

        let mut handle = match self.pool.get_handle().await {
            Ok(handle) => handle,
            Err(e) => {
                self.record_error("get");
                return Err(e).context("getting handle for slot state query");
            }
        };

        let block = match handle.query(sql.as_str()).fetch_all().await {
            Ok(block) => block,
            Err(e) => {
                self.record_error("get");
                return Err(e).with_context(|| format!("reading slot states for shard {shard}"));
            }
        };

        let mut records = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let column: String = row.get("state_key").context("reading state_key")?;
            let timestamp: i64 = row.get("ts").context("reading timestamp")?;
            match SlotStateRecord::parse(&column, timestamp) {
                Some(record) => records.push(record),
                None => tracing::debug!(shard, column = %column, "skipping malformed slot state"),
            }
        }

        Ok(records)
    }
}

/// Formats a timestamp as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
