use std::collections::HashMap;

use anyhow::Result;
use dashmap::DashMap;

use crate::sync::record::SlotStateRecord;

use super::ShardStateStore;

/// In-process shard state store.
///
/// Shared between every instance in the same process, so it stands in for the
/// real store in single-node deployments and in tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    shards: DashMap<u32, HashMap<String, i64>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of columns stored for `shard`.
    pub fn column_count(&self, shard: u32) -> usize {
        self.shards.get(&shard).map_or(0, |cols| cols.len())
    }

    /// Stored timestamp of one column.
    pub fn get_raw(&self, shard: u32, column: &str) -> Option<i64> {
        self.shards.get(&shard)?.get(column).copied()
    }

    /// Writes a raw column, bypassing record encoding.
    pub fn put_raw(&self, shard: u32, column: &str, timestamp: i64) {
        self.shards
            .entry(shard)
            .or_default()
            .insert(column.to_string(), timestamp);
    }
}

impl ShardStateStore for MemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put_slot_states(&self, shard: u32, records: &[SlotStateRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut columns = self.shards.entry(shard).or_default();
        for record in records {
            let stored = columns.entry(record.column()).or_insert(i64::MIN);
            // Newest write timestamp wins.
            if record.timestamp > *stored {
                *stored = record.timestamp;
            }
        }
        Ok(())
    }

    async fn get_slot_states(&self, shard: u32) -> Result<Vec<SlotStateRecord>> {
        let Some(columns) = self.shards.get(&shard) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::with_capacity(columns.len());
        for (column, timestamp) in columns.iter() {
            match SlotStateRecord::parse(column, *timestamp) {
                Some(record) => records.push(record),
                None => tracing::debug!(shard, column = %column, "skipping malformed slot state"),
            }
        }
        Ok(records)
    }
}
