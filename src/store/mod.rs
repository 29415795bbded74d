pub mod clickhouse;
pub mod memory;

use anyhow::Result;

use crate::sync::record::SlotStateRecord;

pub use self::clickhouse::ClickHouseStateStore;
pub use self::memory::MemoryStateStore;

/// Shared durable store of per-shard slot states.
///
/// Writes behave like a wide-column store with write timestamps: a record
/// replaces the stored value of the same column only when its timestamp is
/// newer, so a slow writer can never clobber newer state.
pub trait ShardStateStore: Send + Sync {
    /// Returns the store name for logging.
    fn name(&self) -> &str;

    /// Writes `records` for `shard`.
    fn put_slot_states(
        &self,
        shard: u32,
        records: &[SlotStateRecord],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Reads every record stored for `shard`.
    fn get_slot_states(
        &self,
        shard: u32,
    ) -> impl std::future::Future<Output = Result<Vec<SlotStateRecord>>> + Send;
}

/// Configured store backend.
///
/// Uses enum dispatch rather than trait objects so the async store calls stay
/// statically dispatched.
pub enum StateStore {
    Memory(MemoryStateStore),
    ClickHouse(ClickHouseStateStore),
}

impl ShardStateStore for StateStore {
    fn name(&self) -> &str {
        match self {
            Self::Memory(s) => s.name(),
            Self::ClickHouse(s) => s.name(),
        }
    }

    async fn put_slot_states(&self, shard: u32, records: &[SlotStateRecord]) -> Result<()> {
        match self {
            Self::Memory(s) => s.put_slot_states(shard, records).await,
            Self::ClickHouse(s) => s.put_slot_states(shard, records).await,
        }
    }

    async fn get_slot_states(&self, shard: u32) -> Result<Vec<SlotStateRecord>> {
        match self {
            Self::Memory(s) => s.get_slot_states(shard).await,
            Self::ClickHouse(s) => s.get_slot_states(shard).await,
        }
    }
}

impl<S: ShardStateStore> ShardStateStore for std::sync::Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn put_slot_states(
        &self,
        shard: u32,
        records: &[SlotStateRecord],
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        (**self).put_slot_states(shard, records)
    }

    fn get_slot_states(
        &self,
        shard: u32,
    ) -> impl std::future::Future<Output = Result<Vec<SlotStateRecord>>> + Send {
        (**self).get_slot_states(shard)
    }
}
