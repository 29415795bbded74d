use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rollwheel::clock::ManualClock;
use rollwheel::granularity::shard::parse_shards;
use rollwheel::granularity::{Granularity, SlotKey};
use rollwheel::schedule::{ScheduleContext, StampState, UpdateStamp};
use rollwheel::store::MemoryStateStore;
use rollwheel::sync::{ShardStatePuller, ShardStatePusher};
use serial_test::serial;

const ROLLUP_DELAY: i64 = 300_000;

struct Node {
    clock: Arc<ManualClock>,
    ctx: Arc<ScheduleContext>,
    push: ShardStatePusher<MemoryStateStore>,
    pull: ShardStatePuller<MemoryStateStore>,
}

impl Node {
    fn new(time: i64, managed: &[u32], synced: &[u32], store: &Arc<MemoryStateStore>) -> Self {
        let clock = Arc::new(ManualClock::new(time));
        let ctx = Arc::new(ScheduleContext::new(
            managed.iter().copied(),
            clock.clone(),
        ));
        let push = ShardStatePusher::new(
            Arc::clone(&ctx),
            Arc::clone(store),
            synced.to_vec(),
            None,
        );
        let pull = ShardStatePuller::new(
            Arc::clone(&ctx),
            Arc::clone(store),
            synced.to_vec(),
            None,
        );
        Self {
            clock,
            ctx,
            push,
            pull,
        }
    }

    fn stamps(&self, g: Granularity, shard: u32) -> BTreeMap<u32, UpdateStamp> {
        self.ctx.get_slot_stamps(g, shard)
    }

    /// Claims and completes scheduled slots until nothing is left, scheduling
    /// again after each completion. Returns the keys in completion order.
    fn drain(&self) -> Vec<SlotKey> {
        let mut done = Vec::new();
        while self.ctx.has_scheduled() {
            let key = self
                .ctx
                .get_next_scheduled()
                .expect("scheduled key to claim");
            assert!(self.ctx.mark_rolled(&key), "{key} should roll");
            assert!(self.ctx.clear_from_running(&key));
            self.ctx.schedule_slots_older_than(ROLLUP_DELAY);
            done.push(key);
        }
        done
    }
}

#[tokio::test]
async fn test_single_shard_manager() {
    let store = Arc::new(MemoryStateStore::new());
    let shards = [1, 2, 3, 4];
    let mut time = 1_234_000i64;
    let node = Node::new(time, &shards, &shards, &store);

    let mut t = time;
    while t < time + 10_000_000 {
        node.ctx.update(t, 1);
        node.ctx.update(t + 2000, 2);
        node.ctx.update(t + 4000, 3);
        node.ctx.update(t + 6000, 4);
        t += 1000;
    }

    time += 10_000_000 + 7;
    node.clock.set(time);
    let pushed = node.push.perform_operation().await;
    assert_eq!(pushed.errors, 0);
    assert_eq!(pushed.records, 4 * (34 + 9 + 4 + 1 + 1));
    node.pull.perform_operation().await;

    // Slots per tier covered by 10,000 seconds of data.
    let expected = [
        (Granularity::Min5, 34),
        (Granularity::Min20, 9),
        (Granularity::Min60, 4),
        (Granularity::Min240, 1),
        (Granularity::Min1440, 1),
    ];
    for (g, count) in expected {
        for shard in shards {
            assert_eq!(node.stamps(g, shard).len(), count, "{g} shard {shard}");
        }
    }
}

#[tokio::test]
async fn test_concurrent_shard_managers() {
    let store = Arc::new(MemoryStateStore::new());
    let common = 5;
    let shards_a = [1, 2, 3, 4, common];
    let shards_b = [11, 22, 33, 44, common];
    let all: Vec<u32> = shards_a.iter().chain(shards_b.iter()).copied().collect();

    let mut time = 1_234_000i64;
    let a = Node::new(time, &shards_a, &all, &store);
    let b = Node::new(time, &shards_b, &all, &store);

    for node in [&a, &b] {
        let mut t = time;
        while t < time + 10_000_000 {
            for (i, shard) in [1, 11, 2, 22, 3, 33, 4, 44].into_iter().enumerate() {
                node.ctx.update(t + i as i64 * 1000, shard);
            }
            t += 1000;
        }
    }

    time += 10_000_000 + 7;
    a.clock.set(time);
    b.clock.set(time);

    a.push.perform_operation().await;
    b.push.perform_operation().await;
    a.pull.perform_operation().await;
    b.pull.perform_operation().await;

    for g in Granularity::ROLLUP {
        for &shard in &all {
            assert_eq!(a.stamps(g, shard), b.stamps(g, shard), "{g} shard {shard}");
        }
    }

    // Moves at least one 5m slot forward.
    time += 300_000;
    for shard in [1, 11, 2, 22] {
        a.ctx.update(time, shard);
    }
    a.clock.set(time);
    b.clock.set(time);

    assert_ne!(a.stamps(Granularity::Min5, 1), b.stamps(Granularity::Min5, 1));
    assert_ne!(a.stamps(Granularity::Min5, 11), b.stamps(Granularity::Min5, 11));
    assert_eq!(a.stamps(Granularity::Min5, 3), b.stamps(Granularity::Min5, 3));
    assert_eq!(a.stamps(Granularity::Min5, 33), b.stamps(Granularity::Min5, 33));

    // A pushes first, B second with nothing newer, then B pulls. A is not
    // pulled so stale data written by B could not mask a broken merge.
    a.push.perform_operation().await;
    b.push.perform_operation().await;
    b.pull.perform_operation().await;

    for g in Granularity::ROLLUP {
        for &shard in &all {
            assert_eq!(a.stamps(g, shard), b.stamps(g, shard), "{g} shard {shard}");
        }
    }
}

#[tokio::test]
async fn test_stale_writer_does_not_clobber() {
    let store = Arc::new(MemoryStateStore::new());
    let shards = [7];
    let time = 1_234_000i64;
    let a = Node::new(time, &shards, &shards, &store);
    let b = Node::new(time, &shards, &shards, &store);

    // B saw the slot first, A saw newer data for the same slot.
    b.ctx.update(time, 7);
    a.ctx.update(time + 10_000, 7);

    a.push.perform_operation().await;
    b.push.perform_operation().await;

    let column = format!("{},4,A", Granularity::Min5.name());
    let stored = store
        .get_raw(7, &column)
        .expect("stored 5m record");
    assert_eq!(stored, time + 10_000);

    b.pull.perform_operation().await;
    for g in Granularity::ROLLUP {
        assert_eq!(a.stamps(g, 7), b.stamps(g, 7), "{g}");
    }
}

#[tokio::test]
async fn test_update_clobbering() {
    let store = Arc::new(MemoryStateStore::new());
    let mut time = 1234i64;
    let node = Node::new(time, &[1], &[1, 2], &store);

    time += 1000;
    node.clock.set(time);
    node.ctx.update(time, 1);
    node.push.perform_operation().await;

    time += 600_000;
    node.clock.set(time);
    node.ctx.schedule_slots_older_than(ROLLUP_DELAY);
    assert_eq!(node.ctx.scheduled_count(), 1);

    let done = node.drain();
    let tiers: Vec<Granularity> = done.iter().map(|k| k.granularity()).collect();
    assert_eq!(tiers, Granularity::ROLLUP.to_vec());

    node.ctx.schedule_slots_older_than(ROLLUP_DELAY);
    assert_eq!(node.ctx.scheduled_count(), 0);

    // Reloading the older active records must not undo the rollups.
    node.pull.perform_operation().await;
    node.ctx.schedule_slots_older_than(ROLLUP_DELAY);
    assert_eq!(node.ctx.scheduled_count(), 0);
    for g in Granularity::ROLLUP {
        for stamp in node.stamps(g, 1).values() {
            assert_eq!(stamp.state(), StampState::Rolled, "{g}");
        }
    }
}

#[tokio::test]
async fn test_rollup_of_delayed_metrics() {
    let store = Arc::new(MemoryStateStore::new());
    let time = 1_234_000i64;
    let ingest = Node::new(time, &[0], &[0], &store);
    let rollup = Node::new(time, &[0], &[0], &store);

    ingest.ctx.update(time + 30_000, 0);
    ingest.push.perform_operation().await;

    rollup.pull.perform_operation().await;
    rollup.clock.set(time + 600_000);
    rollup.ctx.schedule_slots_older_than(ROLLUP_DELAY);
    assert_eq!(rollup.ctx.scheduled_count(), 1);
    assert_eq!(rollup.drain().len(), 5);
    rollup.push.perform_operation().await;

    // A late sample for the already rolled slot arrives on the ingest node.
    ingest.pull.perform_operation().await;
    ingest.ctx.update(time, 0);
    let reopened = ingest
        .stamps(Granularity::Min5, 0)
        .get(&Granularity::Min5.slot(time))
        .copied()
        .expect("5m stamp");
    assert_eq!(reopened.state(), StampState::Active);
    ingest.push.perform_operation().await;

    rollup.pull.perform_operation().await;
    // The reactivation is stamped after the rollup, so it ages from there.
    rollup.clock.set(time + 1_200_000);
    rollup.ctx.schedule_slots_older_than(ROLLUP_DELAY);
    assert_eq!(rollup.ctx.scheduled_count(), 1);
    assert_eq!(rollup.drain().len(), 5);
}

#[tokio::test]
async fn test_coarser_slots_follow_out_of_order_finer_slot() {
    let store = Arc::new(MemoryStateStore::new());
    let time = 1_386_823_200_000i64;
    let node = Node::new(time, &[123], &[123], &store);

    node.ctx.update(time, 123);
    let key = SlotKey::new(Granularity::Min20, Granularity::Min20.slot(time), 123)
        .expect("valid key");
    let parent = key.parent().expect("60m parent");

    // The parent was rolled before its child saw more data.
    node.clock.set(time + 1_800_000);
    assert!(node.ctx.mark_rolled(&parent));
    let rolled = node
        .stamps(parent.granularity(), 123)
        .get(&parent.slot())
        .copied()
        .expect("parent stamp");
    assert_eq!(rolled.state(), StampState::Rolled);

    node.clock.set(time + 3_600_000);
    assert!(node.ctx.mark_rolled(&key));
    assert!(!node.ctx.clear_from_running(&key));

    let reopened = node
        .stamps(parent.granularity(), 123)
        .get(&parent.slot())
        .copied()
        .expect("parent stamp");
    assert!(reopened.is_active());
    assert!(reopened.timestamp() > rolled.timestamp());
}

#[tokio::test]
async fn test_convergence_for_multiple_ingestors() {
    let store = Arc::new(MemoryStateStore::new());
    let shards = parse_shards("ALL").expect("all shards");
    let time = 1234i64;
    let nodes = [
        Node::new(time, &shards, &shards, &store),
        Node::new(time, &shards, &shards, &store),
    ];

    let mut t = time;
    for round in 0..20u32 {
        for &shard in &shards {
            t += 30_000;
            let node = &nodes[((round + shard) % 2) as usize];
            node.ctx.update(t, shard);
        }
    }

    for _ in 0..2 {
        nodes[0].push.perform_operation().await;
        nodes[1].pull.perform_operation().await;
        nodes[1].push.perform_operation().await;
        nodes[0].pull.perform_operation().await;
    }

    for g in Granularity::ROLLUP {
        for &shard in &shards {
            assert_eq!(
                nodes[0].stamps(g, shard),
                nodes[1].stamps(g, shard),
                "{g} shard {shard}"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_sync_during_concurrent_updates() {
    let store = Arc::new(MemoryStateStore::new());
    let shards = parse_shards("ALL").expect("all shards");
    let node = Arc::new(Node::new(1234, &shards, &shards, &store));
    let run_for = Duration::from_millis(500);
    let stop = Arc::new(AtomicBool::new(false));

    let sync = {
        let node = Arc::clone(&node);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut cycles = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let pushed = node.push.perform_operation().await;
                let pulled = node.pull.perform_operation().await;
                assert_eq!(pushed.errors + pulled.errors, 0);
                cycles += 1;
                tokio::task::yield_now().await;
            }
            cycles
        })
    };

    let updates = {
        let node = Arc::clone(&node);
        let shards = shards.clone();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut time = 1234i64;
            while started.elapsed() < run_for {
                for &shard in &shards {
                    time += 30_000;
                    node.clock.set(time);
                    node.ctx.update(time, shard);
                }
            }
        })
    };

    updates.await.expect("update thread");
    stop.store(true, Ordering::Relaxed);
    let cycles = sync.await.expect("sync task");
    assert!(cycles > 0);

    // One final cycle leaves every shard clean.
    node.push.perform_operation().await;
    for &shard in &shards {
        assert!(node.ctx.shard_state().dirty_stamps(shard).is_empty());
    }
}
