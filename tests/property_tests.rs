//! Property-based tests for the pooling and buffering layers.
//!
//! Uses proptest to generate random workloads and verify invariants hold.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use filament_runtime::id_alloc::{IdAllocator, IdCache};
use filament_runtime::pool::{self, PoolKind, Poolable};
use filament_runtime::writing_buffer::{FlushStatus, WritingBufferList};
use proptest::prelude::*;

struct PropObj;

impl Poolable for PropObj {
    const KIND: PoolKind = PoolKind::NodeShared;
    const LOW_WATER_MARK: usize = 8;
    const HIGH_WATER_MARK: usize = 64;
    const MAX_IDLE: Duration = Duration::from_secs(3600);
    const TRANSFER_BATCH_SIZE: usize = 4;

    fn create() -> Self {
        PropObj
    }
}

/// Strategy for a random buffer: several non-empty segments.
fn segments() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..50)
}

proptest! {
    /// Bytes come out of a flush in append order, each round respecting
    /// the byte budget, until the list reports emptied.
    #[test]
    fn flush_preserves_order_and_budget(segments in segments(), max_bytes in 1usize..4096) {
        let list = WritingBufferList::new();
        let mut expected = Vec::new();
        for (i, seg) in segments.iter().enumerate() {
            expected.extend_from_slice(seg);
            list.append([Bytes::copy_from_slice(seg)], i as u64);
        }

        let mut out = Vec::new();
        let mut ctxs = Vec::new();
        loop {
            match list.flush_to(&mut out, max_bytes, &mut ctxs) {
                FlushStatus::Flushed { written, emptied, .. } => {
                    prop_assert!(written <= max_bytes);
                    if emptied {
                        break;
                    }
                }
                other => return Err(TestCaseError::fail(format!("flush failed: {:?}", other))),
            }
        }
        prop_assert_eq!(out, expected);
        // Completion contexts arrive in append order, all of them.
        prop_assert_eq!(ctxs, (0..segments.len() as u64).collect::<Vec<_>>());
    }

    /// IDs stay unique regardless of how ranges are batched.
    #[test]
    fn ids_unique_across_batches(batch in 1u64..64, count in 1usize..500) {
        let alloc = IdAllocator::new(1, batch);
        let mut cache = IdCache::new();
        let ids: Vec<u64> = (0..count).map(|_| cache.next(&alloc)).collect();
        let unique: HashSet<u64> = ids.iter().copied().collect();
        prop_assert_eq!(unique.len(), ids.len());
        prop_assert!(ids.iter().all(|&id| id >= 1));
    }

    /// Get/put round trips neither leak nor double-destroy: the live count
    /// never goes negative and never exceeds what was handed out plus the
    /// pool's retention ceiling.
    #[test]
    fn pool_round_trip_preserves_liveness(count in 1usize..200) {
        let handles: Vec<_> = (0..count).map(|_| pool::get::<PropObj>()).collect();
        let alive_held = pool::stats::<PropObj>().alive_objects;
        prop_assert!(alive_held >= count as i64);
        drop(handles);
        let alive = pool::stats::<PropObj>().alive_objects;
        prop_assert!(alive >= 0);
        prop_assert!(alive <= alive_held);
    }
}
