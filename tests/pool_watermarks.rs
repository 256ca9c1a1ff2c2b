//! End-to-end watermark convergence for the node-shared pool backend.
//!
//! Exercises the full wash pipeline: thread-local front cache, bucket
//! transfer, synchronous washout on the put slow path, and the periodic
//! background washer performing idle elimination.

use std::time::Duration;

use filament_runtime::pool::{self, PoolKind, Poolable};

// Batch 8 with these marks decomposes exactly: 1000 releases form 125 full
// blocks with nothing left in the front cache, so liveness can be asserted
// as precise numbers instead of ranges.
struct Session {
    #[allow(dead_code)]
    payload: [u8; 64],
}

impl Poolable for Session {
    const KIND: PoolKind = PoolKind::NodeShared;
    const LOW_WATER_MARK: usize = 16;
    const HIGH_WATER_MARK: usize = 128;
    const MAX_IDLE: Duration = Duration::from_secs(3);
    const TRANSFER_BATCH_SIZE: usize = 8;

    fn create() -> Self {
        Session { payload: [0; 64] }
    }
}

#[test]
fn test_watermark_convergence() {
    // Burst: everything is freshly created.
    let objects: Vec<_> = (0..1000).map(|_| pool::get::<Session>()).collect();
    assert_eq!(pool::stats::<Session>().alive_objects, 1000);

    // Release the burst. The put slow path washes the bucket down to the
    // high water mark; give the (rate-limited) washing a moment.
    drop(objects);
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(pool::stats::<Session>().alive_objects, 128);

    // No activity past `MAX_IDLE`: the periodic washer eliminates the
    // primary cache block by block, down to the low-water reserve. The
    // reserve is accounted in whole transfer batches, so the count settles
    // on the mark itself rather than mark-plus-one.
    std::thread::sleep(Duration::from_secs(4));
    assert_eq!(pool::stats::<Session>().alive_objects, 16);

    // Light traffic afterwards stays within one transfer batch of the
    // floor: single get/put cycles are served from the front cache.
    for _ in 0..10 {
        let obj = pool::get::<Session>();
        drop(obj);
        std::thread::sleep(Duration::from_millis(50));
    }
    let alive = pool::stats::<Session>().alive_objects;
    assert!(
        (16..=16 + Session::TRANSFER_BATCH_SIZE as i64).contains(&alive),
        "alive objects settled at {}",
        alive
    );
}
