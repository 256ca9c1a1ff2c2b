//! Thread-Local Pool Backend
//!
//! Objects are cached entirely per thread, so neither path ever
//! synchronizes. Each thread keeps a primary cache of timestamped idle
//! objects and a secondary cache of up to `LOW_WATER_MARK` objects that is
//! exempt from idle elimination. Washing runs piggybacked on put, bounded
//! by a minimum interval and a per-wash free budget so no single put stalls
//! on a long destruction spree.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::pool::{type_desc, Poolable, TypeDescriptor};

const MINIMUM_WASH_INTERVAL: Duration = Duration::from_millis(5);
const MINIMUM_FREE_PER_WASH: usize = 32;

struct TimestampedObject {
    ptr: *mut (),
    last_used: Instant,
}

struct LocalPool {
    desc: TypeDescriptor,
    low_water_mark: usize,
    /// After subtracting the low water mark kept in the secondary cache.
    high_water_mark: usize,
    max_idle: Duration,
    last_wash: Instant,
    /// Subject to washout, oldest at the front.
    primary_cache: VecDeque<TimestampedObject>,
    /// Reserve of up to `low_water_mark` objects, never idle-eliminated.
    secondary_cache: VecDeque<TimestampedObject>,
}

impl LocalPool {
    fn new<T: Poolable>() -> Self {
        Self {
            desc: type_desc::<T>(),
            low_water_mark: T::LOW_WATER_MARK,
            high_water_mark: T::HIGH_WATER_MARK.saturating_sub(T::LOW_WATER_MARK),
            max_idle: T::MAX_IDLE,
            last_wash: Instant::now(),
            primary_cache: VecDeque::new(),
            secondary_cache: VecDeque::new(),
        }
    }

    fn destroy_front(&mut self, mut count: usize) {
        // Demote to the secondary cache while there's room; destroy the
        // rest.
        while count > 0 {
            let Some(obj) = self.primary_cache.pop_front() else {
                break;
            };
            if self.secondary_cache.len() < self.low_water_mark {
                self.secondary_cache.push_back(obj);
            } else {
                unsafe { (self.desc.destroy)(obj.ptr) };
            }
            count -= 1;
        }
    }

    fn wash(&mut self) {
        let now = Instant::now();
        if now < self.last_wash + MINIMUM_WASH_INTERVAL {
            return; // Called too frequently.
        }
        self.last_wash = now;

        if self.primary_cache.len() > self.high_water_mark {
            let upto = free_count(self.primary_cache.len() - self.high_water_mark);
            self.destroy_front(upto);
            if upto == MINIMUM_FREE_PER_WASH {
                return; // Freed enough for one round.
            }
        }

        let idle_objects = self
            .primary_cache
            .iter()
            .take_while(|e| now.duration_since(e.last_used) >= self.max_idle)
            .count();
        self.destroy_front(free_count(idle_objects));
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        for obj in self.primary_cache.drain(..).chain(self.secondary_cache.drain(..)) {
            unsafe { (self.desc.destroy)(obj.ptr) };
        }
    }
}

/// Cap on how much one wash round frees: at least a fixed floor (to make
/// progress), at most half the backlog (to spread the cost), never more
/// than the backlog itself.
fn free_count(upto: usize) -> usize {
    upto.min((upto / 2).max(MINIMUM_FREE_PER_WASH))
}

thread_local! {
    static LOCAL_POOLS: RefCell<HashMap<TypeId, LocalPool>> = RefCell::new(HashMap::new());
}

pub(crate) fn get<T: Poolable>() -> *mut () {
    LOCAL_POOLS
        .try_with(|pools| {
            let mut pools = pools.borrow_mut();
            let pool = pools
                .entry(TypeId::of::<T>())
                .or_insert_with(LocalPool::new::<T>);
            if pool.primary_cache.is_empty() && !pool.secondary_cache.is_empty() {
                pool.primary_cache = std::mem::take(&mut pool.secondary_cache);
                // Refresh the timestamps, or the promoted objects would be
                // prime washout victims immediately.
                let now = Instant::now();
                for obj in &mut pool.primary_cache {
                    obj.last_used = now;
                }
            }
            pool.primary_cache.pop_back().map(|obj| obj.ptr)
        })
        // Err: thread-local state is being torn down; create directly.
        .ok()
        .flatten()
        .unwrap_or_else(|| (type_desc::<T>().create)())
}

pub(crate) fn put<T: Poolable>(ptr: *mut ()) {
    let result = LOCAL_POOLS.try_with(|pools| {
        let mut pools = pools.borrow_mut();
        let pool = pools
            .entry(TypeId::of::<T>())
            .or_insert_with(LocalPool::new::<T>);
        pool.primary_cache.push_back(TimestampedObject {
            ptr,
            last_used: Instant::now(),
        });
        pool.wash();
    });
    if result.is_err() {
        // Thread-local state is already gone; free immediately.
        unsafe { (type_desc::<T>().destroy)(ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{self, PoolKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TlsObj;

    impl Poolable for TlsObj {
        const KIND: PoolKind = PoolKind::ThreadLocal;
        const LOW_WATER_MARK: usize = 2;
        const HIGH_WATER_MARK: usize = 8;
        const MAX_IDLE: Duration = Duration::from_secs(3600);
        fn create() -> Self {
            TlsObj
        }
    }

    #[test]
    fn test_reuse_within_thread() {
        let obj = pool::get::<TlsObj>();
        let addr = &*obj as *const TlsObj;
        drop(obj);
        let obj = pool::get::<TlsObj>();
        assert_eq!(&*obj as *const TlsObj, addr);
    }

    static EXIT_LIVE: AtomicUsize = AtomicUsize::new(0);

    struct ExitObj;

    impl Poolable for ExitObj {
        const KIND: PoolKind = PoolKind::ThreadLocal;
        const LOW_WATER_MARK: usize = 2;
        const HIGH_WATER_MARK: usize = 8;
        const MAX_IDLE: Duration = Duration::from_secs(3600);
        fn create() -> Self {
            EXIT_LIVE.fetch_add(1, Ordering::Relaxed);
            ExitObj
        }
    }

    impl Drop for ExitObj {
        fn drop(&mut self) {
            EXIT_LIVE.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_thread_exit_destroys_cache() {
        std::thread::spawn(|| {
            let objs: Vec<_> = (0..4).map(|_| pool::get::<ExitObj>()).collect();
            drop(objs);
        })
        .join()
        .unwrap();
        // Everything that thread created must be gone again.
        assert_eq!(EXIT_LIVE.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_free_count_bounds() {
        assert_eq!(free_count(0), 0);
        assert_eq!(free_count(10), 10);
        assert_eq!(free_count(100), 50);
        assert_eq!(free_count(40), 32);
    }
}
