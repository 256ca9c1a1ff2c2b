//! Object Pooling
//!
//! Generic typed object pooling with a pluggable backend per type. A type
//! opts in by implementing [`Poolable`], choosing a backend and tuning the
//! caching parameters; callers then use [`get`] and let the returned
//! [`Pooled`] handle recycle the object on drop.
//!
//! # Backends
//!
//! - [`PoolKind::Disabled`]: no pooling at all. Every get creates, every
//!   put destroys. Useful when chasing lifetime bugs, since object
//!   identity is never reused.
//! - [`PoolKind::ThreadLocal`]: objects are cached purely per thread. Best
//!   when allocation and deallocation happen evenly on every thread; no
//!   synchronization on any path.
//! - [`PoolKind::NodeShared`]: a small thread-local front cache backed by
//!   a shared per-NUMA-node pool. Best when objects migrate between
//!   threads of the same node (allocated on one, freed on another).
//! - [`PoolKind::Global`]: a small thread-local-free shared freelist.
//!   Simple and adequate for workloads with no evident pattern.
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::pool::{self, PoolKind, Poolable};
//! use std::time::Duration;
//!
//! struct Connection { /* ... */ }
//!
//! impl Poolable for Connection {
//!     const KIND: PoolKind = PoolKind::NodeShared;
//!     const LOW_WATER_MARK: usize = 1024;
//!     const HIGH_WATER_MARK: usize = 16384;
//!     const MAX_IDLE: Duration = Duration::from_secs(10);
//!     const TRANSFER_BATCH_SIZE: usize = 128;
//!     fn create() -> Self { Connection { /* ... */ } }
//! }
//!
//! let conn = pool::get::<Connection>();
//! // Dropped back into the pool at end of scope.
//! ```

pub(crate) mod node_shared;
pub(crate) mod thread_local;

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::time::Duration;

pub use node_shared::{start_periodical_washer, stop_periodical_washer, PoolStats};

/// Backend selection for a pooled type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// No pooling; get creates, put destroys.
    Disabled,
    /// Purely thread-local caching.
    ThreadLocal,
    /// Thread-local front cache over a shared per-NUMA-node pool.
    NodeShared,
    /// Thread-local-free shared freelist.
    Global,
}

/// A type that can be recycled through the object pool.
///
/// The water marks bound how many *idle* objects the shared cache keeps per
/// NUMA node; objects sitting in thread-local front caches are not counted.
/// Both marks must be multiples of [`TRANSFER_BATCH_SIZE`] (enforced at
/// compile time), since the shared cache manages objects in whole transfer
/// batches.
///
/// [`TRANSFER_BATCH_SIZE`]: Poolable::TRANSFER_BATCH_SIZE
pub trait Poolable: Send + Sized + 'static {
    /// Which backend caches this type.
    const KIND: PoolKind;

    /// Minimum number of idle objects kept per node, exempt from idle
    /// elimination. Should be significantly larger than the transfer batch,
    /// or threads will oscillate between bulk-creating and bulk-destroying.
    const LOW_WATER_MARK: usize = usize::MAX;

    /// Hard cap on idle objects per node. `MAX_IDLE` is ignored above this
    /// limit.
    const HIGH_WATER_MARK: usize = usize::MAX;

    /// Grace period before an idle object becomes eligible for destruction
    /// (as long as the cache is below `HIGH_WATER_MARK`).
    const MAX_IDLE: Duration = Duration::MAX;

    /// Objects kept in the thread-local front cache before batches start
    /// being transferred to the shared cache. Zero still leaves up to one
    /// partial batch cached locally.
    const MIN_THREAD_CACHE_SIZE: usize = 0;

    /// Number of objects moved between the thread-local front cache and the
    /// shared cache at a time.
    const TRANSFER_BATCH_SIZE: usize = 1;

    /// Create a fresh object. Called on cache miss.
    fn create() -> Self;

    /// Called after an object leaves the pool, before the caller sees it.
    /// Reset state here so callers always observe a clean object.
    fn on_get(&mut self) {}

    /// Called before an object enters the pool. Release precious resources
    /// (file handles, large buffers) that should not sit idle in a cache.
    fn on_put(&mut self) {}
}

// ===========================================================================
// Type-erased plumbing
// ===========================================================================

/// Type-erased create/destroy for a pooled type. Backends deal purely in
/// `*mut ()`.
#[derive(Clone, Copy)]
pub(crate) struct TypeDescriptor {
    pub(crate) create: fn() -> *mut (),
    pub(crate) destroy: unsafe fn(*mut ()),
    pub(crate) type_name: &'static str,
}

fn create_erased<T: Poolable>() -> *mut () {
    Box::into_raw(Box::new(T::create())) as *mut ()
}

unsafe fn destroy_erased<T: Poolable>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut T));
}

pub(crate) fn type_desc<T: Poolable>() -> TypeDescriptor {
    TypeDescriptor {
        create: create_erased::<T>,
        destroy: destroy_erased::<T>,
        type_name: std::any::type_name::<T>(),
    }
}

// ===========================================================================
// Public API
// ===========================================================================

/// Owning handle to a pooled object. Returns the object to the pool on
/// drop.
pub struct Pooled<T: Poolable> {
    ptr: NonNull<T>,
}

// The handle owns the object outright; `T: Send` is required by `Poolable`.
unsafe impl<T: Poolable> Send for Pooled<T> {}

impl<T: Poolable> Pooled<T> {
    /// Transfer ownership to the caller. The pointer must later be passed
    /// to [`Pooled::from_raw`] (or leaked for good).
    pub fn into_raw(self) -> *mut T {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }

    /// Reclaim ownership of a pointer obtained from [`Pooled::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `into_raw` on a handle of the same `T`, and
    /// must not be reclaimed twice.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        debug_assert!(!ptr.is_null());
        Self {
            ptr: NonNull::new_unchecked(ptr),
        }
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the handle exclusively owns the object.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the handle exclusively owns the object.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        // Safety: the pointer came out of `get` and has not been returned.
        unsafe { put_raw::<T>(self.ptr.as_ptr()) };
    }
}

/// Acquire an object from `T`'s pool.
pub fn get<T: Poolable>() -> Pooled<T> {
    const {
        assert!(
            T::LOW_WATER_MARK == usize::MAX
                || T::LOW_WATER_MARK % T::TRANSFER_BATCH_SIZE == 0,
            "LOW_WATER_MARK must be a multiple of TRANSFER_BATCH_SIZE",
        );
        assert!(
            T::HIGH_WATER_MARK == usize::MAX
                || T::HIGH_WATER_MARK % T::TRANSFER_BATCH_SIZE == 0,
            "HIGH_WATER_MARK must be a multiple of TRANSFER_BATCH_SIZE",
        );
        assert!(T::TRANSFER_BATCH_SIZE > 0, "TRANSFER_BATCH_SIZE must be positive");
    }

    let raw = match T::KIND {
        PoolKind::Disabled => (type_desc::<T>().create)(),
        PoolKind::ThreadLocal => thread_local::get::<T>(),
        PoolKind::NodeShared => node_shared::get::<T>(),
        PoolKind::Global => global::get::<T>(),
    };
    let ptr = raw as *mut T;
    // Safety: every backend returns a valid, exclusively owned object.
    unsafe {
        (*ptr).on_get();
        Pooled {
            ptr: NonNull::new_unchecked(ptr),
        }
    }
}

/// Return an object to `T`'s pool.
///
/// # Safety
///
/// `ptr` must point to an object previously obtained from [`get`] for the
/// same `T` and not yet returned.
pub unsafe fn put_raw<T: Poolable>(ptr: *mut T) {
    debug_assert!(!ptr.is_null());
    (*ptr).on_put();
    let raw = ptr as *mut ();
    match T::KIND {
        PoolKind::Disabled => (type_desc::<T>().destroy)(raw),
        PoolKind::ThreadLocal => thread_local::put::<T>(raw),
        PoolKind::NodeShared => node_shared::put::<T>(raw),
        PoolKind::Global => global::put::<T>(raw),
    }
}

/// Cache-miss and liveness counters for `T`'s pool. Counters are all zero
/// for backends other than [`PoolKind::NodeShared`].
pub fn stats<T: Poolable>() -> PoolStats {
    match T::KIND {
        PoolKind::NodeShared => node_shared::stats::<T>(),
        _ => PoolStats::default(),
    }
}

/// Synchronously move the calling thread's front cache for `T` into the
/// shared per-node cache, making the objects visible to washout and to
/// other threads. Only meaningful for [`PoolKind::NodeShared`].
pub fn flush_current_thread<T: Poolable>() {
    if let PoolKind::NodeShared = T::KIND {
        node_shared::flush_current_thread::<T>();
    }
}

/// Warm up pool state for the calling thread.
///
/// Initialization of the thread-local cache otherwise happens on the first
/// get/put, which needs a bit of stack; threads running on tiny stacks
/// (system fibers) can call this early from a safe context instead.
/// Calling it multiple times is allowed.
pub fn initialize_for_current_thread<T: Poolable>() {
    if let PoolKind::NodeShared = T::KIND {
        node_shared::initialize_for_current_thread::<T>();
    }
}

// ===========================================================================
// Disabled-adjacent simple backend: Global
// ===========================================================================

mod global {
    //! Shared freelist backend. One mutex-protected stack of idle objects
    //! per type, capped at the high water mark. No thread-local state, so
    //! no affinity and no per-thread warmup cost.

    use super::{type_desc, Poolable};
    use parking_lot::Mutex;
    use std::any::TypeId;
    use std::collections::HashMap;
    use std::sync::OnceLock;

    struct FreeList {
        objects: Mutex<Vec<*mut ()>>,
        capacity: usize,
    }

    // Objects in the freelist are idle and exclusively owned; `T: Send`.
    unsafe impl Send for FreeList {}
    unsafe impl Sync for FreeList {}

    fn free_list<T: Poolable>() -> &'static FreeList {
        static REGISTRY: OnceLock<Mutex<HashMap<TypeId, &'static FreeList>>> =
            OnceLock::new();
        let mut registry = REGISTRY.get_or_init(Default::default).lock();
        let list: &'static FreeList =
            *registry.entry(TypeId::of::<T>()).or_insert_with(|| {
                Box::leak(Box::new(FreeList {
                    objects: Mutex::new(Vec::new()),
                    capacity: T::HIGH_WATER_MARK,
                }))
            });
        list
    }

    pub(super) fn get<T: Poolable>() -> *mut () {
        if let Some(ptr) = free_list::<T>().objects.lock().pop() {
            return ptr;
        }
        (type_desc::<T>().create)()
    }

    pub(super) fn put<T: Poolable>(ptr: *mut ()) {
        let list = free_list::<T>();
        {
            let mut objects = list.objects.lock();
            if objects.len() < list.capacity {
                objects.push(ptr);
                return;
            }
        }
        // Safety: ownership was handed to us by the caller.
        unsafe { (type_desc::<T>().destroy)(ptr) };
    }
}
