//! Stack Allocation
//!
//! Fiber stacks, pooled through the node-shared object pool. Two flavors:
//!
//! - **User stacks** back ordinary fibers. Size comes from
//!   [`crate::config`] (default 128 KiB) and, unless disabled there, each
//!   stack gets an inaccessible guard page below it so overflow faults
//!   instead of silently corrupting the neighboring allocation. Allocated
//!   with `mmap`, which is also why the pool water marks are conservative:
//!   every live stack consumes a kernel VMA (two with a guard page), and
//!   Linux caps those at `vm.max_map_count` (~64K by default).
//! - **System stacks** back runtime-internal fibers. They are small
//!   (16 KiB), heap-allocated, and carry no guard page; instead two canary
//!   words sit at the stack limit and are verified every time the stack
//!   enters or leaves the pool, so an overflow is caught at recycle time at
//!   the latest.
//!
//! Every *actually allocated* stack is tracked in a global registry so
//! debugging tooling can enumerate live stacks. Pool-cached reuse does not
//! touch the registry; registration cost only accompanies the (already
//! expensive) VMA operations.

use std::ptr::NonNull;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{self, SYSTEM_STACK_SIZE};
use crate::pool::{self, PoolKind, Poolable, Pooled};

const OUT_OF_MEMORY_ERROR: &str =
    "Cannot allocate fiber stack. Check `/proc/[pid]/maps` to see if there are \
     too many memory regions; there's a limit at around 64K by default. If you \
     reached the limit, try either disabling the guard page or increasing \
     `vm.max_map_count` (suggested).";

// ===========================================================================
// Stack registry
// ===========================================================================

/// Global registry of all live stacks, keyed by stack bottom (one byte past
/// the highest stack address, where the fiber control block resides).
pub struct StackRegistry {
    stacks: Mutex<Vec<usize>>,
}

impl StackRegistry {
    const fn new() -> Self {
        Self {
            stacks: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, stack_bottom: usize) {
        // Slow, but so are the VMA operations that accompany us.
        self.stacks.lock().push(stack_bottom);
    }

    fn deregister(&self, stack_bottom: usize) {
        let mut stacks = self.stacks.lock();
        match stacks.iter().position(|&s| s == stack_bottom) {
            Some(index) => {
                stacks.swap_remove(index);
            }
            None => panic!("Unrecognized stack {:#x}.", stack_bottom),
        }
    }

    /// Number of live (allocated, possibly pool-cached) stacks.
    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Whether no stacks are currently allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack-bottom addresses of all live stacks.
    pub fn snapshot(&self) -> Vec<usize> {
        self.stacks.lock().clone()
    }
}

/// The process-wide stack registry.
pub fn stack_registry() -> &'static StackRegistry {
    static REGISTRY: StackRegistry = StackRegistry::new();
    &REGISTRY
}

// ===========================================================================
// User stacks
// ===========================================================================

/// An mmap-backed stack for user fibers, with an optional guard page below
/// the usable region.
pub struct UserStack {
    /// Lowest usable address (just above the guard page, if any).
    limit: NonNull<u8>,
    size: usize,
    guard: usize,
}

// Safety: the stack is a raw memory region exclusively owned by this
// handle.
unsafe impl Send for UserStack {}

impl UserStack {
    /// Lowest usable address of the stack.
    pub fn limit(&self) -> *mut u8 {
        self.limit.as_ptr()
    }

    /// One byte past the stack region. Stacks grow down from here; the
    /// fiber control block is placed at the top of this region.
    pub fn bottom(&self) -> *mut u8 {
        // Safety: limit + size stays within the original mapping.
        unsafe { self.limit.as_ptr().add(self.size) }
    }

    /// Usable stack size in bytes (the guard page not included).
    pub fn size(&self) -> usize {
        self.size
    }

    fn allocate() -> Self {
        let cfg = config::stack_config();
        let page = config::page_size();
        let guard = if cfg.guard_page { page } else { 0 };
        let allocation = cfg.stack_size + guard;

        // Safety: plain anonymous mapping.
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                allocation,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            panic!("{}", OUT_OF_MEMORY_ERROR);
        }
        debug_assert_eq!(p as usize % page, 0);
        if guard != 0 {
            // Safety: protecting the lowest page of our own fresh mapping.
            if unsafe { libc::mprotect(p, page, libc::PROT_NONE) } != 0 {
                panic!("{}", OUT_OF_MEMORY_ERROR);
            }
        }

        // Safety: `p + guard` is within the mapping and non-null.
        let limit = unsafe { NonNull::new_unchecked((p as *mut u8).add(guard)) };
        let stack = Self {
            limit,
            size: cfg.stack_size,
            guard,
        };
        stack_registry().register(stack.bottom() as usize);
        stack
    }
}

impl Drop for UserStack {
    fn drop(&mut self) {
        stack_registry().deregister(self.bottom() as usize);
        // Safety: unmapping exactly the region we mapped in `allocate`.
        let rc = unsafe {
            libc::munmap(
                self.limit.as_ptr().sub(self.guard) as *mut libc::c_void,
                self.size + self.guard,
            )
        };
        debug_assert_eq!(rc, 0);
    }
}

impl Poolable for UserStack {
    const KIND: PoolKind = PoolKind::NodeShared;
    const LOW_WATER_MARK: usize = 512;
    // Keep the high water mark modest, or pooled-but-idle stacks may
    // exhaust `vm.max_map_count` on their own.
    const HIGH_WATER_MARK: usize = 16384;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 32;
    const TRANSFER_BATCH_SIZE: usize = 128;

    fn create() -> Self {
        UserStack::allocate()
    }
}

/// Acquire a (pooled) user stack.
pub fn create_user_stack() -> Pooled<UserStack> {
    pool::get::<UserStack>()
}

// ===========================================================================
// System stacks
// ===========================================================================

// EncodeHex("FilamentStkCanry"), split into two words placed at the stack
// limit. Overwriting them means the stack overflowed.
const STACK_CANARY0: u64 = 0x4669_6c61_6d65_6e74;
const STACK_CANARY1: u64 = 0x5374_6b43_616e_7279;

/// Alignment of system stack allocations; matches the alignment the fiber
/// control block placed on top of the stack requires.
const SYSTEM_STACK_ALIGN: usize = 64;

/// A small heap-backed stack for runtime-internal fibers. No guard page;
/// overflow detection relies on the canary words at the stack limit.
pub struct SystemStack {
    base: NonNull<u8>,
}

// Safety: exclusively owned raw memory region.
unsafe impl Send for SystemStack {}

impl SystemStack {
    /// Lowest usable address. The first 16 bytes hold the canaries, but
    /// treating them as usable is fine: they sit where the very last bytes
    /// of the stack would be, and if they are reached the stack has
    /// overflowed anyway.
    pub fn limit(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// One byte past the stack region.
    pub fn bottom(&self) -> *mut u8 {
        // Safety: base + size stays within the allocation.
        unsafe { self.base.as_ptr().add(SYSTEM_STACK_SIZE) }
    }

    /// Usable stack size in bytes.
    pub fn size(&self) -> usize {
        SYSTEM_STACK_SIZE
    }

    fn allocate() -> Self {
        let mut p: *mut libc::c_void = std::ptr::null_mut();
        // Safety: standard aligned allocation.
        let rc = unsafe { libc::posix_memalign(&mut p, SYSTEM_STACK_ALIGN, SYSTEM_STACK_SIZE) };
        if rc != 0 || p.is_null() {
            panic!("{}", OUT_OF_MEMORY_ERROR);
        }
        // Safety: checked non-null above.
        let base = unsafe { NonNull::new_unchecked(p as *mut u8) };
        let stack = Self { base };
        stack.initialize_canaries();
        stack_registry().register(stack.bottom() as usize);
        stack
    }

    fn initialize_canaries(&self) {
        // Safety: the allocation is at least 16 bytes and 8-aligned.
        unsafe {
            let canaries = self.base.as_ptr() as *mut u64;
            canaries.write_volatile(STACK_CANARY0);
            canaries.add(1).write_volatile(STACK_CANARY1);
        }
    }

    fn verify_canaries(&self) {
        // Safety: same layout as `initialize_canaries`.
        let (c0, c1) = unsafe {
            let canaries = self.base.as_ptr() as *const u64;
            (canaries.read(), canaries.add(1).read())
        };
        assert_eq!(
            c0, STACK_CANARY0,
            "The first canary value was overwritten. The stack is corrupted.",
        );
        assert_eq!(
            c1, STACK_CANARY1,
            "The second canary value was overwritten. The stack is corrupted.",
        );
    }
}

impl Drop for SystemStack {
    fn drop(&mut self) {
        stack_registry().deregister(self.bottom() as usize);
        // Safety: freeing the pointer obtained from `posix_memalign`.
        unsafe { libc::free(self.base.as_ptr() as *mut libc::c_void) };
    }
}

impl Poolable for SystemStack {
    const KIND: PoolKind = PoolKind::NodeShared;
    const LOW_WATER_MARK: usize = 4096;
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 128;
    const TRANSFER_BATCH_SIZE: usize = 512;

    fn create() -> Self {
        SystemStack::allocate()
    }

    fn on_get(&mut self) {
        self.verify_canaries();
    }

    fn on_put(&mut self) {
        // Catch overflows no later than recycle time.
        self.verify_canaries();
    }
}

/// Acquire a (pooled) system stack.
pub fn create_system_stack() -> Pooled<SystemStack> {
    pool::get::<SystemStack>()
}
