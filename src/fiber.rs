//! Fiber Entities
//!
//! A fiber is one cooperatively-scheduled unit of execution with its own
//! stack. Its control block, [`FiberEntity`], is not heap-allocated: it is
//! placed at the top (highest addresses) of the fiber's own stack, so
//! creating a fiber costs exactly one stack acquisition. The runtime stack
//! starts right below the control block and grows down.
//!
//! # Lifecycle
//!
//! `Ready` -> `Running` -> `Dead`, no way back; a fiber runs its start
//! procedure exactly once. Death is the delicate part: a dying fiber cannot
//! free its own stack while still running on it, so it switches to the
//! master fiber (the thread's native context) with a pending resume
//! callback that performs the actual release there.
//!
//! # Resumption
//!
//! [`FiberEntity::resume_on`] combines "switch to this fiber" with "run
//! this callback on the target's stack before anything else." At most one
//! such callback may be pending per fiber, and a fiber may not resume
//! itself; both are fatal programming errors.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::context::{make_context, switch_context, Context};
use crate::id_alloc::{IdAllocator, IdCache};
use crate::scheduling::SchedulingGroup;
use crate::stack::{create_system_stack, create_user_stack, SystemStack, UserStack};
use crate::warn_once;
use crate::pool::Pooled;

/// Space reserved at the top of every fiber stack for the control block.
pub const FIBER_STACK_RESERVED_SIZE: usize = 512;

/// Number of fiber-local storage slots stored inline in the control block.
/// Indices beyond this fall back to a heap map, a magnitude slower.
pub const INLINE_FLS_SLOTS: usize = 8;

// "FILAMENT". Written when a fiber truly starts running, cleared on
// destruction; lets crash tooling distinguish "created but never ran" from
// "ran and died".
const FIBER_EVER_STARTED_MAGIC: u64 = 0x4649_4C41_4D45_4E54;

// A worker thread is not expected to create more than 128K fibers per
// second, so this batch keeps the shared counter cold.
static FIBER_ID_ALLOC: IdAllocator = IdAllocator::new(1, 131072);

thread_local! {
    static FIBER_ID_CACHE: RefCell<IdCache> = const { RefCell::new(IdCache::new()) };
    static CURRENT_FIBER: Cell<*mut FiberEntity> = const { Cell::new(std::ptr::null_mut()) };
    static MASTER_FIBER: Cell<*mut FiberEntity> = const { Cell::new(std::ptr::null_mut()) };
    static MASTER_FIBER_IMPL: RefCell<Option<Box<FiberEntity>>> = const { RefCell::new(None) };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    Ready,
    Running,
    Dead,
}

/// The stack a fiber entity lives on, returned to its pool on destruction.
enum StackHandle {
    User(Pooled<UserStack>),
    System(Pooled<SystemStack>),
}

impl StackHandle {
    fn bottom(&self) -> *mut u8 {
        match self {
            StackHandle::User(s) => s.bottom(),
            StackHandle::System(s) => s.bottom(),
        }
    }

    fn size(&self) -> usize {
        match self {
            StackHandle::User(s) => s.size(),
            StackHandle::System(s) => s.size(),
        }
    }
}

/// Control block of one fiber. Lives at the top of the fiber's stack.
#[repr(align(64))]
pub struct FiberEntity {
    /// Unique ID for debugging tooling. Never reused within a process.
    pub debugging_fiber_id: u64,
    ever_started_magic: u64,
    /// Set if this fiber was created as a system fiber (small stack, canary
    /// instead of guard page).
    pub system_fiber: bool,
    pub state: FiberState,
    context: Context,
    /// Usable runtime stack size, the reserved control-block region already
    /// subtracted. Zero for the master fiber.
    stack_size: usize,
    /// Run once on the fiber's own stack the next time it is switched to,
    /// before anything else.
    resume_proc: Option<Box<dyn FnOnce()>>,
    /// Entry point. Taken on first run.
    start_proc: Option<Box<dyn FnOnce()>>,
    /// Shared with whoever waits for this fiber's exit.
    pub exit_barrier: Option<Arc<ExitBarrier>>,
    scheduling_group: Option<Arc<SchedulingGroup>>,
    inline_fls: [Option<Box<dyn Any>>; INLINE_FLS_SLOTS],
    external_fls: Option<Box<HashMap<usize, Option<Box<dyn Any>>>>>,
    // Declared last: everything above must be gone before the stack (which
    // this whole struct lives on) is recycled.
    stack: Option<StackHandle>,
}

const _: () = assert!(mem::size_of::<FiberEntity>() <= FIBER_STACK_RESERVED_SIZE);
const _: () = assert!(FIBER_STACK_RESERVED_SIZE % mem::align_of::<FiberEntity>() == 0);

impl FiberEntity {
    fn master() -> Self {
        Self {
            debugging_fiber_id: u64::MAX,
            ever_started_magic: FIBER_EVER_STARTED_MAGIC,
            system_fiber: false,
            state: FiberState::Running,
            context: Context::empty(),
            stack_size: 0,
            resume_proc: None,
            start_proc: None,
            exit_barrier: None,
            scheduling_group: SchedulingGroup::current(),
            inline_fls: Default::default(),
            external_fls: None,
            stack: None,
        }
    }

    /// Highest address of the runtime stack (right below the control
    /// block). Undefined for the master fiber.
    pub fn stack_top(&self) -> *mut u8 {
        self as *const FiberEntity as *mut u8
    }

    /// Usable runtime stack size.
    pub fn stack_limit(&self) -> usize {
        self.stack_size
    }

    /// Scheduling group this fiber belongs to, if any.
    pub fn scheduling_group(&self) -> Option<&Arc<SchedulingGroup>> {
        self.scheduling_group.as_ref()
    }

    /// Switch to this fiber. Returns when something later switches back to
    /// the caller's context.
    ///
    /// # Safety
    ///
    /// `this` must point to a live fiber entity in state `Ready` (never
    /// started) or suspended mid-run, and no other thread may resume it
    /// concurrently.
    pub unsafe fn resume(this: *mut FiberEntity) {
        // Note the inconsistency: we're running on the *caller's* stack
        // here, not the one associated with `this`.
        let caller = current_fiber_entity();
        assert!(
            !caller.is_null(),
            "`resume` requires fiber context. Call `set_up_master_fiber_entity` first."
        );
        assert!(
            caller != this,
            "Calling `resume` on the current fiber is undefined."
        );
        switch_context(&mut (*caller).context, &(*this).context);

        // The caller is back.
        set_current_fiber_entity(caller);
        if let Some(cb) = (*caller).resume_proc.take() {
            cb();
        }
    }

    /// Run `cb` on this fiber's stack (before any of its own code), then
    /// let it continue.
    ///
    /// # Safety
    ///
    /// Same as [`FiberEntity::resume`].
    pub unsafe fn resume_on(this: *mut FiberEntity, cb: Box<dyn FnOnce()>) {
        assert!(
            (*this).resume_proc.is_none(),
            "You may not call `resume_on` on a fiber twice (before the first \
             one has executed)."
        );
        assert!(
            current_fiber_entity() != this,
            "Calling `resume_on` on the current fiber is undefined."
        );
        // Performed and cleared immediately after we switch to `this`,
        // before the fiber's own code runs.
        (*this).resume_proc = Some(cb);
        Self::resume(this);
    }

    /// Fiber-local storage slot `index`. The first [`INLINE_FLS_SLOTS`]
    /// indices are O(1); higher indices degrade to a map lookup.
    pub fn fls(&mut self, index: usize) -> &mut Option<Box<dyn Any>> {
        if index < INLINE_FLS_SLOTS {
            return &mut self.inline_fls[index];
        }
        self.fls_slow(index)
    }

    fn fls_slow(&mut self, index: usize) -> &mut Option<Box<dyn Any>> {
        warn_once!("Excessive fiber-local storage usage. Performance will likely degrade.");
        self.external_fls
            .get_or_insert_with(Default::default)
            .entry(index)
            .or_insert(None)
    }
}

/// Entry point of newly-started fibers. Runs on the fiber's own stack.
unsafe extern "C" fn fiber_proc(ctx: *mut u8) {
    let this = ctx as *mut FiberEntity;
    set_current_fiber_entity(this); // We're alive.
    (*this).state = FiberState::Running;
    (*this).ever_started_magic = FIBER_EVER_STARTED_MAGIC;

    // A resumption callback may be pending even before we had completely
    // started; run it first.
    if let Some(cb) = (*this).resume_proc.take() {
        cb();
    }
    match (*this).start_proc.take() {
        Some(start) => start(),
        None => panic!(
            "Fiber {} started without a start procedure.",
            (*this).debugging_fiber_id
        ),
    }

    assert!(
        this == current_fiber_entity(),
        "A fiber must exit on the thread context it was last resumed on."
    );
    let master = master_fiber_entity();

    // Is someone waiting for us to finish?
    match (*this).exit_barrier.take() {
        None => {
            // No one is; this is easy. Free our resources from the master
            // context, since our own stack is among them.
            (*this).state = FiberState::Dead;
            FiberEntity::resume_on(master, Box::new(move || unsafe { free_fiber_entity(this) }));
        }
        Some(barrier) => {
            // The barrier's lock must be taken *before* we run on the
            // master: the callback below cannot afford to block there.
            barrier.grab_lock();
            (*this).state = FiberState::Dead;
            FiberEntity::resume_on(
                master,
                Box::new(move || unsafe {
                    free_fiber_entity(this); // Good-bye.
                    barrier.count_down_locked();
                }),
            );
        }
    }
    unreachable!("A dead fiber was resumed.");
}

/// Create a fiber entity, placing its control block at the top of a stack
/// freshly drawn from the stack allocator.
///
/// The fiber does not run until it is resumed.
pub fn create_fiber_entity(
    scheduling_group: Option<Arc<SchedulingGroup>>,
    system_fiber: bool,
    start_proc: impl FnOnce() + 'static,
) -> *mut FiberEntity {
    let stack = if system_fiber {
        StackHandle::System(create_system_stack())
    } else {
        StackHandle::User(create_user_stack())
    };
    let bottom = stack.bottom();
    let total_size = stack.size();
    let entity = unsafe { bottom.sub(FIBER_STACK_RESERVED_SIZE) } as *mut FiberEntity;
    debug_assert_eq!(entity as usize % mem::align_of::<FiberEntity>(), 0);

    let id = FIBER_ID_CACHE.with(|c| c.borrow_mut().next(&FIBER_ID_ALLOC));
    unsafe {
        entity.write(FiberEntity {
            debugging_fiber_id: id,
            ever_started_magic: 0, // Filled when the fiber truly starts.
            system_fiber,
            state: FiberState::Ready,
            context: Context::empty(),
            stack_size: total_size - FIBER_STACK_RESERVED_SIZE,
            resume_proc: None,
            start_proc: Some(Box::new(start_proc)),
            exit_barrier: None,
            scheduling_group,
            inline_fls: Default::default(),
            external_fls: None,
            stack: Some(stack),
        });
        make_context(
            &mut (*entity).context,
            (*entity).stack_top(),
            fiber_proc,
            entity as *mut u8,
        );
    }
    entity
}

/// Destroy a fiber entity and recycle its stack.
///
/// # Safety
///
/// `fiber` must not be the calling fiber (its stack is being reclaimed),
/// must not be resumed again, and must not be freed twice.
pub unsafe fn free_fiber_entity(fiber: *mut FiberEntity) {
    (*fiber).ever_started_magic = 0;
    // Move the control block out of the stack it lives on; dropping it
    // releases the stack handle last (field order), after every other field
    // is gone.
    let entity = fiber.read();
    drop(entity);
}

/// Set up the master fiber (the thread's native execution context) for the
/// calling thread. Idempotent per thread.
pub fn set_up_master_fiber_entity() {
    MASTER_FIBER_IMPL.with(|slot| {
        let mut slot = slot.borrow_mut();
        let master = slot.get_or_insert_with(|| Box::new(FiberEntity::master()));
        let ptr = &mut **master as *mut FiberEntity;
        MASTER_FIBER.with(|m| m.set(ptr));
        set_current_fiber_entity(ptr);
    });
}

/// The calling thread's master fiber, or null if
/// [`set_up_master_fiber_entity`] has not run on this thread.
pub fn master_fiber_entity() -> *mut FiberEntity {
    MASTER_FIBER.with(|m| m.get())
}

/// The fiber currently executing on this thread, or null outside fiber
/// context.
pub fn current_fiber_entity() -> *mut FiberEntity {
    CURRENT_FIBER.with(|c| c.get())
}

pub(crate) fn set_current_fiber_entity(fiber: *mut FiberEntity) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

/// Mostly used for debugging purposes.
pub fn is_fiber_context_present() -> bool {
    !current_fiber_entity().is_null()
}

// ===========================================================================
// Exit barrier
// ===========================================================================

/// Lets one party block until a specific fiber has fully terminated.
/// Shared (reference-counted) between the fiber and its waiter, since
/// either side may be the last one standing.
pub struct ExitBarrier {
    count: Mutex<usize>,
    cv: Condvar,
}

impl ExitBarrier {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(1),
            cv: Condvar::new(),
        }
    }

    /// Acquire the lock [`count_down_locked`](Self::count_down_locked)
    /// expects, in advance. The dying fiber takes it before switching to
    /// the master context, where blocking is not an option.
    pub fn grab_lock(&self) {
        mem::forget(self.count.lock());
    }

    /// Count down and wake waiters. The lock taken by
    /// [`grab_lock`](Self::grab_lock) is released.
    ///
    /// # Safety
    ///
    /// The caller (or whoever handed the barrier over) must have called
    /// `grab_lock` exactly once before.
    pub unsafe fn count_down_locked(&self) {
        {
            // Safety: the lock is held per this function's contract.
            let count = &mut *self.count.data_ptr();
            assert!(*count > 0, "Exit barrier counted down twice.");
            *count -= 1;
            if *count == 0 {
                // Notify before unlocking; waiters re-check under the lock.
                self.cv.notify_all();
            }
        }
        self.count.force_unlock();
    }

    /// Block until the fiber this barrier belongs to has terminated.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cv.wait(&mut count);
        }
    }
}

impl Default for ExitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_destroy_never_started() {
        set_up_master_fiber_entity();
        for system in [false, true] {
            let fiber = create_fiber_entity(None, system, || {});
            unsafe {
                assert_eq!((*fiber).state, FiberState::Ready);
                assert!((*fiber).debugging_fiber_id > 0);
                assert!((*fiber).stack_limit() > 0);
                free_fiber_entity(fiber);
            }
        }
    }

    #[test]
    fn test_run_to_completion() {
        set_up_master_fiber_entity();
        static RUN: AtomicUsize = AtomicUsize::new(0);
        let fiber = create_fiber_entity(None, false, || {
            assert!(is_fiber_context_present());
            RUN.fetch_add(1, Ordering::Relaxed);
        });
        unsafe { FiberEntity::resume(fiber) };
        // The fiber ran exactly once and we're back on the master.
        assert_eq!(RUN.load(Ordering::Relaxed), 1);
        assert_eq!(current_fiber_entity(), master_fiber_entity());
    }

    #[test]
    fn test_resume_proc_runs_before_start_proc() {
        set_up_master_fiber_entity();
        let order = std::rc::Rc::new(RefCell::new(Vec::new()));
        let fiber = {
            let order = order.clone();
            create_fiber_entity(None, true, move || order.borrow_mut().push("start"))
        };
        let cb_order = order.clone();
        unsafe {
            FiberEntity::resume_on(fiber, Box::new(move || cb_order.borrow_mut().push("resume")));
        }
        assert_eq!(*order.borrow(), ["resume", "start"]);
    }

    #[test]
    fn test_exit_barrier_counts_down_on_death() {
        set_up_master_fiber_entity();
        let barrier = Arc::new(ExitBarrier::new());
        let fiber = create_fiber_entity(None, false, || {});
        unsafe {
            (*fiber).exit_barrier = Some(barrier.clone());
            FiberEntity::resume(fiber);
        }
        // The fiber is gone; the barrier must already be open.
        barrier.wait();
    }

    #[test]
    fn test_fls_inline_and_overflow() {
        set_up_master_fiber_entity();
        let fiber = create_fiber_entity(None, true, || {});
        unsafe {
            *(*fiber).fls(0) = Some(Box::new(42usize));
            *(*fiber).fls(INLINE_FLS_SLOTS + 3) = Some(Box::new("far".to_string()));
            let inline = (*fiber).fls(0).as_ref().and_then(|v| v.downcast_ref::<usize>());
            assert_eq!(inline, Some(&42));
            let far = (*fiber)
                .fls(INLINE_FLS_SLOTS + 3)
                .as_ref()
                .and_then(|v| v.downcast_ref::<String>());
            assert_eq!(far.map(String::as_str), Some("far"));
            free_fiber_entity(fiber);
        }
    }

    #[test]
    fn test_stack_writable_up_to_reserved_region() {
        set_up_master_fiber_entity();
        let fiber = create_fiber_entity(None, false, || {});
        unsafe {
            let top = (*fiber).stack_top();
            let limit = (*fiber).stack_limit();
            top.sub(limit).write_volatile(0xAA);
            top.sub(1).write_volatile(0xBB);
            free_fiber_entity(fiber);
        }
    }
}
