//! Timer Worker
//!
//! One dedicated thread per scheduling group fires timers with minimal
//! cross-thread coordination. Producers never touch the central state:
//! every participating thread owns a small spinlocked queue, and the worker
//! thread periodically reaps all of them into a private min-heap ordered by
//! expiration. The only cross-thread signal is "an earlier timer showed
//! up", delivered through a shared next-wakeup word plus a condition
//! variable.
//!
//! # Timer identity
//!
//! A timer handle is the address of its reference-counted entry.
//! [`TimerWorker::create_timer`] returns the handle with one reference held
//! by the caller; [`TimerWorker::enable_timer`] adds the worker's
//! reference. The caller releases its reference with either
//! [`TimerWorker::remove_timer`] (cancels) or
//! [`TimerWorker::detach_timer`] (fire-and-forget).

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::scheduling::SchedulingGroup;
use crate::sync::Spinlock;
use crate::time;
use crate::warn_once;

/// Fired with the timer's own handle, possibly repeatedly for periodic
/// timers.
pub type TimerCallback = Box<dyn FnMut(u64) + Send>;

/// Initial expirations further in the past than this are corrected to
/// "now" instead of producing a burst of catch-up fires.
const STALE_EXPIRATION_TOLERANCE: Duration = Duration::from_secs(10);

struct Entry {
    /// Protects the callback. Firing and cancellation both take it, so a
    /// cancelled-but-already-dequeued timer fires at most once more.
    cb: Spinlock<Option<TimerCallback>>,
    cancelled: AtomicBool,
    periodic: bool,
    /// Nanoseconds since the process anchor. Re-armed (worker thread only)
    /// for periodic timers.
    expires_at: AtomicU64,
    interval: Duration,
    owner: *const TimerWorker,
}

// Safety: `owner` is only ever compared, never dereferenced, and the rest
// of the entry is synchronized by the spinlock and atomics above.
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

/// Heap element. The expiration is snapshotted at insertion time so
/// re-arming cannot disturb heap order.
struct HeapEntry {
    expires_at: u64,
    timer: Arc<Entry>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `BinaryHeap` is a max-heap; reverse for earliest-first.
        other.expires_at.cmp(&self.expires_at)
    }
}

struct ProducerState {
    timers: Vec<Arc<Entry>>,
    /// Cached earliest expiration among `timers`, so enabling a timer that
    /// fires later than everything already queued skips the wakeup path.
    earliest: u64,
}

struct ProducerQueue {
    // Spinlocked: critical sections are short, though they may allocate
    // (the `Vec` push). Contention is expected to be negligible.
    state: Spinlock<ProducerState>,
}

impl ProducerQueue {
    fn new() -> Self {
        Self {
            state: Spinlock::new(ProducerState {
                timers: Vec::new(),
                earliest: u64::MAX,
            }),
        }
    }
}

thread_local! {
    static TLS_QUEUE: RefCell<Option<Arc<ProducerQueue>>> = const { RefCell::new(None) };
}

struct Latch {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut count = self.count.lock();
        assert!(*count > 0, "Latch counted down too many times.");
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cv.wait(&mut count);
        }
    }
}

/// The dedicated timer thread of one scheduling group.
pub struct TimerWorker {
    group: Arc<SchedulingGroup>,
    stopped: AtomicBool,
    /// Waits for every group worker (plus our own thread) to register its
    /// producer queue before the reap loop starts.
    registration: Latch,
    producers: Box<[OnceLock<Arc<ProducerQueue>>]>,
    /// Earliest wakeup the worker thread currently intends to honor, as
    /// nanoseconds since the anchor. `u64::MAX` means "no timer pending".
    next_expires_at: AtomicU64,
    /// `cv` sleeps under this; producers take it when moving
    /// `next_expires_at` earlier so wakeups cannot be lost.
    lock: Mutex<()>,
    cv: Condvar,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerWorker {
    pub fn new(group: Arc<SchedulingGroup>) -> Arc<Self> {
        // `+ 1` for the timer worker thread itself.
        let slots = group.group_size() + 1;
        Arc::new(Self {
            group,
            stopped: AtomicBool::new(false),
            registration: Latch::new(slots),
            producers: (0..slots).map(|_| OnceLock::new()).collect(),
            next_expires_at: AtomicU64::new(u64::MAX),
            lock: Mutex::new(()),
            cv: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    /// The worker a timer handle belongs to.
    ///
    /// # Safety
    ///
    /// `timer_id` must be a live handle returned by
    /// [`create_timer`](Self::create_timer).
    pub unsafe fn timer_owner(timer_id: u64) -> *const TimerWorker {
        (*(timer_id as *const Entry)).owner
    }

    /// Create a one-shot timer. It does not run until
    /// [`enable_timer`](Self::enable_timer) is called.
    pub fn create_timer(
        self: &Arc<Self>,
        expires_at: Instant,
        cb: impl FnMut(u64) + Send + 'static,
    ) -> u64 {
        self.make_entry(expires_at, None, Box::new(cb))
    }

    /// Create a periodic timer firing first at `initial_expires_at`, then
    /// every `interval` after the previous expiration (not after the
    /// previous fire, so there is no drift).
    pub fn create_periodic_timer(
        self: &Arc<Self>,
        initial_expires_at: Instant,
        interval: Duration,
        cb: impl FnMut(u64) + Send + 'static,
    ) -> u64 {
        assert!(
            interval > Duration::ZERO,
            "`interval` must be greater than 0 for periodic timers."
        );
        let mut initial = initial_expires_at;
        if Instant::now() > initial + STALE_EXPIRATION_TOLERANCE {
            warn_once!("`initial_expires_at` was specified as long ago. Corrected to now.");
            initial = Instant::now();
        }
        self.make_entry(initial, Some(interval), Box::new(cb))
    }

    fn make_entry(
        self: &Arc<Self>,
        expires_at: Instant,
        interval: Option<Duration>,
        cb: TimerCallback,
    ) -> u64 {
        let entry = Arc::new(Entry {
            cb: Spinlock::new(Some(cb)),
            cancelled: AtomicBool::new(false),
            periodic: interval.is_some(),
            expires_at: AtomicU64::new(time::instant_to_nanos(expires_at)),
            interval: interval.unwrap_or(Duration::ZERO),
            owner: Arc::as_ptr(self),
        });
        // The single reference is the caller's until `enable_timer`.
        Arc::into_raw(entry) as u64
    }

    /// Register a previously created timer with this thread's producer
    /// queue. The worker holds its own reference from here on.
    ///
    /// # Safety
    ///
    /// `timer_id` must be a handle returned by
    /// [`create_timer`](Self::create_timer) on this worker, not yet removed
    /// or detached, and enabled at most once.
    pub unsafe fn enable_timer(&self, timer_id: u64) {
        let ptr = timer_id as *const Entry;
        assert!(
            std::ptr::eq((*ptr).owner, self),
            "The timer you're trying to enable does not belong to this timer worker."
        );
        // One reference for the caller, one for us.
        Arc::increment_strong_count(ptr);
        let entry = Arc::from_raw(ptr);
        // At first enable exactly two references exist: the caller's and
        // ours. Any other count means the handle was enabled before.
        debug_assert_eq!(
            Arc::strong_count(&entry),
            2,
            "The timer has been enabled already."
        );
        self.add_timer(entry);
    }

    /// Cancel a timer and release the caller's reference. An already
    /// dequeued firing may still complete once.
    ///
    /// # Safety
    ///
    /// `timer_id` must be a live handle owned by the caller; it is consumed
    /// by this call.
    pub unsafe fn remove_timer(&self, timer_id: u64) {
        let entry = Arc::from_raw(timer_id as *const Entry);
        assert!(
            std::ptr::eq(entry.owner, self),
            "The timer you're trying to remove does not belong to this timer worker."
        );
        let cb = {
            let mut cb = entry.cb.lock();
            entry.cancelled.store(true, Ordering::Relaxed);
            cb.take()
        };
        drop(cb); // User state is released outside the entry's lock.
    }

    /// Release the caller's reference without cancelling; the timer fires
    /// on its own and is reclaimed naturally. Helpful for fire-and-forget.
    ///
    /// # Safety
    ///
    /// Same handle requirements as [`remove_timer`](Self::remove_timer).
    pub unsafe fn detach_timer(&self, timer_id: u64) {
        let entry = Arc::from_raw(timer_id as *const Entry);
        assert!(
            std::ptr::eq(entry.owner, self),
            "The timer you're trying to detach does not belong to this timer worker."
        );
    }

    /// Register the calling thread as producer `worker_index`. Must be
    /// called once by every worker thread of the owning scheduling group
    /// before it enables timers.
    pub fn initialize_local_queue(&self, worker_index: usize) {
        let index = if worker_index == SchedulingGroup::TIMER_WORKER_INDEX {
            self.group.group_size()
        } else {
            worker_index
        };
        assert!(
            index < self.producers.len(),
            "Worker index {} is out of range.",
            index
        );
        let queue = TLS_QUEUE.with(|q| {
            Arc::clone(q.borrow_mut().get_or_insert_with(|| Arc::new(ProducerQueue::new())))
        });
        if self.producers[index].set(queue).is_err() {
            panic!("Someone else has registered itself as worker #{}.", index);
        }
        self.registration.count_down();
    }

    /// Start the worker thread.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("filament-timer".into())
            .spawn(move || this.worker_proc())
            .unwrap_or_else(|e| panic!("Cannot spawn the timer worker thread: {}.", e));
        *self.worker.lock() = Some(handle);
    }

    /// Ask the worker thread to stop. Pending timers are dropped unfired.
    pub fn stop(&self) {
        let _guard = self.lock.lock();
        self.stopped.store(true, Ordering::Relaxed);
        self.cv.notify_one();
    }

    /// Join the worker thread. Call after [`stop`](Self::stop).
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn worker_proc(self: Arc<Self>) {
        self.group.enter_group(SchedulingGroup::TIMER_WORKER_INDEX);
        self.initialize_local_queue(SchedulingGroup::TIMER_WORKER_INDEX);
        self.registration.wait(); // Wait for the group's workers to come in.

        // The heap is exclusively ours; no lock around it.
        let mut timers = BinaryHeap::new();
        while !self.stopped.load(Ordering::Relaxed) {
            // Reset the marker before reaping. If we reset it later, a
            // producer inserting a timer that fires later than the stale
            // marker would skip waking us, delaying that timer.
            self.next_expires_at.store(u64::MAX, Ordering::Relaxed);

            self.reap_producer_queues(&mut timers);
            self.fire_timers(&mut timers);

            if let Some(top) = timers.peek() {
                // Not a plain store: a producer may have queued something
                // earlier than our heap top while we were firing.
                self.wake_worker_if_needed(top.expires_at);
            }

            let mut guard = self.lock.lock();
            let expected = self.next_expires_at.load(Ordering::Relaxed);
            let deadline = sleep_deadline(expected);
            // Wake early if someone moved `next_expires_at`: an earlier
            // timer arrived and our deadline is stale.
            while self.next_expires_at.load(Ordering::Relaxed) == expected
                && !self.stopped.load(Ordering::Relaxed)
            {
                if self.cv.wait_until(&mut guard, deadline).timed_out() {
                    break;
                }
            }
        }
        SchedulingGroup::leave_group();
    }

    fn reap_producer_queues(&self, timers: &mut BinaryHeap<HeapEntry>) {
        for slot in self.producers.iter() {
            let Some(queue) = slot.get() else { continue };
            let drained = {
                let mut state = queue.state.lock();
                state.earliest = u64::MAX;
                mem::take(&mut state.timers)
            };
            for timer in drained {
                if timer.cancelled.load(Ordering::Relaxed) {
                    continue;
                }
                timers.push(HeapEntry {
                    expires_at: timer.expires_at.load(Ordering::Relaxed),
                    timer,
                });
            }
        }
    }

    fn fire_timers(&self, timers: &mut BinaryHeap<HeapEntry>) {
        let now = time::since_start_nanos();
        while let Some(top) = timers.peek() {
            if top.timer.cancelled.load(Ordering::Relaxed) {
                timers.pop();
                continue;
            }
            if top.expires_at > now {
                break;
            }
            let HeapEntry { expires_at, timer } = match timers.pop() {
                Some(entry) => entry,
                None => break,
            };

            // Take the callback under the entry's lock, run it outside.
            let cb = timer.cb.lock().take();
            let Some(mut cb) = cb else {
                // Cancelled between our `cancelled` test and grabbing the
                // lock; drop the entry silently.
                continue;
            };
            cb(Arc::as_ptr(&timer) as u64);

            if timer.periodic {
                // Re-arm relative to the previous expiration. The entry is
                // reused: callers hold its address as the timer's identity.
                let mut slot = timer.cb.lock();
                if !timer.cancelled.load(Ordering::Relaxed) {
                    let next = expires_at + timer.interval.as_nanos() as u64;
                    timer.expires_at.store(next, Ordering::Relaxed);
                    *slot = Some(cb);
                    drop(slot);
                    timers.push(HeapEntry {
                        expires_at: next,
                        timer,
                    });
                }
                // Cancelled during its own callback: the worker's
                // reference dies here.
            }
        }
    }

    fn add_timer(&self, timer: Arc<Entry>) {
        let queue = TLS_QUEUE.with(|q| q.borrow().clone());
        let Some(queue) = queue else {
            panic!(
                "You must register this thread's producer queue \
                 (`initialize_local_queue`) before enabling timers."
            );
        };
        let expires_at = timer.expires_at.load(Ordering::Relaxed);
        let mut state = queue.state.lock();
        state.timers.push(timer);
        if state.earliest > expires_at {
            state.earliest = expires_at;
            drop(state);
            self.wake_worker_if_needed(expires_at);
        }
    }

    fn wake_worker_if_needed(&self, expires_at: u64) {
        let mut current = self.next_expires_at.load(Ordering::Relaxed);
        loop {
            if current <= expires_at {
                return; // The worker wakes early enough already.
            }
            // The lock is required: without it we could notify after the
            // worker tested `next_expires_at` but before it went to sleep,
            // losing the wakeup.
            let _guard = self.lock.lock();
            match self.next_expires_at.compare_exchange_weak(
                current,
                expires_at,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.cv.notify_one();
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

fn sleep_deadline(expected: u64) -> Instant {
    if expected == u64::MAX {
        // No timer pending; any large timeout does.
        Instant::now() + Duration::from_secs(10000)
    } else {
        time::offset_to_instant(Duration::from_nanos(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn start_worker() -> Arc<TimerWorker> {
        let group = SchedulingGroup::new(1);
        let worker = TimerWorker::new(group);
        worker.start();
        worker.initialize_local_queue(0);
        worker
    }

    #[test]
    fn test_one_shot_fires_exactly_once() {
        let worker = start_worker();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = worker.create_timer(Instant::now(), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        unsafe { worker.enable_timer(id) };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        unsafe { worker.detach_timer(id) };
        worker.stop();
        worker.join();
    }

    #[test]
    fn test_removed_timer_never_fires() {
        let worker = start_worker();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = worker.create_timer(Instant::now() + Duration::from_secs(3600), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        unsafe {
            worker.enable_timer(id);
            worker.remove_timer(id);
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        worker.stop();
        worker.join();
    }

    #[test]
    fn test_firing_follows_expiration_order() {
        let worker = start_worker();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        let mut ids = Vec::new();
        // Enable out of order; the heap must still fire ascending.
        for delay_ms in [30u64, 10, 20] {
            let order = order.clone();
            let id = worker.create_timer(now + Duration::from_millis(delay_ms), move |_| {
                order.lock().push(delay_ms);
            });
            unsafe { worker.enable_timer(id) };
            ids.push(id);
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock(), [10, 20, 30]);
        for id in ids {
            unsafe { worker.detach_timer(id) };
        }
        worker.stop();
        worker.join();
    }

    #[test]
    fn test_periodic_and_cancellation_mix() {
        let worker = start_worker();
        let periodic_fires = Arc::new(AtomicUsize::new(0));
        let oneshot_fires = Arc::new(AtomicUsize::new(0));
        let cancelled_fires = Arc::new(AtomicUsize::new(0));

        let c = periodic_fires.clone();
        let periodic = worker.create_periodic_timer(
            Instant::now(),
            Duration::from_millis(1),
            move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            },
        );
        let c = oneshot_fires.clone();
        let oneshot = worker.create_timer(Instant::now(), move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        let c = cancelled_fires.clone();
        let never = worker.create_timer(Instant::now() + Duration::from_secs(3600), move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        unsafe {
            worker.enable_timer(periodic);
            worker.enable_timer(oneshot);
            worker.enable_timer(never);
            worker.remove_timer(never);
        }

        thread::sleep(Duration::from_millis(200));
        // ~200 expected; allow generous scheduling slack.
        assert!(periodic_fires.load(Ordering::Relaxed) >= 50);
        assert_eq!(oneshot_fires.load(Ordering::Relaxed), 1);
        assert_eq!(cancelled_fires.load(Ordering::Relaxed), 0);

        unsafe {
            worker.remove_timer(periodic);
            worker.detach_timer(oneshot);
        }
        worker.stop();
        worker.join();
    }

    #[test]
    #[should_panic(expected = "does not belong to this timer worker")]
    fn test_enable_on_foreign_worker_rejected() {
        // Neither worker thread needs to run: the ownership check fires
        // before the timer reaches any producer queue.
        let ours = TimerWorker::new(SchedulingGroup::new(1));
        let other = TimerWorker::new(SchedulingGroup::new(1));
        let id = ours.create_timer(Instant::now(), |_| {});
        unsafe { other.enable_timer(id) };
    }

    #[test]
    fn test_stale_initial_expiration_corrected() {
        let worker = start_worker();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        // 60s in the past with a 1s interval: without correction this
        // would burst ~60 catch-up fires.
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(60))
            .unwrap_or_else(Instant::now);
        let id = worker.create_periodic_timer(long_ago, Duration::from_secs(1), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        unsafe { worker.enable_timer(id) };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        unsafe { worker.remove_timer(id) };
        worker.stop();
        worker.join();
    }
}
