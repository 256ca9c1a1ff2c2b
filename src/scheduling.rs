//! Scheduling Groups
//!
//! A scheduling group is a fixed set of worker threads cooperatively
//! running fibers together, sharing one timer worker. The scheduler proper
//! (run queues, work stealing) lives elsewhere; this module carries the
//! group identity: its size, which threads belong to it, and the
//! thread-local "current group" used by fiber and timer machinery.

use std::cell::Cell;
use std::sync::Arc;

thread_local! {
    static CURRENT_GROUP: Cell<Option<*const SchedulingGroup>> = const { Cell::new(None) };
    static CURRENT_WORKER_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// A fixed set of worker threads running fibers together.
pub struct SchedulingGroup {
    group_size: usize,
}

impl SchedulingGroup {
    /// Worker index the timer worker thread registers itself under.
    pub const TIMER_WORKER_INDEX: usize = usize::MAX;

    /// Create a scheduling group of `group_size` worker threads (the timer
    /// worker not included).
    pub fn new(group_size: usize) -> Arc<Self> {
        Arc::new(Self { group_size })
    }

    /// Number of worker threads in this group, the timer worker excluded.
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Register the calling thread as worker `index` of this group. After
    /// this call [`SchedulingGroup::current`] works on this thread.
    pub fn enter_group(self: &Arc<Self>, index: usize) {
        assert!(
            index < self.group_size || index == Self::TIMER_WORKER_INDEX,
            "Worker index {} is out of range for a group of {} workers.",
            index,
            self.group_size,
        );
        CURRENT_GROUP.with(|g| {
            assert!(
                g.get().is_none(),
                "This thread already belongs to a scheduling group.",
            );
            // Keep a reference alive for as long as the thread stays in the
            // group; `leave_group` reclaims it.
            g.set(Some(Arc::into_raw(Arc::clone(self))));
        });
        CURRENT_WORKER_INDEX.with(|i| i.set(index));
    }

    /// Deregister the calling thread. Called on worker-thread exit.
    pub fn leave_group() {
        CURRENT_GROUP.with(|g| {
            let ptr = g
                .take()
                .unwrap_or_else(|| panic!("This thread belongs to no scheduling group."));
            // Safety: produced by `Arc::into_raw` in `enter_group`.
            unsafe { drop(Arc::from_raw(ptr)) };
        });
        CURRENT_WORKER_INDEX.with(|i| i.set(usize::MAX));
    }

    /// The group the calling thread entered, if any.
    pub fn current() -> Option<Arc<SchedulingGroup>> {
        CURRENT_GROUP.with(|g| {
            g.get().map(|ptr| {
                // Safety: the raw reference stored by `enter_group` is still
                // owned by the TLS slot; clone without consuming it.
                unsafe {
                    Arc::increment_strong_count(ptr);
                    Arc::from_raw(ptr)
                }
            })
        })
    }

    /// Index the calling thread registered under, if it entered a group.
    pub fn current_worker_index() -> Option<usize> {
        CURRENT_WORKER_INDEX.with(|i| match i.get() {
            usize::MAX => None,
            index => Some(index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_leave_round_trip() {
        std::thread::spawn(|| {
            assert!(SchedulingGroup::current().is_none());
            let group = SchedulingGroup::new(4);
            group.enter_group(2);
            let current = SchedulingGroup::current().unwrap();
            assert!(Arc::ptr_eq(&current, &group));
            assert_eq!(SchedulingGroup::current_worker_index(), Some(2));
            drop(current);
            SchedulingGroup::leave_group();
            assert!(SchedulingGroup::current().is_none());
            // The TLS reference is gone; ours is the only one left.
            assert_eq!(Arc::strong_count(&group), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bogus_worker_index_rejected() {
        let group = SchedulingGroup::new(2);
        group.enter_group(5);
    }
}
