//! Writing Buffer List
//!
//! An MPSC queue of outbound byte buffers for one connection. Any number of
//! threads may [`append`](WritingBufferList::append) concurrently without
//! blocking (one atomic exchange on the tail); exactly one thread at a time
//! drains it with [`flush_to`](WritingBufferList::flush_to), which builds a
//! bounded scatter/gather array and issues a single vectored write.
//!
//! The append protocol leaves a short window between "tail swapped" and
//! "predecessor's `next` linked". The flush path bridges it by spinning on
//! the `next` pointer, never by blocking.

use std::io::{self, IoSlice};
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes};

use crate::pool::{self, PoolKind, Poolable, Pooled};

/// Upper bound on the scatter/gather array handed to one vectored write,
/// mirroring the kernel's `IOV_MAX`.
const MAX_IOV: usize = 1024;

/// Byte sink accepting vectored writes; the transport side of
/// [`WritingBufferList::flush_to`].
pub trait StreamIo {
    /// Write out as much of `bufs` as possible. `Ok(0)` is interpreted as
    /// the peer having gone away.
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
}

impl StreamIo for Vec<u8> {
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut written = 0;
        for buf in bufs {
            self.extend_from_slice(buf);
            written += buf.len();
        }
        Ok(written)
    }
}

/// Outcome of one flush.
#[derive(Debug)]
pub enum FlushStatus {
    Flushed {
        written: usize,
        /// The list was fully drained by this flush.
        emptied: bool,
        /// The transport accepted fewer bytes than offered (saturation, or
        /// for sockets likely a closing peer).
        short_write: bool,
    },
    /// The transport wrote zero bytes; the connection is presumably gone.
    Closed,
    Failed(io::Error),
}

struct Node {
    next: AtomicPtr<Node>,
    buffer: VecDeque<Bytes>,
    ctx: u64,
}

impl Poolable for Node {
    const KIND: PoolKind = PoolKind::NodeShared;
    const LOW_WATER_MARK: usize = 8192;
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 2048;
    const TRANSFER_BATCH_SIZE: usize = 2048;

    fn create() -> Self {
        Node {
            next: AtomicPtr::new(ptr::null_mut()),
            buffer: VecDeque::new(),
            ctx: 0,
        }
    }

    fn on_put(&mut self) {
        // Don't hold payload bytes hostage while the node idles in the
        // pool.
        self.buffer.clear();
    }
}

/// MPSC writing buffer queue. See the module docs.
#[repr(align(64))]
pub struct WritingBufferList {
    /// Where the last flush left off. Mutated by the (single) flusher, and
    /// by `append` only when it appends to an empty list.
    head: AtomicPtr<Node>,
    /// The last node, atomically exchanged by producers. Null iff the list
    /// is empty.
    tail: AtomicPtr<Node>,
}

impl WritingBufferList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            // `head` stays stale while the list is empty; the next
            // `append` reinitializes it.
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Queue `buffer` for writing. `ctx` is reported back by
    /// [`flush_to`](Self::flush_to) once the buffer is fully written out.
    ///
    /// Returns true if the list was empty, i.e. the caller must kick off a
    /// flush.
    pub fn append(&self, buffer: impl IntoIterator<Item = Bytes>, ctx: u64) -> bool {
        let mut node = pool::get::<Node>();
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.buffer.extend(buffer);
        node.ctx = ctx;
        let node = node.into_raw(); // Freed on dequeue.

        let prev = self.tail.swap(node, Ordering::AcqRel);
        if prev.is_null() {
            // The list was empty; we're the new head, and the caller is in
            // charge of starting a flush.
            self.head.store(node, Ordering::Release);
        } else {
            // Chain ourselves behind the old tail. Until this store lands,
            // the flusher can observe `tail != old tail` with the link
            // still null; it spins for us.
            debug_assert!(unsafe { (*prev).next.load(Ordering::Acquire) }.is_null());
            unsafe { (*prev).next.store(node, Ordering::Release) };
        }
        prev.is_null()
    }

    /// Write queued buffers into `io`, at most `max_bytes` bytes. Contexts
    /// of fully-written buffers are pushed onto `flushed_ctxs` in append
    /// order.
    ///
    /// At most one thread may flush a given list at a time; that exclusion
    /// is the caller's responsibility. Must not be called on an empty list
    /// (`append` returned true and no flush has drained it since).
    pub fn flush_to(
        &self,
        io: &mut dyn StreamIo,
        max_bytes: usize,
        flushed_ctxs: &mut Vec<u64>,
    ) -> FlushStatus {
        let mut iov: Vec<IoSlice<'_>> = Vec::new();
        let mut flushing = 0usize;

        let head = self.head.load(Ordering::Acquire);
        assert!(!head.is_null(), "The buffer is empty.");
        assert!(
            !self.tail.load(Ordering::Relaxed).is_null(),
            "The buffer is empty."
        );

        // Concurrent appends may slip in after this walk; missing them
        // costs a little throughput, never correctness.
        unsafe {
            let mut current = head;
            'collect: while !current.is_null() {
                for seg in &(*current).buffer {
                    if iov.len() == MAX_IOV || flushing >= max_bytes {
                        break 'collect;
                    }
                    // Safety: the node (and its bytes) outlives the write
                    // below; nothing is released before then.
                    iov.push(IoSlice::new(std::slice::from_raw_parts(
                        seg.as_ptr(),
                        seg.len(),
                    )));
                    flushing += seg.len();
                }
                current = (*current).next.load(Ordering::Acquire);
            }
        }

        // The last slice may have pushed us over budget; trim it so that
        // exactly `max_bytes` is offered.
        if flushing > max_bytes {
            let excess = flushing - max_bytes;
            let last = &iov[iov.len() - 1];
            let trimmed = last.len() - excess;
            let base = last.as_ptr();
            let index = iov.len() - 1;
            // Safety: shrinking an existing slice.
            iov[index] = IoSlice::new(unsafe { std::slice::from_raw_parts(base, trimmed) });
            flushing = max_bytes;
        }

        let written = match io.writev(&iov) {
            Ok(0) => return FlushStatus::Closed,
            Ok(n) => n,
            Err(e) => return FlushStatus::Failed(e),
        };
        assert!(written <= flushing);

        // Rewind: release fully-written nodes, adjust the partial one.
        // `head` cannot have moved; we're the only flusher.
        let mut remaining = written;
        let mut drained = false;
        unsafe {
            let mut current = head;
            while !current.is_null() {
                let byte_size: usize = (*current).buffer.iter().map(Bytes::len).sum();
                if byte_size > remaining {
                    // Partially flushed; skip what was written and leave
                    // the node at the head.
                    let buffer = &mut (*current).buffer;
                    while remaining > 0 {
                        let front = &mut buffer[0];
                        if front.len() <= remaining {
                            remaining -= front.len();
                            buffer.pop_front();
                        } else {
                            front.advance(remaining);
                            remaining = 0;
                        }
                    }
                    self.head.store(current, Ordering::Release);
                    break;
                }

                // This whole buffer went out.
                remaining -= byte_size;
                flushed_ctxs.push((*current).ctx);
                let next = (*current).next.load(Ordering::Acquire);
                if !next.is_null() {
                    drop(Pooled::<Node>::from_raw(current));
                    current = next;
                    continue;
                }

                // We've likely drained the list.
                assert_eq!(remaining, 0, "Wrote out more than what we have.");
                if self
                    .tail
                    .compare_exchange(current, ptr::null_mut(), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Marked empty; `head` is reset by the next `append`.
                    drained = true;
                } else {
                    // A concurrent appender beat us to `tail`. Wait for it
                    // to finish linking, then adopt its node as the head.
                    let successor = loop {
                        let p = (*current).next.load(Ordering::Acquire);
                        if !p.is_null() {
                            break p;
                        }
                        std::hint::spin_loop();
                    };
                    self.head.store(successor, Ordering::Release);
                }
                drop(Pooled::<Node>::from_raw(current));
                break;
            }
        }

        FlushStatus::Flushed {
            written,
            emptied: drained,
            short_write: written != flushing,
        }
    }
}

impl Default for WritingBufferList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WritingBufferList {
    fn drop(&mut self) {
        // `flush_to` may have left `head` stale (it defers the fix to the
        // next `append`); appending an empty sentinel repairs it.
        self.append(std::iter::empty(), 0);

        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Acquire) };
            drop(unsafe { Pooled::<Node>::from_raw(current) });
            current = next;
        }
    }
}
