//! # Filament Runtime Library
//!
//! The core substrate of a fiber-based RPC runtime:
//!
//! - **Fiber Entities**: cooperative user-space execution contexts with
//!   control blocks co-located on their own stacks
//! - **Stack Allocator**: pooled user stacks (guard pages) and system
//!   stacks (canary words)
//! - **Object Pool**: typed pooling with four backends, centered on the
//!   NUMA-node-shared backend with watermark-driven washout
//! - **Timer Worker**: per-scheduling-group timers, thread-local producer
//!   queues reaped into a central heap
//! - **Writing Buffer List**: lock-minimized MPSC outbound buffer chain
//!
//! ## Technical Standards
//!
//! Implementation follows these standards:
//!
//! - **Locks**: fast userspace locks per
//!   [parking_lot](https://docs.rs/parking_lot), plus a tiny spinlock for
//!   the shortest critical sections
//! - **Background channels**: MPMC channels per
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Buffers**: cheaply-cloneable byte segments per
//!   [bytes](https://docs.rs/bytes)
//! - **Stacks**: raw `mmap`/`mprotect`/`memalign` via
//!   [libc](https://docs.rs/libc)
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     FILAMENT RUNTIME                       │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  ┌────────────┐   ┌─────────────┐   ┌──────────────────┐  │
//! │  │   Fibers   │   │    Timers   │   │  Writing Buffers │  │
//! │  │ (fiber.rs) │   │  (timer.rs) │   │(writing_buffer.rs)│ │
//! │  └────────────┘   └─────────────┘   └──────────────────┘  │
//! │        │                                      │            │
//! │  ┌────────────┐   ┌────────────────────────────────────┐  │
//! │  │   Stacks   │──▶│            Object Pool             │  │
//! │  │ (stack.rs) │   │ (pool/: node_shared, thread_local) │  │
//! │  └────────────┘   └────────────────────────────────────┘  │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![warn(rust_2018_idioms)]

pub mod background;
pub mod config;
pub mod context;
pub mod fiber;
pub mod id_alloc;
pub mod log;
pub mod numa;
pub mod pool;
pub mod scheduling;
pub mod stack;
pub mod sync;
pub mod timer;
pub mod writing_buffer;

mod time;

// Re-exports
pub use config::{ConfigError, StackConfig, StackConfigBuilder};
pub use fiber::{
    create_fiber_entity, current_fiber_entity, free_fiber_entity, is_fiber_context_present,
    master_fiber_entity, set_up_master_fiber_entity, ExitBarrier, FiberEntity, FiberState,
};
pub use pool::{PoolKind, PoolStats, Poolable, Pooled};
pub use scheduling::SchedulingGroup;
pub use stack::{create_system_stack, create_user_stack, stack_registry, SystemStack, UserStack};
pub use sync::Spinlock;
pub use timer::TimerWorker;
pub use writing_buffer::{FlushStatus, StreamIo, WritingBufferList};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
