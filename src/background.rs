//! Background Task Host
//!
//! A small set of worker threads for runtime housekeeping that must not run
//! on caller threads: today that is the periodic pool washer's per-bucket
//! sweeps, which can destroy a batch of expensive objects. One worker per
//! NUMA node, fed from a shared unbounded channel.
//!
//! The host is started lazily and lives for the rest of the process; the
//! workers park on channel receive when idle, so an idle host costs
//! nothing.

use std::sync::OnceLock;
use std::thread;

use crossbeam_channel::{unbounded, Sender};

use crate::numa;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct BackgroundTaskHost {
    tx: Sender<Job>,
}

impl BackgroundTaskHost {
    fn start() -> Self {
        let (tx, rx) = unbounded::<Job>();
        let workers = numa::node_count().max(1);
        for index in 0..workers {
            let rx = rx.clone();
            let builder = thread::Builder::new().name(format!("filament-bg-{}", index));
            // Workers exit when every sender is gone; the host keeps one
            // sender alive for the process lifetime.
            if let Err(e) = builder.spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            }) {
                crate::log::error(format!("Failed to spawn background worker: {}", e));
            }
        }
        Self { tx }
    }

    fn instance() -> &'static BackgroundTaskHost {
        static INSTANCE: OnceLock<BackgroundTaskHost> = OnceLock::new();
        INSTANCE.get_or_init(BackgroundTaskHost::start)
    }
}

/// Queue a job for execution on a background worker.
pub(crate) fn queue(job: impl FnOnce() + Send + 'static) {
    // Send only fails if all receivers are gone, i.e. every worker thread
    // failed to spawn. Run inline then; correctness does not depend on
    // which thread the job runs on.
    if let Err(e) = BackgroundTaskHost::instance().tx.send(Box::new(job)) {
        (e.into_inner())();
    }
}
