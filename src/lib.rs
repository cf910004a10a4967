//! A lock-free, work-stealing scheduler for short-lived tasks.
//!
//! `hypha` runs caller-owned [`Task`]s on a fixed pool of worker threads.
//! Producers enqueue tasks on per-thread local queues or a shared global
//! queue; idle workers steal from their peers, spin briefly, and park on an
//! event when no work exists. The hot path (publishing, claiming, and
//! completing a task) is a single-word atomic state machine updated only by
//! compare-and-swap; no locks are taken to launch or execute a task.
//!
//! # Scheduling model
//!
//! - Each [`Task`] is a caller-owned handle wrapping one deferred unit of
//!   work. The scheduler never allocates or frees task storage; a handle is
//!   reusable once [`Task::is_completed`] returns `true`.
//! - Workers hunt for work in local → global → steal order, preferring
//!   higher-[`Priority`] tasks within each queue.
//! - With no workers running, [`Scheduler::launch`] executes the task
//!   synchronously on the calling thread.
//! - [`Scheduler::busy_wait`] lets a waiting thread help drain the queues
//!   instead of parking, which avoids deadlock when the waiter is itself a
//!   worker.
//!
//! Most programs use the process-wide scheduler via [`init`], [`launch`],
//! [`busy_wait`], and [`shutdown`]; separate [`Scheduler`] instances can be
//! created for tests or isolated pools.
#![warn(missing_debug_implementations)]

#[macro_use]
mod util;
pub(crate) mod loom;

mod queue;
mod registry;
pub mod scheduler;
pub mod task;

pub use self::{
    scheduler::{
        QueuePreference, Scheduler, StdThreadFactory, ThreadFactory, ThreadPriority, WorkerSpec,
    },
    task::{Priority, Task},
};

use std::sync::OnceLock;

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

/// Returns the process-wide [`Scheduler`], constructing it (with no workers
/// started) on first use.
pub fn global() -> &'static Scheduler {
    GLOBAL.get_or_init(Scheduler::new)
}

/// Starts `num_workers` worker threads on the process-wide scheduler.
///
/// A `num_workers` of 0 selects the platform's available parallelism. This is
/// idempotent: if workers are already running, or the platform cannot spawn
/// threads (in which case every [`launch`] runs inline), this does nothing.
pub fn init(num_workers: usize, priority: ThreadPriority) {
    global().start_workers(num_workers, priority);
}

/// Stops the process-wide scheduler's workers, joining them and executing any
/// tasks still queued on the stopping thread.
pub fn shutdown() {
    global().stop_workers();
}

/// Launches `task` on the process-wide scheduler.
///
/// # Safety
///
/// `task` must not be moved, dropped, or re-initialized until
/// [`Task::is_completed`] returns `true`. See [`Scheduler::launch`].
pub unsafe fn launch(task: &Task, preference: QueuePreference) {
    global().launch(task, preference)
}

/// Runs queued tasks on the calling thread until `predicate` returns `true`.
///
/// See [`Scheduler::busy_wait`].
pub fn busy_wait(predicate: impl FnMut() -> bool) {
    global().busy_wait(predicate)
}
