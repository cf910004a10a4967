//! The worker thread main loop.
//!
//! A worker cycles through three modes: hunting (local queue, then global,
//! then stealing from peers), spinning (a bounded backoff when a hunt comes
//! up empty), and sleeping (parked on the registry's wakeup event). The
//! spin-to-sleep handoff is where wakeups could be lost, so the epoch
//! snapshot is taken before the final recheck; see
//! [`QueueRegistry::sleep`](crate::registry::QueueRegistry::sleep).
use super::{execute_task, Core, WorkerContext};
use crate::task::TaskRef;
use crate::util::Backoff;

use core::sync::atomic::Ordering::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// How many empty hunts a worker tolerates, spinning between them, before it
/// goes to sleep.
const SPIN_ROUNDS: u32 = 64;

/// Distinct per-worker spin paddings, indexed by worker id modulo the table.
/// Workers that go idle together drift apart instead of hammering the queues
/// in lockstep.
const SPIN_STAGGER: [u32; 8] = [2, 3, 5, 7, 11, 13, 17, 19];

pub(super) fn run(core: Arc<Core>, index: usize) {
    let span = tracing::debug_span!("worker", index);
    let _entered = span.enter();

    let context = core.install_context();
    tracing::debug!("worker running");

    let stagger = SPIN_STAGGER[index % SPIN_STAGGER.len()];
    let mut spins = 0;
    let mut backoff = Backoff::new();
    let mut idle = None;
    while core.active_workers.load(SeqCst) != 0 {
        if let Some(task) = hunt(&context) {
            drop(idle.take());
            run_task(task, &context);
            spins = 0;
            backoff = Backoff::new();
            continue;
        }

        // Out of work. Advertise it from the first empty hunt, spinning
        // included, so a producer deciding whether to wake someone can see
        // this worker; the scope is left the moment a hunt succeeds.
        if idle.is_none() {
            idle = Some(core.registry.out_of_work_scope());
        }

        spins += 1;
        if spins < SPIN_ROUNDS {
            for _ in 0..stagger {
                core::hint::spin_loop();
            }
            backoff.spin();
            continue;
        }

        // Out of spin budget. Snapshot the wakeup epoch and recheck once
        // more; any enqueue that lands after the snapshot moves the epoch,
        // and `sleep` will not park.
        let snapshot = core.registry.sleep_epoch();
        if let Some(task) = hunt(&context) {
            drop(idle.take());
            run_task(task, &context);
            spins = 0;
            backoff = Backoff::new();
            continue;
        }
        if core.active_workers.load(SeqCst) == 0 {
            break;
        }
        tracing::trace!("worker sleeping");
        core.registry.sleep(snapshot);
        drop(idle.take());
        tracing::trace!("worker woke");

        // One wake may stand for many enqueues. If shared work remains and
        // someone is still idle, pass the wake along.
        if core.registry.has_global_work() && core.registry.has_idle_workers() {
            core.registry.wake_one();
        }
        spins = 0;
        backoff = Backoff::new();
    }

    drop(idle);
    core.remove_context();
    tracing::debug!("worker stopped");
}

/// One pass over the queues in local, global, steal order.
fn hunt(context: &WorkerContext) -> Option<TaskRef> {
    context
        .queue
        .dequeue_local()
        .or_else(|| context.queue.dequeue_global())
        .or_else(|| context.queue.dequeue_steal())
}

fn run_task(task: TaskRef, context: &WorkerContext) {
    // Complete the task even if its body panics; the owner may be
    // busy-waiting on `is_completed` and must not wedge. The worker itself
    // survives and keeps draining.
    if panic::catch_unwind(AssertUnwindSafe(|| execute_task(task, Some(context)))).is_err() {
        tracing::error!("a task body panicked; the worker is continuing");
    }
}
