//! The queue registry: the shared global queue, the set of registered local
//! queues, and the idle-worker wakeup protocol.
//!
//! Worker threads and producer threads do not discover each other directly;
//! everything shared goes through one `QueueRegistry` owned by the
//! scheduler. Stealing walks the registered queues round-robin, and the
//! sleep protocol is an epoch-stamped condvar so that a wakeup posted
//! between a worker's last queue check and its park cannot be lost.
use crate::queue::{ClassQueue, LocalQueue};
use crate::task::{Priority, TaskRef};

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering::*};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

/// Shared state connecting every queue the scheduler knows about.
pub(crate) struct QueueRegistry {
    /// The fallback queue for threads without a registered local queue, and
    /// the destination for work drained off a queue being deregistered.
    global: ClassQueue,

    /// Every currently registered local queue, steal victims included.
    ///
    /// Read-locked on the steal path, write-locked only by register and
    /// deregister. Queue churn is rare (thread startup and teardown), so the
    /// write lock is never contended in steady state.
    queues: RwLock<Vec<Arc<LocalQueue>>>,

    /// Round-robin cursor into `queues`, advanced per steal attempt so that
    /// thieves fan out over victims instead of ganging up on one.
    next_victim: AtomicUsize,

    /// Source of unique local queue ids.
    next_queue_id: AtomicUsize,

    /// The number of workers currently out of work (spinning or sleeping).
    ///
    /// SeqCst, pairing with the queues' task counters: a producer writes a
    /// task count then reads this, a worker writes this then re-reads the
    /// task counts. At least one side must see the other's write.
    out_of_work: AtomicUsize,

    /// Wakeup epoch. Bumped under the lock by every wake; a worker snapshots
    /// it before its final queue recheck and refuses to sleep if it has
    /// moved since.
    epoch: Mutex<u64>,
    wakeup: Condvar,
}

/// RAII guard marking the current worker as out of work for its lifetime.
#[must_use = "a worker is only counted as idle while the scope is held"]
pub(crate) struct OutOfWorkScope<'a> {
    registry: &'a QueueRegistry,
}

// === impl QueueRegistry ===

impl QueueRegistry {
    pub(crate) fn new() -> Self {
        Self {
            global: ClassQueue::new(),
            queues: RwLock::new(Vec::new()),
            next_victim: AtomicUsize::new(0),
            next_queue_id: AtomicUsize::new(0),
            out_of_work: AtomicUsize::new(0),
            epoch: Mutex::new(0),
            wakeup: Condvar::new(),
        }
    }

    /// Enqueues onto the shared global queue, returning `true` if it became
    /// non-empty.
    pub(crate) fn enqueue_global(&self, task: TaskRef, priority: Priority) -> bool {
        self.global.enqueue(task, priority)
    }

    /// Removes the highest-priority task from the shared global queue.
    pub(crate) fn dequeue_global(&self) -> Option<TaskRef> {
        self.global.dequeue()
    }

    pub(crate) fn has_global_work(&self) -> bool {
        self.global.has_work()
    }

    pub(crate) fn next_queue_id(&self) -> usize {
        self.next_queue_id.fetch_add(1, Relaxed)
    }

    /// Adds a local queue to the steal set.
    pub(crate) fn register(&self, queue: Arc<LocalQueue>) {
        let mut queues = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            queues.iter().all(|q| q.id() != queue.id()),
            "queue {} registered twice",
            queue.id(),
        );
        tracing::trace!(queue = queue.id(), "registering local queue");
        queues.push(queue);
    }

    /// Removes a local queue from the steal set. The caller is responsible
    /// for draining it first; anything still enqueued afterwards would be
    /// stranded.
    pub(crate) fn deregister(&self, id: usize) {
        let mut queues = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        queues.retain(|q| q.id() != id);
        tracing::trace!(queue = id, "deregistered local queue");
    }

    /// Steals one task from some registered queue other than the thief's
    /// own.
    ///
    /// Victims are visited round-robin starting from a shared cursor. A
    /// victim whose consumer side is busy is skipped, not waited on, so a
    /// full miss does not mean the queues were empty.
    pub(crate) fn steal_from_peer(&self, thief: Option<usize>) -> Option<TaskRef> {
        let queues = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let n = queues.len();
        if n == 0 {
            return None;
        }
        let start = self.next_victim.fetch_add(1, Relaxed) % n;
        for i in 0..n {
            let victim = &queues[(start + i) % n];
            if Some(victim.id()) == thief {
                continue;
            }
            if let Some(task) = victim.steal_one() {
                test_trace!(victim = victim.id(), ?thief, "stole task");
                return Some(task);
            }
        }
        None
    }

    /// Returns `true` if any registered queue (or the global queue) holds
    /// work.
    pub(crate) fn has_any_work(&self) -> bool {
        if self.global.has_work() {
            return true;
        }
        let queues = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        queues.iter().any(|q| q.has_work())
    }

    /// Marks the calling worker as out of work until the returned scope is
    /// dropped.
    pub(crate) fn out_of_work_scope(&self) -> OutOfWorkScope<'_> {
        self.out_of_work.fetch_add(1, SeqCst);
        OutOfWorkScope { registry: self }
    }

    /// Returns `true` if any worker is currently spinning or sleeping, i.e.
    /// a wake may be needed to get new work picked up.
    pub(crate) fn has_idle_workers(&self) -> bool {
        self.out_of_work.load(SeqCst) > 0
    }

    /// Snapshots the wakeup epoch. Must be taken *before* the caller's final
    /// queue recheck; [`sleep`](Self::sleep) then refuses to park if any
    /// wake has happened since the snapshot.
    pub(crate) fn sleep_epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks the calling thread until a wake moves the epoch past
    /// `snapshot`.
    ///
    /// Returns immediately if the epoch already moved: a producer that
    /// enqueued between the caller's recheck and this call has already
    /// bumped it, and that enqueue is exactly the work the caller would
    /// otherwise sleep through.
    pub(crate) fn sleep(&self, snapshot: u64) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        while *epoch == snapshot {
            epoch = self
                .wakeup
                .wait(epoch)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes one sleeping worker.
    pub(crate) fn wake_one(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        drop(epoch);
        self.wakeup.notify_one();
    }

    /// Wakes every sleeping worker. Used on shutdown and when the caller
    /// cannot bound how much new work arrived.
    pub(crate) fn wake_all(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        drop(epoch);
        self.wakeup.notify_all();
    }
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("QueueRegistry")
            .field("global", &self.global)
            .field("queues", &queues.len())
            .field("out_of_work", &self.out_of_work.load(Relaxed))
            .finish()
    }
}

// === impl OutOfWorkScope ===

impl Drop for OutOfWorkScope<'_> {
    fn drop(&mut self) {
        let prev = self.registry.out_of_work.fetch_sub(1, SeqCst);
        debug_assert!(prev > 0, "out-of-work counter underflow");
    }
}
