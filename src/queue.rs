//! Priority-classed run queues.
//!
//! Each queue is a set of intrusive, lock-free MPSC queues
//! ([`cordyceps::MpscQueue`]), one per [`Priority`] class, drained highest
//! class first. Enqueue is wait-free for any number of producers; dequeue is
//! single-consumer, guarded by the queue's consumer flag, which is what
//! guarantees that an enqueued task is returned by exactly one dequeue call
//! across all threads.
use crate::registry::QueueRegistry;
use crate::task::{Priority, Task, TaskRef};

use cordyceps::mpsc_queue::{MpscQueue, TryDequeueError};

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering::*};
use std::sync::Arc;

/// One priority class: a single intrusive MPSC queue.
struct RunQueue {
    queue: MpscQueue<Task>,

    /// The stub node `queue` was constructed around. Boxed so its address is
    /// stable, referenced by `queue` for its whole lifetime; the field order
    /// here (queue first) is what makes that sound on drop.
    _stub: Box<Task>,
}

/// A set of [`RunQueue`]s, one per priority class.
pub(crate) struct ClassQueue {
    classes: [RunQueue; Priority::COUNT],

    /// The number of tasks currently enqueued, across all classes.
    ///
    /// Incremented *before* the enqueue and decremented only by a
    /// successful dequeue, so it may transiently over-count but never
    /// under-counts. SeqCst: producers write this then read the idle
    /// counter, while idling workers write the idle counter then read this;
    /// both orders observing stale values at once is what would lose a
    /// wakeup.
    tasks: AtomicUsize,
}

/// A per-thread (worker or producer) queue, with local, global-fallback, and
/// steal-from-peer dequeue flavors.
///
/// The three dequeue flavors together implement a worker's hunt order; the
/// registry is consulted for anything beyond the thread's own work.
pub(crate) struct LocalQueue {
    queue: ClassQueue,
    registry: Arc<QueueRegistry>,
    id: usize,
}

// === impl RunQueue ===

impl RunQueue {
    fn new() -> Self {
        let stub = Box::new(Task::new());
        let queue = MpscQueue::new_with_stub(TaskRef::new(&stub));
        Self { queue, _stub: stub }
    }
}

// === impl ClassQueue ===

impl ClassQueue {
    pub(crate) fn new() -> Self {
        Self {
            classes: [
                RunQueue::new(),
                RunQueue::new(),
                RunQueue::new(),
                RunQueue::new(),
                RunQueue::new(),
            ],
            tasks: AtomicUsize::new(0),
        }
    }

    /// Enqueues `task` on the given priority class, returning `true` if the
    /// queue as a whole went from empty to non-empty. Callers use that
    /// signal to decide whether a sleeping worker must be woken.
    pub(crate) fn enqueue(&self, task: TaskRef, priority: Priority) -> bool {
        let was_empty = self.tasks.fetch_add(1, SeqCst) == 0;
        self.classes[priority.class()].queue.enqueue(task);
        test_trace!(?priority, was_empty, "ClassQueue::enqueue");
        was_empty
    }

    /// Dequeues the highest-priority task, spinning briefly through
    /// transient inconsistent/busy states. Returns `None` only when every
    /// class is empty.
    pub(crate) fn dequeue(&self) -> Option<TaskRef> {
        if self.tasks.load(SeqCst) == 0 {
            return None;
        }
        for class in &self.classes {
            if let Some(task) = class.queue.dequeue() {
                self.tasks.fetch_sub(1, SeqCst);
                return Some(task);
            }
        }
        None
    }

    /// Non-blocking dequeue for stealing: a class whose consumer is busy is
    /// treated as empty rather than waited on, and the scan continues with
    /// the lower classes, which may still hold stealable work.
    pub(crate) fn try_dequeue(&self) -> Option<TaskRef> {
        if self.tasks.load(SeqCst) == 0 {
            return None;
        }
        for class in &self.classes {
            match class.queue.try_dequeue() {
                Ok(task) => {
                    self.tasks.fetch_sub(1, SeqCst);
                    return Some(task);
                }
                Err(TryDequeueError::Empty) => {}
                // Mid-enqueue or another consumer holds this class; skip it
                // instead of waiting.
                Err(TryDequeueError::Inconsistent) | Err(TryDequeueError::Busy) => {}
            }
        }
        None
    }

    pub(crate) fn has_work(&self) -> bool {
        self.tasks.load(SeqCst) > 0
    }
}

impl fmt::Debug for ClassQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassQueue")
            .field("tasks", &self.tasks.load(Relaxed))
            .finish()
    }
}

// === impl LocalQueue ===

impl LocalQueue {
    pub(crate) fn new(registry: Arc<QueueRegistry>, id: usize) -> Self {
        Self {
            queue: ClassQueue::new(),
            registry,
            id,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Enqueues onto this thread's own queue; `true` means the queue became
    /// non-empty.
    pub(crate) fn enqueue(&self, task: TaskRef, priority: Priority) -> bool {
        self.queue.enqueue(task, priority)
    }

    /// Removes a task enqueued on this thread's own queue, highest priority
    /// first.
    pub(crate) fn dequeue_local(&self) -> Option<TaskRef> {
        self.queue.dequeue()
    }

    /// Removes a task from the registry's shared global queue.
    pub(crate) fn dequeue_global(&self) -> Option<TaskRef> {
        self.registry.dequeue_global()
    }

    /// Removes a task from some other registered queue, per the registry's
    /// victim-selection policy.
    pub(crate) fn dequeue_steal(&self) -> Option<TaskRef> {
        self.registry.steal_from_peer(Some(self.id))
    }

    /// Non-blocking dequeue used when *this* queue is the steal victim.
    pub(crate) fn steal_one(&self) -> Option<TaskRef> {
        self.queue.try_dequeue()
    }

    pub(crate) fn has_work(&self) -> bool {
        self.queue.has_work()
    }

    /// Moves every remaining task onto the global queue, returning how many
    /// were moved. Called on teardown so local work is never lost.
    pub(crate) fn drain_into_global(&self) -> usize {
        let mut moved = 0;
        while let Some(task) = self.queue.dequeue() {
            let priority = task.task().priority();
            self.registry.enqueue_global(task, priority);
            moved += 1;
        }
        if moved > 0 {
            tracing::debug!(queue = self.id, moved, "drained local queue into global");
        }
        moved
    }
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .finish()
    }
}
