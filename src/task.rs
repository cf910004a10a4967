//! Caller-owned task handles and their lifecycle state machine.
//!
//! A [`Task`] wraps one deferred unit of work ("the body") and, optionally, a
//! continuation that fires after the body runs, or instead of it if the task
//! is canceled first. The scheduler never allocates or frees task storage:
//! the caller owns the handle for its whole lifetime, and may reuse it once
//! [`Task::is_completed`] reports `true`.
//!
//! Identity is the handle's address. Internally, queues traffic in
//! [`TaskRef`]s, non-owning pointers to caller-owned tasks, threaded through
//! the intrusive [`mpsc_queue::Links`] embedded in every handle.
use crate::loom::cell::UnsafeCell;
use cordyceps::{mpsc_queue, Linked};

use core::fmt;
use core::ptr::NonNull;

mod state;
#[cfg(test)]
mod tests;

pub use self::state::Priority;
pub(crate) use self::state::StateCell;

/// The deferred computation a task carries.
///
/// Boxing keeps the handle ownership-safe and fixed-size; the allocation
/// happens at `init` time on the submitting thread, never on the execution
/// hot path.
type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// A caller-owned handle wrapping one deferred unit of work and its atomic
/// lifecycle state.
///
/// A fresh `Task` is in a terminal ("completed") state. [`Task::init`]
/// attaches a body (and optionally a continuation) and publishes the task as
/// ready; it is then handed to [`Scheduler::launch`], executed exactly once
/// by some thread, and returns to a terminal state, after which the handle
/// may be initialized again.
///
/// [`Scheduler::launch`]: crate::scheduler::Scheduler::launch
// The intrusive links must be the first field and the struct `#[repr(C)]`,
// so that `Linked::links` may cast a task pointer to a links pointer.
#[repr(C)]
pub struct Task {
    /// The task's links in whichever intrusive run queue currently holds it.
    run_queue: mpsc_queue::Links<Task>,

    /// The packed lifecycle + priority state word.
    state: StateCell,

    /// Purely diagnostic name, set by `init`.
    name: UnsafeCell<&'static str>,

    /// The task's primary body. Present from `init` until execution claims
    /// it; a canceled task's body is dropped without running.
    body: UnsafeCell<Option<Runnable>>,

    /// Runs after the body, or in place of it when the task was canceled.
    continuation: UnsafeCell<Option<Runnable>>,
}

/// A non-owning reference to a caller-owned [`Task`], used as the queues'
/// handle type.
///
/// Holding a `TaskRef` confers no ownership; the launch contract guarantees
/// the pointee outlives its trip through the queues. Public only because it
/// appears in [`Task`]'s `Linked` implementation; it is not part of the
/// crate's API surface.
#[doc(hidden)]
pub struct TaskRef(NonNull<Task>);

// === impl Task ===

impl Task {
    loom_const_fn! {
        /// Returns a new, idle task.
        ///
        /// The task starts in a terminal state: it holds no work, reports
        /// [`is_completed`](Self::is_completed), and is ready to be
        /// [`init`](Self::init)ed.
        pub fn new() -> Self {
            Self {
                run_queue: mpsc_queue::Links::new(),
                state: StateCell::new(),
                name: UnsafeCell::new("<idle>"),
                body: UnsafeCell::new(None),
                continuation: UnsafeCell::new(None),
            }
        }
    }

    /// Attaches a body to this task and publishes it as ready to launch.
    ///
    /// # Panics
    ///
    /// If the task is not in a terminal state. Re-initializing a task that
    /// has not completed is a double submission: a programmer error that
    /// would corrupt scheduling state if it were silently tolerated.
    pub fn init(&self, name: &'static str, priority: Priority, body: impl FnOnce() + Send + 'static) {
        self.init_inner(name, priority, Box::new(body), None)
    }

    /// Like [`init`](Self::init), but also attaches a continuation.
    ///
    /// The continuation runs after the body, on whichever thread executed
    /// the task. If the task is canceled before its body starts, the body is
    /// dropped unrun but the continuation still fires; cancellation skips
    /// work, it never skips completion.
    pub fn init_with_continuation(
        &self,
        name: &'static str,
        priority: Priority,
        body: impl FnOnce() + Send + 'static,
        continuation: impl FnOnce() + Send + 'static,
    ) {
        self.init_inner(name, priority, Box::new(body), Some(Box::new(continuation)))
    }

    fn init_inner(
        &self,
        name: &'static str,
        priority: Priority,
        body: Runnable,
        continuation: Option<Runnable>,
    ) {
        // Check before touching the cells: clobbering a live task's body
        // must not happen even though `publish_ready` would panic later.
        let lifecycle = self.state.lifecycle();
        assert!(
            lifecycle.is_terminal(),
            "cannot initialize a task that has not completed (double \
             submission?); task {:?} is {lifecycle:?}",
            self.name(),
        );

        self.name.with_mut(|n| unsafe { *n = name });
        self.body.with_mut(|b| unsafe { *b = Some(body) });
        self.continuation.with_mut(|c| unsafe { *c = continuation });

        // Release-publish *after* the runnable is fully written, so any
        // thread that observes `Ready` also observes the body.
        self.state.publish_ready(priority);
        test_trace!(task = self.name(), ?priority, "Task::init");
    }

    /// Requests cancellation, returning `true` if the task had not yet
    /// started running.
    ///
    /// Cancellation is best-effort and non-blocking: it only prevents a
    /// *not-yet-started* body from running, never interrupts one in
    /// progress. A successfully canceled task must still be driven through
    /// execution by the scheduler so that its continuation fires;
    /// [`is_completed`](Self::is_completed) becomes `true` only then.
    pub fn try_cancel(&self) -> bool {
        test_dbg!(self.state.try_cancel())
    }

    /// Returns `true` once the task has fully executed (or been canceled and
    /// driven to completion) and the handle may be reused.
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Returns `true` if the task was canceled before its body started.
    pub fn was_canceled(&self) -> bool {
        self.state.was_canceled()
    }

    /// Returns `true` while the task is published but not yet claimed by a
    /// worker.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// The priority this task was initialized with.
    pub fn priority(&self) -> Priority {
        self.state.priority()
    }

    /// The diagnostic name this task was initialized with.
    pub fn name(&self) -> &'static str {
        self.name.with(|n| unsafe { *n })
    }

    /// Claims the task for execution, transitioning it out of its queued
    /// state. Must be called exactly once per dequeue, by the dequeuing
    /// thread, before [`execute`](Self::execute).
    #[must_use]
    pub(crate) fn try_prepare_launch(&self) -> bool {
        test_dbg!(self.state.try_prepare_launch())
    }

    /// Executes the task: runs the body (unless the task was canceled after
    /// being claimed), then the continuation, then stores the terminal
    /// state.
    ///
    /// Only the thread whose [`try_prepare_launch`](Self::try_prepare_launch)
    /// succeeded may call this, exactly once. After it returns, the caller
    /// must not touch the task again: the owner may already be reusing it.
    pub(crate) fn execute(&self) {
        // The successful prepare made this thread the task's exclusive
        // owner, so the cells may be drained outside the state machine.
        let body = self.body.with_mut(|b| unsafe { (*b).take() });
        let continuation = self.continuation.with_mut(|c| unsafe { (*c).take() });

        let canceled = !self.state.start_running();
        test_trace!(task = self.name(), canceled, "Task::execute");

        // Store the terminal state even if the body panics, so that a
        // waiter polling `is_completed` cannot wedge. The panic itself still
        // propagates to the executing thread.
        let _finish = FinishGuard {
            state: &self.state,
            canceled,
        };

        match body {
            Some(body) if !canceled => body(),
            // A canceled body is dropped unrun, releasing whatever it
            // captured.
            _ => drop(body),
        }

        if let Some(continuation) = continuation {
            continuation();
        }
    }
}

struct FinishGuard<'task> {
    state: &'task StateCell,
    canceled: bool,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.state.finish(self.canceled);
    }
}

#[cfg(not(loom))]
impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

/// The state machine hands out access to the cells to exactly one thread at
/// a time, so the handle may cross threads.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("addr", &(self as *const Self))
            .finish()
    }
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new(task: &Task) -> Self {
        Self(NonNull::from(task))
    }

    /// Dereferences the task.
    ///
    /// The launch contract (the task outlives its trip through the
    /// scheduler) keeps this pointer valid while any queue or worker holds
    /// the ref.
    pub(crate) fn task(&self) -> &Task {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn as_ptr(&self) -> NonNull<Task> {
        self.0
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}

/// `TaskRef`s are handed between producer, worker, and stealing threads.
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

/// # Safety
///
/// Tasks are pinned by the launch contract: a launched task may not be moved
/// until it completes, and the links field is only touched by the queue that
/// currently holds the task.
unsafe impl Linked<mpsc_queue::Links<Task>> for Task {
    type Handle = TaskRef;

    fn into_ptr(task: Self::Handle) -> NonNull<Self> {
        task.0
    }

    /// # Safety
    ///
    /// The pointer must point to a valid, live `Task`; handles are
    /// non-owning, so no ownership is created here.
    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        TaskRef(ptr)
    }

    /// # Safety
    ///
    /// `run_queue` is the first field of a `#[repr(C)]` struct, so a task
    /// pointer is a links pointer.
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        ptr.cast()
    }
}
