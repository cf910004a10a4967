//! The scheduler: worker pool lifecycle, task launch, and cooperative
//! waiting.
//!
//! A [`Scheduler`] is a cheaply clonable handle to one worker pool and its
//! [queue registry](crate::registry). Worker threads are started and stopped
//! as a group; while no workers are running, [`Scheduler::launch`] degrades
//! to executing the task synchronously on the calling thread, so code that
//! launches tasks never has to care whether a pool exists.
//!
//! Threads are looked up in a registry keyed by [`ThreadId`] rather than
//! through thread-locals, so any thread can ask for any other thread's
//! scheduling context and a producer thread can tear its local queue down
//! from outside.
use crate::queue::LocalQueue;
use crate::registry::QueueRegistry;
use crate::task::{Task, TaskRef};

use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*};
use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

mod worker;


/// A handle to a worker pool and its queues.
///
/// Clones share the same pool. Most programs use the process-wide instance
/// via [`crate::global`]; independent instances are useful for tests and for
/// isolating noisy workloads.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
}

/// Where [`Scheduler::launch`] is allowed to put a task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum QueuePreference {
    /// Enqueue on the calling thread's local queue if it has one, falling
    /// back to the global queue.
    #[default]
    Local,
    /// Always enqueue on the shared global queue, even if the calling thread
    /// has a local queue. Useful when the producer knows it will not be
    /// draining its own queue soon.
    GlobalOnly,
}

/// Requested OS priority for worker threads.
///
/// Factories that cannot set thread priorities (the default
/// [`StdThreadFactory`] among them) are free to ignore this.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ThreadPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

/// Everything a [`ThreadFactory`] needs to know about the worker thread it
/// is asked to create.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    /// Diagnostic thread name, `hypha-worker-N`.
    pub name: String,
    /// The worker's index within its pool.
    pub index: usize,
    /// The OS priority the pool was started with.
    pub priority: ThreadPriority,
}

/// Creates the OS threads a scheduler's workers run on.
///
/// Embedders with their own threading layer (priority control, affinity,
/// profiler registration) implement this to put workers on threads they
/// configure themselves.
pub trait ThreadFactory: Send + Sync {
    /// Spawns a thread running `work`, returning its join handle.
    fn spawn(
        &self,
        spec: WorkerSpec,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

/// The default [`ThreadFactory`]: [`std::thread::Builder`] with the worker's
/// name set. [`WorkerSpec::priority`] is ignored, since the standard library
/// has no portable way to set it.
#[derive(Copy, Clone, Debug, Default)]
pub struct StdThreadFactory;

/// State shared by every clone of a [`Scheduler`] and by its workers.
pub(crate) struct Core {
    registry: Arc<QueueRegistry>,

    /// The number of workers the pool is running; 0 means stopped, and every
    /// launch executes inline. Workers poll this to learn about shutdown.
    active_workers: AtomicUsize,

    /// Join handles for the running workers. Also serializes start/stop.
    pool: Mutex<Vec<JoinHandle<()>>>,

    /// Per-thread scheduling contexts, for workers and for producer threads
    /// that installed a local queue.
    contexts: RwLock<HashMap<ThreadId, Arc<WorkerContext>>>,

    factory: Box<dyn ThreadFactory>,
}

/// One thread's scheduling context: its local queue and the task it is
/// currently executing, if any.
pub(crate) struct WorkerContext {
    queue: Arc<LocalQueue>,

    /// The task this thread is executing right now, or null. Written only by
    /// the owning thread, readable by anyone holding the context.
    active_task: AtomicPtr<Task>,
}

// === impl Scheduler ===

impl Scheduler {
    /// Returns a new scheduler with no workers started, spawning threads
    /// with the [`StdThreadFactory`].
    pub fn new() -> Self {
        Self::with_thread_factory(StdThreadFactory)
    }

    /// Returns a new scheduler whose workers run on threads created by
    /// `factory`.
    pub fn with_thread_factory(factory: impl ThreadFactory + 'static) -> Self {
        Self {
            core: Arc::new(Core {
                registry: Arc::new(QueueRegistry::new()),
                active_workers: AtomicUsize::new(0),
                pool: Mutex::new(Vec::new()),
                contexts: RwLock::new(HashMap::new()),
                factory: Box::new(factory),
            }),
        }
    }

    /// Starts `num_workers` worker threads, or the platform's available
    /// parallelism if `num_workers` is 0.
    ///
    /// Returns `true` if this call started the pool. If workers are already
    /// running this is a no-op; if no thread can be spawned at all, the
    /// scheduler stays in inline mode, where every [`launch`](Self::launch)
    /// runs its task on the calling thread.
    pub fn start_workers(&self, num_workers: usize, priority: ThreadPriority) -> bool {
        let mut pool = self
            .core
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.core.active_workers.load(SeqCst) != 0 {
            tracing::debug!("start_workers: already running");
            return false;
        }

        let requested = if num_workers == 0 {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            num_workers
        };

        // Publish the worker count before the first worker runs, so none of
        // them observes a stopped pool and exits immediately.
        self.core.active_workers.store(requested, SeqCst);

        let mut spawned = 0;
        for index in 0..requested {
            let spec = WorkerSpec {
                name: format!("hypha-worker-{index}"),
                index,
                priority,
            };
            let core = self.core.clone();
            match self
                .core
                .factory
                .spawn(spec, Box::new(move || worker::run(core, index)))
            {
                Ok(handle) => {
                    pool.push(handle);
                    spawned += 1;
                }
                Err(error) => {
                    tracing::warn!(%error, index, "failed to spawn worker thread");
                    break;
                }
            }
        }

        if spawned != requested {
            self.core.active_workers.store(spawned, SeqCst);
        }
        if spawned == 0 {
            tracing::warn!("no worker threads available; tasks will run inline");
            return false;
        }
        tracing::debug!(workers = spawned, ?priority, "started worker pool");
        true
    }

    /// Stops all workers, joining their threads and then executing every
    /// task still queued on the calling thread.
    ///
    /// No launched task is ever dropped by a shutdown: workers drain their
    /// local queues into the global queue as they exit, and this thread
    /// drains the rest inline. Idempotent; stopping a stopped scheduler does
    /// nothing.
    pub fn stop_workers(&self) {
        let mut pool = self
            .core
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.core.active_workers.swap(0, SeqCst) == 0 && pool.is_empty() {
            return;
        }

        self.core.registry.wake_all();
        for handle in pool.drain(..) {
            if handle.join().is_err() {
                tracing::error!("a worker thread panicked during shutdown");
            }
        }
        drop(pool);

        // Whatever is left lives on the global queue or on producer-thread
        // local queues; those can be stolen from here since no worker holds
        // their consumer side any more.
        let context = self.core.current_context();
        let mut drained = 0;
        loop {
            let task = self
                .core
                .registry
                .dequeue_global()
                .or_else(|| self.core.registry.steal_from_peer(None));
            match task {
                Some(task) => {
                    execute_task(task, context.as_deref());
                    drained += 1;
                }
                None => {
                    if !self.core.registry.has_any_work() {
                        break;
                    }
                    // a producer's busy_wait may hold a consumer flag for a
                    // moment; retry until the work is reachable.
                    thread::yield_now();
                }
            }
        }
        tracing::debug!(drained, "stopped worker pool");
    }

    /// Hands `task` to the pool for execution.
    ///
    /// The task must have been [`init`](Task::init)ed since it last
    /// completed. If no workers are running, the task executes synchronously
    /// on this thread before `launch` returns.
    ///
    /// # Safety
    ///
    /// The caller keeps ownership of `task` but must treat it as pinned and
    /// borrowed until [`Task::is_completed`] returns `true`: it must not be
    /// moved, dropped, or re-initialized before then. The scheduler holds
    /// only a pointer to it.
    pub unsafe fn launch(&self, task: &Task, preference: QueuePreference) {
        debug_assert!(
            task.is_ready() || task.was_canceled(),
            "launched a task that was not initialized: {task:?}",
        );
        let priority = task.priority();
        let task = TaskRef::new(task);

        if self.core.active_workers.load(SeqCst) == 0 {
            test_trace!(task = task.task().name(), "launch: executing inline");
            execute_task(task, self.core.current_context().as_deref());
            return;
        }

        let registry = &self.core.registry;
        let became_nonempty = match preference {
            QueuePreference::Local => match self.core.current_context() {
                Some(context) => context.queue.enqueue(task, priority),
                None => registry.enqueue_global(task, priority),
            },
            QueuePreference::GlobalOnly => registry.enqueue_global(task, priority),
        };

        // Only a transition out of emptiness can have raced a worker's
        // decision to idle; anything already queued keeps workers awake on
        // its own.
        if became_nonempty && registry.has_idle_workers() {
            registry.wake_one();
        }
    }

    /// Runs queued tasks on the calling thread until `predicate` returns
    /// `true`.
    ///
    /// This is how a thread waits for a task (or any condition) without
    /// parking: it keeps draining the queues, so waiting from inside a
    /// worker cannot deadlock the pool. The predicate is re-checked between
    /// tasks and while idling.
    pub fn busy_wait(&self, mut predicate: impl FnMut() -> bool) {
        let context = self.core.current_context();
        let registry = &self.core.registry;
        let mut backoff = crate::util::Backoff::new();
        let mut empty_passes = 0u32;
        loop {
            if predicate() {
                return;
            }
            let task = context
                .as_ref()
                .and_then(|cx| cx.queue.dequeue_local())
                .or_else(|| registry.dequeue_global())
                .or_else(|| registry.steal_from_peer(context.as_ref().map(|cx| cx.queue.id())));
            match task {
                Some(task) => {
                    execute_task(task, context.as_deref());
                    backoff = crate::util::Backoff::new();
                    empty_passes = 0;
                }
                None if empty_passes < 32 => {
                    empty_passes += 1;
                    backoff.spin();
                }
                // the queues have stayed empty; stop burning cycles and let
                // the OS run someone who has work.
                None => thread::yield_now(),
            }
        }
    }

    /// Registers a local queue for the calling thread, so that its launches
    /// with [`QueuePreference::Local`] stay thread-local and workers can
    /// steal from it.
    ///
    /// No-op if this thread already has one (worker threads always do).
    ///
    /// Every install must be paired with an
    /// [`uninstall_local_queue`](Self::uninstall_local_queue) on the same
    /// thread before it exits: the scheduler cannot observe thread death, so
    /// an uninstalled queue and its context entry are otherwise retained (as
    /// an empty steal victim) for the scheduler's lifetime.
    pub fn install_local_queue(&self) {
        let mut contexts = self
            .core
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        contexts
            .entry(thread::current().id())
            .or_insert_with(|| self.core.new_context());
    }

    /// Deregisters the calling thread's local queue, draining anything still
    /// on it into the global queue.
    ///
    /// Worker threads manage their own queues; this is for producer threads
    /// that called [`install_local_queue`](Self::install_local_queue).
    pub fn uninstall_local_queue(&self) {
        let context = {
            let mut contexts = self
                .core
                .contexts
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            contexts.remove(&thread::current().id())
        };
        if let Some(context) = context {
            self.core.retire_context(&context);
        }
    }

    /// Returns a pointer to the task the calling thread is executing right
    /// now, or `None` if it is not inside a task body or continuation.
    ///
    /// The pointer is valid for the duration of that execution; it is meant
    /// for diagnostics and for re-entrancy checks, not for keeping.
    pub fn active_task(&self) -> Option<NonNull<Task>> {
        let context = self.core.current_context()?;
        NonNull::new(context.active_task.load(Acquire))
    }

    /// The number of worker threads currently running.
    pub fn worker_count(&self) -> usize {
        self.core.active_workers.load(SeqCst)
    }

    /// Returns `true` while the worker pool is running.
    pub fn is_active(&self) -> bool {
        self.worker_count() != 0
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count())
            .field("registry", &self.core.registry)
            .finish()
    }
}

// === impl Core ===

impl Core {
    /// The calling thread's scheduling context, if it has one.
    fn current_context(&self) -> Option<Arc<WorkerContext>> {
        let contexts = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        contexts.get(&thread::current().id()).cloned()
    }

    fn new_context(&self) -> Arc<WorkerContext> {
        let registry = self.registry.clone();
        let queue = Arc::new(LocalQueue::new(registry, self.registry.next_queue_id()));
        self.registry.register(queue.clone());
        Arc::new(WorkerContext {
            queue,
            active_task: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Installs a context for the calling worker thread.
    fn install_context(&self) -> Arc<WorkerContext> {
        let context = self.new_context();
        let mut contexts = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        contexts.insert(thread::current().id(), context.clone());
        context
    }

    /// Removes the calling thread's context from the registry, rehoming its
    /// queued work.
    fn remove_context(&self) {
        let context = {
            let mut contexts = self
                .contexts
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            contexts.remove(&thread::current().id())
        };
        if let Some(context) = context {
            self.retire_context(&context);
        }
    }

    fn retire_context(&self, context: &WorkerContext) {
        let drained = context.queue.drain_into_global();
        self.registry.deregister(context.queue.id());
        if drained > 0 && self.registry.has_idle_workers() {
            self.registry.wake_one();
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("active_workers", &self.active_workers.load(Relaxed))
            .field("registry", &self.registry)
            .finish()
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("queue", &self.queue)
            .field("active_task", &self.active_task.load(Relaxed))
            .finish()
    }
}

// === impl StdThreadFactory ===

impl ThreadFactory for StdThreadFactory {
    fn spawn(
        &self,
        spec: WorkerSpec,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(spec.name).spawn(work)
    }
}

/// Drives one dequeued task through claim and execution, publishing it as
/// the thread's active task for the duration.
pub(crate) fn execute_task(task: TaskRef, context: Option<&WorkerContext>) {
    // A failed claim means the task was dequeued twice, which the queues'
    // single-consumer discipline rules out.
    assert!(
        task.task().try_prepare_launch(),
        "task claimed twice: {:?}",
        task.task(),
    );

    let _active = ActiveTask::enter(context, &task);
    task.task().execute();
}

/// Publishes the running task in the thread's context, restoring the prior
/// value on drop. Executions nest: a body that launches inline or calls
/// `busy_wait` runs other tasks before it finishes, and the outer task must
/// become the active one again afterwards. The drop-guard also holds across
/// a panicking body, so no dangling active-task pointer survives an unwind.
struct ActiveTask<'a> {
    context: Option<&'a WorkerContext>,
    prior: *mut Task,
}

impl<'a> ActiveTask<'a> {
    fn enter(context: Option<&'a WorkerContext>, task: &TaskRef) -> Self {
        let prior = match context {
            Some(context) => context.active_task.swap(task.as_ptr().as_ptr(), AcqRel),
            None => ptr::null_mut(),
        };
        Self { context, prior }
    }
}

impl Drop for ActiveTask<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context {
            context.active_task.store(self.prior, Release);
        }
    }
}
