use crate::loom::sync::atomic::{
    AtomicUsize,
    Ordering::{self, *},
};

use core::fmt;

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's packed state word.
    #[derive(PartialEq, Eq)]
    pub(crate) struct State<usize> {
        /// Where the task currently is in its lifecycle.
        pub(crate) const LIFECYCLE: Lifecycle;

        /// The priority the task was initialized with.
        ///
        /// Queues read this when deciding which priority class a task is
        /// enqueued on; it is set once by `init` and never changes until the
        /// task is re-initialized.
        pub(crate) const PRIORITY: Priority;
    }
}

mycelium_bitfield::enum_from_bits! {
    /// A task's lifecycle state.
    ///
    /// Only the transitions performed by [`StateCell`]'s methods are legal;
    /// every transition out of a queued or claimed state is a single
    /// compare-and-swap, so exactly one thread ever claims a task for
    /// execution.
    #[derive(Debug, PartialEq, Eq)]
    pub(crate) enum Lifecycle<u8> {
        /// Terminal: the task ran to completion. The handle may be reused.
        Completed = 0b000,
        /// Terminal: the task was canceled before its body ran, and its
        /// continuation (if any) has fired. The handle may be reused.
        CanceledAndCompleted = 0b001,
        /// The task has been initialized and may be sitting in a queue,
        /// waiting to be claimed by a worker.
        Ready = 0b010,
        /// The task was canceled while still queued. It must still be
        /// dequeued and driven through execution so its continuation fires.
        CanceledAndReady = 0b011,
        /// A worker has claimed the task and is about to run it.
        Scheduled = 0b100,
        /// The task was canceled after a worker claimed it but before its
        /// body started; only the continuation will run.
        Canceled = 0b101,
        /// The task's body is executing right now. Cancellation no longer
        /// has any effect.
        Running = 0b110,
    }
}

mycelium_bitfield::enum_from_bits! {
    /// A task's scheduling priority.
    ///
    /// Within any one queue, higher priorities (lower discriminants) are
    /// drained first. No ordering is guaranteed between tasks of equal
    /// priority, or across different queues.
    #[derive(Debug, PartialEq, Eq, Hash)]
    pub enum Priority<u8> {
        /// Drained before all other work.
        High = 0b000,
        /// The default priority.
        Normal = 0b001,
        /// The most urgent of the background tiers.
        BackgroundHigh = 0b010,
        /// Background work with no particular urgency.
        BackgroundNormal = 0b011,
        /// Drained only when nothing else is queued.
        BackgroundLow = 0b100,
    }
}

/// An atomic cell holding a task's packed [`State`] word.
///
/// This is the only mutable state shared between threads that touch a task;
/// every transition is a compare-and-swap, never a lock.
#[repr(transparent)]
pub(crate) struct StateCell(AtomicUsize);

impl Priority {
    /// The number of priority classes.
    pub const COUNT: usize = 5;

    /// All priorities, highest first.
    pub const ALL: [Self; Self::COUNT] = [
        Self::High,
        Self::Normal,
        Self::BackgroundHigh,
        Self::BackgroundNormal,
        Self::BackgroundLow,
    ];

    /// The index of this priority's class, 0 being drained first.
    #[inline]
    pub(crate) fn class(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Lifecycle {
    /// Returns `true` for the two terminal states, in which the task handle
    /// may be re-initialized.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::CanceledAndCompleted)
    }
}

// === impl StateCell ===

impl StateCell {
    loom_const_fn! {
        /// Returns a new cell in the [`Lifecycle::Completed`] state, so that
        /// a freshly constructed task is immediately initializable.
        pub(crate) fn new() -> Self {
            // `Completed` and `High` are both the all-zeroes pattern.
            Self(AtomicUsize::new(0))
        }
    }

    /// Publishes the task as [`Lifecycle::Ready`] with the given priority.
    ///
    /// The release store pairs with the acquire in [`try_prepare_launch`];
    /// any thread that observes `Ready` also observes the fully written
    /// runnable.
    ///
    /// # Panics
    ///
    /// If the task is not in a terminal state: re-initializing a live task
    /// is a double submission, and recovering silently would corrupt the
    /// scheduling protocol.
    ///
    /// [`try_prepare_launch`]: Self::try_prepare_launch
    pub(crate) fn publish_ready(&self, priority: Priority) {
        let current = self.load(Relaxed);
        assert!(
            current.get(State::LIFECYCLE).is_terminal(),
            "cannot initialize a task that has not completed (double \
             submission?); state: {current:?}",
        );
        let next = State::from_bits(0)
            .with(State::LIFECYCLE, Lifecycle::Ready)
            .with(State::PRIORITY, priority);
        self.0.store(next.0, Release);
    }

    /// Claims the task for execution on the calling worker.
    ///
    /// Transitions `Ready` → `Scheduled` or `CanceledAndReady` → `Canceled`,
    /// returning whether either succeeded. A `false` return means the task
    /// was dequeued twice, which queue discipline (at most one dequeue per
    /// enqueue) rules out; callers treat it as a fatal contract violation.
    #[must_use]
    pub(crate) fn try_prepare_launch(&self) -> bool {
        self.transition(|state| match state.get(State::LIFECYCLE) {
            Lifecycle::Ready => {
                state.set(State::LIFECYCLE, Lifecycle::Scheduled);
                true
            }
            Lifecycle::CanceledAndReady => {
                state.set(State::LIFECYCLE, Lifecycle::Canceled);
                true
            }
            _ => false,
        })
    }

    /// Attempts the final `Scheduled` → `Running` transition, returning
    /// `false` if the task was canceled between dequeue and execution.
    #[must_use]
    pub(crate) fn start_running(&self) -> bool {
        self.transition(|state| match state.get(State::LIFECYCLE) {
            Lifecycle::Scheduled => {
                state.set(State::LIFECYCLE, Lifecycle::Running);
                true
            }
            Lifecycle::Canceled => false,
            lifecycle => {
                debug_assert!(
                    false,
                    "a task must be prepared before it is executed; \
                     state was {lifecycle:?}",
                );
                false
            }
        })
    }

    /// Stores the terminal state once execution (or cancellation-skip) has
    /// finished.
    ///
    /// Sequentially-consistent so that a waiter polling [`is_completed`] on
    /// another thread observes everything the task wrote.
    ///
    /// [`is_completed`]: Self::is_completed
    pub(crate) fn finish(&self, canceled: bool) {
        let lifecycle = if canceled {
            Lifecycle::CanceledAndCompleted
        } else {
            Lifecycle::Completed
        };
        // No other thread may write the state word once the task is
        // `Running` or `Canceled`, so a plain store cannot lose a race.
        let state = self.load(Relaxed);
        debug_assert_eq!(
            state.get(State::LIFECYCLE),
            if canceled {
                Lifecycle::Canceled
            } else {
                Lifecycle::Running
            },
        );
        self.0.store(state.with(State::LIFECYCLE, lifecycle).0, SeqCst);
    }

    /// Requests cancellation, returning `true` if the task had not yet
    /// started running.
    ///
    /// Transitions `Ready` → `CanceledAndReady` or `Scheduled` → `Canceled`.
    /// Relaxed ordering suffices: the cancellation is only ever observed
    /// through the subsequent mandatory prepare/execute sequence, which
    /// performs its own acquires.
    pub(crate) fn try_cancel(&self) -> bool {
        let mut current = self.load(Relaxed);
        loop {
            let lifecycle = match current.get(State::LIFECYCLE) {
                Lifecycle::Ready => Lifecycle::CanceledAndReady,
                Lifecycle::Scheduled => Lifecycle::Canceled,
                _ => return false,
            };
            let next = current.with(State::LIFECYCLE, lifecycle);
            match self
                .0
                .compare_exchange_weak(current.0, next.0, Relaxed, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = State(actual),
            }
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.lifecycle().is_terminal()
    }

    pub(crate) fn was_canceled(&self) -> bool {
        matches!(
            self.lifecycle(),
            Lifecycle::CanceledAndReady | Lifecycle::Canceled | Lifecycle::CanceledAndCompleted,
        )
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    pub(crate) fn priority(&self) -> Priority {
        self.load(Relaxed).get(State::PRIORITY)
    }

    #[inline]
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.load(Acquire).get(State::LIFECYCLE)
    }

    pub(crate) fn load(&self, order: Ordering) -> State {
        State(self.0.load(order))
    }

    /// Advances the state word by running `transition` on the current
    /// [`State`] in a compare-and-swap loop.
    #[cfg_attr(test, track_caller)]
    fn transition<T>(&self, mut transition: impl FnMut(&mut State) -> T) -> T {
        let mut current = self.load(Acquire);
        loop {
            test_trace!("StateCell::transition; current: {current:?}");
            let mut next = current;
            let res = transition(&mut next);

            if test_dbg!(current.0 == next.0) {
                return res;
            }

            match self
                .0
                .compare_exchange_weak(current.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return res,
                Err(actual) => current = State(actual),
            }
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Relaxed).fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn packing_specs_valid() {
        State::assert_valid()
    }

    #[test]
    fn publish_claim_finish() {
        let state = StateCell::new();
        state.publish_ready(Priority::BackgroundLow);
        assert!(state.is_ready());
        assert_eq!(state.priority(), Priority::BackgroundLow);

        assert!(state.try_prepare_launch());
        assert_eq!(state.lifecycle(), Lifecycle::Scheduled);

        assert!(state.start_running());
        state.finish(false);
        assert!(state.is_completed());
        assert!(!state.was_canceled());
    }

    #[test]
    fn cancel_before_claim() {
        let state = StateCell::new();
        state.publish_ready(Priority::Normal);
        assert!(state.try_cancel());
        assert!(state.was_canceled());
        assert!(!state.is_completed());

        // the canceled task must still be claimable and drivable to
        // completion, so its continuation can fire.
        assert!(state.try_prepare_launch());
        assert_eq!(state.lifecycle(), Lifecycle::Canceled);
        assert!(!state.start_running());
        state.finish(true);
        assert!(state.is_completed());
        assert!(state.was_canceled());
    }

    #[test]
    fn cancel_after_claim() {
        let state = StateCell::new();
        state.publish_ready(Priority::Normal);
        assert!(state.try_prepare_launch());
        assert!(state.try_cancel());
        assert_eq!(state.lifecycle(), Lifecycle::Canceled);
        assert!(!state.start_running());
    }

    #[test]
    fn cancel_too_late() {
        let state = StateCell::new();
        state.publish_ready(Priority::Normal);
        assert!(state.try_prepare_launch());
        assert!(state.start_running());
        // the body already started; cancellation is a no-op.
        assert!(!state.try_cancel());
        state.finish(false);
        assert!(!state.was_canceled());
    }

    #[test]
    #[should_panic(expected = "double submission")]
    fn double_init_panics() {
        let state = StateCell::new();
        state.publish_ready(Priority::Normal);
        state.publish_ready(Priority::Normal);
    }

    #[test]
    fn double_dequeue_detected() {
        let state = StateCell::new();
        state.publish_ready(Priority::Normal);
        assert!(state.try_prepare_launch());
        // a second claim must fail rather than silently succeeding.
        assert!(!state.try_prepare_launch());
    }
}
