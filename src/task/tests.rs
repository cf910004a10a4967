#[cfg(not(loom))]
mod unit {
    use super::super::{Priority, Task};
    use crate::util::trace_init;

    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
    use std::sync::{Arc, Mutex};

    fn drive(task: &Task) {
        assert!(task.try_prepare_launch());
        task.execute();
    }

    #[test]
    fn fresh_task_is_reusable() {
        let task = Task::new();
        assert!(task.is_completed());
        assert!(!task.is_ready());
        assert_eq!(task.name(), "<idle>");
    }

    #[test]
    fn body_then_continuation() {
        trace_init();
        let order = Arc::new(Mutex::new(Vec::new()));
        let task = Task::new();
        task.init_with_continuation(
            "ordered",
            Priority::Normal,
            {
                let order = order.clone();
                move || order.lock().unwrap().push("body")
            },
            {
                let order = order.clone();
                move || order.lock().unwrap().push("continuation")
            },
        );
        assert!(task.is_ready());
        assert_eq!(task.priority(), Priority::Normal);
        assert_eq!(task.name(), "ordered");

        drive(&task);
        assert!(task.is_completed());
        assert!(!task.was_canceled());
        assert_eq!(*order.lock().unwrap(), ["body", "continuation"]);
    }

    #[test]
    fn cancel_skips_body_fires_continuation() {
        trace_init();
        let ran_body = Arc::new(AtomicBool::new(false));
        let ran_continuation = Arc::new(AtomicBool::new(false));
        let task = Task::new();
        task.init_with_continuation(
            "canceled",
            Priority::High,
            {
                let ran_body = ran_body.clone();
                move || ran_body.store(true, Relaxed)
            },
            {
                let ran_continuation = ran_continuation.clone();
                move || ran_continuation.store(true, Relaxed)
            },
        );

        assert!(task.try_cancel());
        assert!(task.was_canceled());
        // cancellation does not complete the task; execution still must
        // happen so the continuation can fire.
        assert!(!task.is_completed());

        drive(&task);
        assert!(task.is_completed());
        assert!(task.was_canceled());
        assert!(!ran_body.load(Relaxed), "a canceled body must not run");
        assert!(ran_continuation.load(Relaxed));
    }

    #[test]
    fn cancel_after_start_is_refused() {
        trace_init();
        let task = Arc::new(Task::new());
        let inner = task.clone();
        task.init("late-cancel", Priority::Normal, move || {
            // by the time the body runs, cancellation must fail.
            assert!(!inner.try_cancel());
        });
        drive(&task);
        assert!(task.is_completed());
        assert!(!task.was_canceled());
    }

    #[test]
    fn reuse_after_completion() {
        trace_init();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let task = Task::new();
        for generation in 1..=3 {
            let body_count = count.clone();
            task.init("reused", Priority::BackgroundHigh, move || {
                body_count.fetch_add(1, Relaxed);
            });
            drive(&task);
            assert!(task.is_completed());
            assert_eq!(
                Arc::strong_count(&count),
                1,
                "generation {generation} leaked its body"
            );
        }
        assert_eq!(count.load(Relaxed), 3);
    }

    #[test]
    fn canceled_body_is_dropped_unrun() {
        trace_init();
        let payload = Arc::new(());
        let task = Task::new();
        task.init("captures", Priority::Normal, {
            let payload = payload.clone();
            move || drop(payload)
        });
        assert!(task.try_cancel());
        drive(&task);
        // the body never ran, but its captures were released anyway.
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn panicking_body_still_completes() {
        trace_init();
        let task = Task::new();
        task.init("doomed", Priority::Normal, || panic!("task body panic"));
        assert!(task.try_prepare_launch());
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.execute()));
        assert!(result.is_err());
        // the terminal state was stored on unwind, so a waiter polling
        // `is_completed` does not wedge.
        assert!(task.is_completed());

        // and the handle is reusable afterwards.
        task.init("recovered", Priority::Normal, || {});
        drive(&task);
        assert!(task.is_completed());
    }

    #[test]
    #[should_panic(expected = "double submission")]
    fn reinit_live_task_panics() {
        let task = Task::new();
        task.init("first", Priority::Normal, || {});
        task.init("second", Priority::Normal, || {});
    }

    #[test]
    fn completed_task_cannot_be_canceled() {
        trace_init();
        let task = Task::new();
        task.init("done", Priority::Normal, || {});
        drive(&task);
        assert!(!task.try_cancel());
        assert!(!task.was_canceled());
    }
}

#[cfg(loom)]
mod models {
    use super::super::{Priority, Task};
    use crate::loom::{
        self,
        sync::atomic::{AtomicBool, Ordering::Relaxed},
        sync::Arc,
        thread,
    };

    /// Cancellation racing the claim-and-execute path: in every interleaving
    /// the task completes, the continuation fires exactly once, and the body
    /// runs iff the cancel lost the race.
    #[test]
    fn cancel_vs_execute() {
        loom::model(|| {
            let task = Arc::new(Task::new());
            let ran_body = Arc::new(AtomicBool::new(false));
            let ran_continuation = Arc::new(AtomicBool::new(false));
            task.init_with_continuation(
                "raced",
                Priority::Normal,
                {
                    let ran_body = ran_body.clone();
                    move || ran_body.store(true, Relaxed)
                },
                {
                    let ran_continuation = ran_continuation.clone();
                    move || ran_continuation.store(true, Relaxed)
                },
            );

            let canceler = {
                let task = task.clone();
                thread::spawn(move || task.try_cancel())
            };

            // the executing side always wins the claim; cancellation only
            // decides whether the body runs.
            assert!(task.try_prepare_launch());
            task.execute();

            let canceled = canceler.join().unwrap();
            assert!(task.is_completed());
            assert!(ran_continuation.load(Relaxed));
            if canceled {
                assert!(!ran_body.load(Relaxed));
                assert!(task.was_canceled());
            }
        });
    }

    /// The release-publish in `init` makes the body visible to whichever
    /// thread claims the task.
    #[test]
    fn publish_then_claim() {
        loom::model(|| {
            let task = Arc::new(Task::new());
            let ran = Arc::new(AtomicBool::new(false));
            task.init("published", Priority::High, {
                let ran = ran.clone();
                move || ran.store(true, Relaxed)
            });

            let worker = {
                let task = task.clone();
                thread::spawn(move || {
                    if task.try_prepare_launch() {
                        task.execute();
                        true
                    } else {
                        false
                    }
                })
            };

            let claimed_here = task.try_prepare_launch();
            if claimed_here {
                task.execute();
            }
            let claimed_there = worker.join().unwrap();

            // exactly one side claims the task.
            assert!(claimed_here ^ claimed_there);
            assert!(task.is_completed());
            assert!(ran.load(Relaxed));
        });
    }
}
