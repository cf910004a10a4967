//! End-to-end tests driving a real worker pool through the public API.
use hypha::{Priority, QueuePreference, Scheduler, Task, ThreadPriority};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .with_test_writer()
        .try_init();
}

#[test]
fn every_task_executes_exactly_once() {
    trace_init();
    const TASKS: usize = 1000;

    let scheduler = Scheduler::new();
    assert!(scheduler.start_workers(4, ThreadPriority::Normal));

    let executions: Arc<Vec<AtomicUsize>> =
        Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());
    let tasks: Vec<Task> = (0..TASKS).map(|_| Task::new()).collect();

    for (i, task) in tasks.iter().enumerate() {
        let executions = executions.clone();
        task.init("stress", Priority::ALL[i % Priority::COUNT], move || {
            executions[i].fetch_add(1, Relaxed);
        });
        let preference = if i % 3 == 0 {
            QueuePreference::GlobalOnly
        } else {
            QueuePreference::Local
        };
        unsafe { scheduler.launch(task, preference) };
    }

    scheduler.busy_wait(|| tasks.iter().all(Task::is_completed));

    for (i, count) in executions.iter().enumerate() {
        assert_eq!(count.load(Relaxed), 1, "task {i} ran a wrong number of times");
    }
    scheduler.stop_workers();
}

#[test]
fn shutdown_drains_pending_tasks() {
    trace_init();
    const TASKS: usize = 100;

    let scheduler = Scheduler::new();
    assert!(scheduler.start_workers(2, ThreadPriority::Normal));

    let executed = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..TASKS).map(|_| Task::new()).collect();
    for task in &tasks {
        let executed = executed.clone();
        task.init("slow", Priority::BackgroundNormal, move || {
            std::thread::sleep(Duration::from_micros(100));
            executed.fetch_add(1, Relaxed);
        });
        unsafe { scheduler.launch(task, QueuePreference::GlobalOnly) };
    }

    // stop immediately: most of the tasks are still queued, and must run
    // before stop_workers returns rather than being dropped.
    scheduler.stop_workers();

    assert_eq!(executed.load(Relaxed), TASKS);
    assert!(tasks.iter().all(Task::is_completed));
}

#[test]
fn launch_runs_inline_without_workers() {
    trace_init();
    let scheduler = Scheduler::new();

    let ran = Arc::new(AtomicBool::new(false));
    let task = Task::new();
    task.init("inline", Priority::High, {
        let ran = ran.clone();
        move || ran.store(true, Relaxed)
    });

    unsafe { scheduler.launch(&task, QueuePreference::Local) };
    assert!(ran.load(Relaxed));
    assert!(task.is_completed());

    // a trivially true predicate returns without any workers to help.
    scheduler.busy_wait(|| true);
}

#[test]
fn racing_cancellation_never_loses_a_task() {
    trace_init();
    const TASKS: usize = 200;

    let scheduler = Scheduler::new();
    assert!(scheduler.start_workers(2, ThreadPriority::Normal));

    let ran: Arc<Vec<AtomicUsize>> = Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());
    let continued: Arc<Vec<AtomicUsize>> =
        Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());
    let tasks: Vec<Task> = (0..TASKS).map(|_| Task::new()).collect();

    for (i, task) in tasks.iter().enumerate() {
        let ran = ran.clone();
        let continued = continued.clone();
        task.init_with_continuation(
            "raced",
            Priority::Normal,
            move || {
                ran[i].fetch_add(1, Relaxed);
            },
            move || {
                continued[i].fetch_add(1, Relaxed);
            },
        );
        unsafe { scheduler.launch(task, QueuePreference::GlobalOnly) };
    }

    // race the workers for every task. the outcome per task is unknowable,
    // but the invariants below hold either way.
    let cancel_won: Vec<bool> = tasks.iter().map(Task::try_cancel).collect();

    scheduler.busy_wait(|| tasks.iter().all(Task::is_completed));

    for (i, task) in tasks.iter().enumerate() {
        assert_eq!(
            continued[i].load(Relaxed),
            1,
            "task {i}: the continuation fires exactly once, canceled or not"
        );
        let expected_runs = if cancel_won[i] { 0 } else { 1 };
        assert_eq!(ran[i].load(Relaxed), expected_runs, "task {i}");
        assert_eq!(task.was_canceled(), cancel_won[i], "task {i}");
    }
    scheduler.stop_workers();
}

#[test]
fn busy_wait_from_inside_a_task_does_not_deadlock() {
    trace_init();
    let scheduler = Scheduler::new();
    // a single worker: if the parent parked instead of helping, the child
    // could never run.
    assert!(scheduler.start_workers(1, ThreadPriority::Normal));

    let child_ran = Arc::new(AtomicBool::new(false));
    let parent = Task::new();
    parent.init("parent", Priority::Normal, {
        let scheduler = scheduler.clone();
        let child_ran = child_ran.clone();
        move || {
            let child = Box::new(Task::new());
            child.init("child", Priority::High, {
                let child_ran = child_ran.clone();
                move || child_ran.store(true, Relaxed)
            });
            unsafe { scheduler.launch(&child, QueuePreference::Local) };
            scheduler.busy_wait(|| child.is_completed());
        }
    });

    unsafe { scheduler.launch(&parent, QueuePreference::GlobalOnly) };
    scheduler.busy_wait(|| parent.is_completed());
    assert!(child_ran.load(Relaxed));
    scheduler.stop_workers();
}

#[test]
fn producer_local_queue_is_stolen_from() {
    trace_init();
    const TASKS: usize = 64;

    let scheduler = Scheduler::new();
    scheduler.install_local_queue();
    assert!(scheduler.start_workers(2, ThreadPriority::Normal));

    let tasks: Vec<Task> = (0..TASKS).map(|_| Task::new()).collect();
    for task in &tasks {
        task.init("local", Priority::Normal, || {});
        // lands on this thread's queue; the workers have to steal it.
        unsafe { scheduler.launch(task, QueuePreference::Local) };
    }

    // wait without helping, so completion proves the workers stole the
    // tasks off this thread's queue.
    while !tasks.iter().all(Task::is_completed) {
        std::thread::yield_now();
    }

    scheduler.stop_workers();
    scheduler.uninstall_local_queue();
}

#[test]
fn restart_after_shutdown() {
    trace_init();
    let scheduler = Scheduler::new();

    for round in 0..3 {
        assert!(
            scheduler.start_workers(2, ThreadPriority::Normal),
            "round {round}"
        );
        let task = Task::new();
        task.init("roundtrip", Priority::Normal, || {});
        unsafe { scheduler.launch(&task, QueuePreference::GlobalOnly) };
        scheduler.busy_wait(|| task.is_completed());
        scheduler.stop_workers();
        assert!(!scheduler.is_active(), "round {round}");
    }
}
