mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel::EventLoopThread;

#[test]
fn run_in_loop_executes_exactly_once_on_loop_thread() {
    util::init();
    let mut loop_thread = EventLoopThread::new("run-in-loop");
    let handle = loop_thread.start_loop(None);

    let count = Arc::new(AtomicUsize::new(0));
    let loop_thread_id = Arc::new(Mutex::new(None));
    {
        let loop_thread_id = loop_thread_id.clone();
        handle.run_in_loop(move || {
            *loop_thread_id.lock().unwrap() = Some(std::thread::current().id());
        });
    }
    assert!(util::wait_until(Duration::from_secs(5), || {
        loop_thread_id.lock().unwrap().is_some()
    }));
    let loop_thread_id = loop_thread_id.lock().unwrap().unwrap();
    assert_ne!(loop_thread_id, std::thread::current().id());

    for _ in 0..100 {
        let count = count.clone();
        handle.run_in_loop(move || {
            assert_eq!(std::thread::current().id(), loop_thread_id);
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(util::wait_until(Duration::from_secs(5), || {
        count.load(Ordering::SeqCst) == 100
    }));
    // Exactly once each: nothing ran twice.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 100);
}

#[test]
fn run_in_loop_on_loop_thread_is_immediate() {
    util::init();
    let mut loop_thread = EventLoopThread::new("immediate");
    let handle = loop_thread.start_loop(None);

    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = order.clone();
        let handle_inner = handle.clone();
        handle.run_in_loop(move || {
            order.lock().unwrap().push("outer-start");
            let order_inner = order.clone();
            // Already on the loop thread: must run inline, not get queued.
            handle_inner.run_in_loop(move || {
                order_inner.lock().unwrap().push("inner");
            });
            order.lock().unwrap().push("outer-end");
        });
    }
    assert!(util::wait_until(Duration::from_secs(5), || {
        order.lock().unwrap().len() == 3
    }));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["outer-start", "inner", "outer-end"]
    );
}

#[test]
fn queue_in_loop_runs_after_current_iteration() {
    util::init();
    let mut loop_thread = EventLoopThread::new("queued");
    let handle = loop_thread.start_loop(None);

    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = order.clone();
        let handle_inner = handle.clone();
        handle.run_in_loop(move || {
            order.lock().unwrap().push("task");
            let order_inner = order.clone();
            handle_inner.queue_in_loop(move || {
                order_inner.lock().unwrap().push("queued");
            });
            order.lock().unwrap().push("task-end");
        });
    }
    assert!(util::wait_until(Duration::from_secs(5), || {
        order.lock().unwrap().len() == 3
    }));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["task", "task-end", "queued"]
    );
}

#[test]
fn quit_from_another_thread_stops_the_loop() {
    util::init();
    let mut loop_thread = EventLoopThread::new("quitter");
    let handle = loop_thread.start_loop(None);
    handle.quit();
    // Dropping joins; a loop that ignored quit would hang the test here.
    drop(loop_thread);
}
