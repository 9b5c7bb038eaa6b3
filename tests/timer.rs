mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel::{EventLoopThread, Timestamp};

#[test]
fn cancel_repeating_mid_flight() {
    util::init();
    let mut loop_thread = EventLoopThread::new("timers");
    let handle = loop_thread.start_loop(None);

    let one_shot = Arc::new(AtomicUsize::new(0));
    let repeating = Arc::new(AtomicUsize::new(0));

    {
        let one_shot = one_shot.clone();
        handle.run_after(Duration::from_millis(200), move || {
            one_shot.fetch_add(1, Ordering::SeqCst);
        });
    }
    let id = {
        let repeating = repeating.clone();
        handle.run_every(Duration::from_millis(100), move || {
            repeating.fetch_add(1, Ordering::SeqCst);
        })
    };
    {
        let handle_inner = handle.clone();
        handle.run_after(Duration::from_millis(250), move || {
            handle_inner.cancel(id);
        });
    }

    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(one_shot.load(Ordering::SeqCst), 1);
    let fired = repeating.load(Ordering::SeqCst);
    assert!(
        (2..=3).contains(&fired),
        "repeating timer fired {} times",
        fired
    );
}

#[test]
fn cancel_before_expiry_never_fires() {
    util::init();
    let mut loop_thread = EventLoopThread::new("cancel");
    let handle = loop_thread.start_loop(None);

    let fired = Arc::new(AtomicUsize::new(0));
    let id = {
        let fired = fired.clone();
        handle.run_after(Duration::from_millis(200), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };
    handle.cancel(id);

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn timer_canceling_itself_stops_repeating() {
    util::init();
    let mut loop_thread = EventLoopThread::new("self-cancel");
    let handle = loop_thread.start_loop(None);

    let fired = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<keel::TimerId>>> = Arc::new(Mutex::new(None));

    let id = {
        let fired = fired.clone();
        let id_slot = id_slot.clone();
        let handle_inner = handle.clone();
        handle.run_every(Duration::from_millis(50), move || {
            let n = fired.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                // Cancellation from inside the timer's own callback must
                // stop the rescheduling.
                if let Some(id) = *id_slot.lock().unwrap() {
                    handle_inner.cancel(id);
                }
            }
        })
    };
    *id_slot.lock().unwrap() = Some(id);

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn timers_fire_in_expiration_order() {
    util::init();
    let mut loop_thread = EventLoopThread::new("ordering");
    let handle = loop_thread.start_loop(None);

    let order = Arc::new(Mutex::new(Vec::new()));
    let now = Timestamp::now();
    for (label, delay_ms) in [("c", 150u64), ("a", 50), ("b", 100)] {
        let order = order.clone();
        handle.run_at(now + Duration::from_millis(delay_ms), move || {
            order.lock().unwrap().push(label);
        });
    }

    assert!(util::wait_until(Duration::from_secs(5), || {
        order.lock().unwrap().len() == 3
    }));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}
