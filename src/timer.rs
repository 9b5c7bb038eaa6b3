use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{error, trace};

use crate::{sys, Timestamp};

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identifies one scheduled timer for cancellation.
///
/// The sequence number is process-globally unique, so a stale id can never
/// cancel a timer it was not issued for.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn next() -> TimerId {
        TimerId(NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed))
    }

    fn seq(self) -> u64 {
        self.0
    }
}

pub(crate) type TimerCallback = Box<dyn FnMut()>;

pub(crate) struct Timer {
    id: TimerId,
    callback: RefCell<TimerCallback>,
    expiration: Cell<Timestamp>,
    interval: Option<Duration>,
}

impl Timer {
    pub(crate) fn new(
        id: TimerId,
        callback: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> Timer {
        Timer {
            id,
            callback: RefCell::new(callback),
            expiration: Cell::new(when),
            interval,
        }
    }

    fn run(&self) {
        (self.callback.borrow_mut())();
    }

    fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    fn restart(&self, now: Timestamp) {
        if let Some(interval) = self.interval {
            self.expiration.set(now + interval);
        }
    }
}

/// A best-effort timer set multiplexed onto a single timer descriptor.
///
/// Timers are kept ordered by `(expiration, sequence)`; equal expirations
/// stay totally ordered by their globally unique sequence. The descriptor
/// is rearmed whenever the head of the set changes. All operations run on
/// the owning loop thread; cross-thread scheduling goes through the loop's
/// task queue.
pub(crate) struct TimerQueue {
    timerfd: sys::TimerFd,
    timers: RefCell<BTreeMap<(Timestamp, u64), Rc<Timer>>>,
    // Entry per live timer, keyed by sequence, for cancellation.
    active: RefCell<HashMap<u64, Rc<Timer>>>,
    calling_expired: Cell<bool>,
    canceling: RefCell<HashSet<u64>>,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            timerfd: sys::TimerFd::new()?,
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(HashMap::new()),
            calling_expired: Cell::new(false),
            canceling: RefCell::new(HashSet::new()),
        })
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    pub(crate) fn add_timer_in_loop(&self, timer: Timer) {
        let timer = Rc::new(timer);
        let earliest_changed = self.insert(&timer);
        if earliest_changed {
            self.rearm(timer.expiration.get());
        }
    }

    pub(crate) fn cancel_in_loop(&self, id: TimerId) {
        let found = self.active.borrow_mut().remove(&id.seq());
        if let Some(timer) = found {
            self.timers
                .borrow_mut()
                .remove(&(timer.expiration.get(), id.seq()));
            debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
        } else if self.calling_expired.get() {
            // The timer is being dispatched right now; remember not to
            // reschedule it.
            self.canceling.borrow_mut().insert(id.seq());
        }
    }

    /// Called when the timer descriptor becomes readable: extract and run
    /// everything that has expired, then reschedule repeating timers.
    pub(crate) fn handle_expired(&self) {
        let now = Timestamp::now();
        match self.timerfd.read() {
            Ok(n) => trace!("timer descriptor fired {} time(s) at {}", n, now),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("timer descriptor read: {}", e),
        }

        let expired = self.expire(now);

        self.canceling.borrow_mut().clear();
        self.calling_expired.set(true);
        for timer in &expired {
            timer.run();
        }
        self.calling_expired.set(false);

        self.reset(expired, now);
    }

    fn insert(&self, timer: &Rc<Timer>) -> bool {
        let mut timers = self.timers.borrow_mut();
        let when = timer.expiration.get();
        let earliest_changed = timers
            .first_key_value()
            .map_or(true, |((first, _), _)| when < *first);
        timers.insert((when, timer.id.seq()), timer.clone());
        self.active.borrow_mut().insert(timer.id.seq(), timer.clone());
        debug_assert_eq!(timers.len(), self.active.borrow().len());
        earliest_changed
    }

    /// Move every entry with `expiration <= now` out of both sets.
    fn expire(&self, now: Timestamp) -> Vec<Rc<Timer>> {
        let mut timers = self.timers.borrow_mut();
        let remaining = timers.split_off(&(now, u64::MAX));
        let expired: Vec<Rc<Timer>> =
            std::mem::replace(&mut *timers, remaining).into_values().collect();
        let mut active = self.active.borrow_mut();
        for timer in &expired {
            active.remove(&timer.id.seq());
        }
        debug_assert_eq!(timers.len(), active.len());
        expired
    }

    fn reset(&self, expired: Vec<Rc<Timer>>, now: Timestamp) {
        for timer in expired {
            if timer.repeat() && !self.canceling.borrow().contains(&timer.id.seq()) {
                timer.restart(now);
                self.insert(&timer);
            }
        }
        let next = self
            .timers
            .borrow()
            .first_key_value()
            .map(|((when, _), _)| *when);
        if let Some(when) = next {
            self.rearm(when);
        }
    }

    fn rearm(&self, when: Timestamp) {
        // A zero timespec would disarm the descriptor, and an expiration in
        // the past must still fire; clamp to just after now.
        let now = Timestamp::now();
        let at = if when <= now {
            now + Duration::from_micros(1)
        } else {
            when
        };
        if let Err(e) = self.timerfd.set(at.to_timespec()) {
            error!("timer descriptor rearm: {}", e);
        }
    }
}
