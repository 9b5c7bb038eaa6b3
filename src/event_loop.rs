use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::timer::{Timer, TimerQueue};
use crate::{sys, TimerId, Timestamp};

const POLL_TIMEOUT_MS: i32 = 10_000;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Key into a loop's table of loop-confined objects.
pub(crate) fn next_local_id() -> u64 {
    NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

/// The cross-thread face of one loop: the task queue sender, the wake-up
/// descriptor, and the flags both sides consult.
pub(crate) struct HandleShared {
    sender: Sender<Task>,
    waker: sys::Waker,
    thread: ThreadId,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    pending_count: AtomicUsize,
}

impl HandleShared {
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn queue(&self, task: Task) {
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).is_err() {
            // The loop has been destroyed; nothing will drain the queue.
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
            trace!("task queued on a dead loop, dropped");
            return;
        }
        // Waking is needed when the caller is off-thread, and also when the
        // loop is draining tasks right now: a task queued from within the
        // drain must force another iteration.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub(crate) fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            error!("EventLoop wakeup: {}", e);
        }
    }
}

/// Loop-thread-confined state shared between the loop and the objects it
/// drives (channels, connection drivers, timers).
///
/// Being behind `Rc` the whole structure is `!Send`, which turns most
/// thread-affinity violations into compile errors. The one relation the
/// type system cannot express, "the loop currently running on this
/// thread", is the thread-local set up by [`EventLoop::new`] and used by
/// posted tasks to find their loop-local targets.
pub(crate) struct LoopCore {
    pub(crate) shared: Arc<HandleShared>,
    poller: RefCell<Poller>,
    pub(crate) timers: TimerQueue,
    locals: RefCell<HashMap<u64, Rc<dyn Any>>>,
    iteration: Cell<u64>,
    poll_return_time: Cell<Timestamp>,
    event_handling: Cell<bool>,
    context: RefCell<Option<Box<dyn Any>>>,
}

impl LoopCore {
    /// The loop owning the current thread. Panics when called from a
    /// thread that does not run one; every caller is on a code path that
    /// the loop itself scheduled, so that would be a programming error.
    pub(crate) fn current() -> Rc<LoopCore> {
        LoopCore::try_current().expect("no EventLoop on this thread")
    }

    pub(crate) fn try_current() -> Option<Rc<LoopCore>> {
        CURRENT_LOOP.with(|current| current.borrow().clone())
    }

    pub(crate) fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let mut poller = self.poller.borrow_mut();
        debug_assert!(poller.has_channel(channel));
        poller.remove_channel(channel);
    }

    pub(crate) fn insert_local(&self, id: u64, local: Rc<dyn Any>) {
        let previous = self.locals.borrow_mut().insert(id, local);
        debug_assert!(previous.is_none());
    }

    pub(crate) fn get_local(&self, id: u64) -> Option<Rc<dyn Any>> {
        self.locals.borrow().get(&id).cloned()
    }

    pub(crate) fn take_local(&self, id: u64) -> Option<Rc<dyn Any>> {
        self.locals.borrow_mut().remove(&id)
    }

    /// Schedule a (possibly `!Send`) callback on this loop. Only reachable
    /// from the loop thread, so the timer never crosses threads.
    pub(crate) fn run_at_local(
        &self,
        when: Timestamp,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) -> TimerId {
        let id = TimerId::next();
        self.timers
            .add_timer_in_loop(Timer::new(id, callback, when, interval));
        id
    }

    pub(crate) fn run_after_local(&self, delay: Duration, callback: Box<dyn FnMut()>) -> TimerId {
        self.run_at_local(Timestamp::now() + delay, None, callback)
    }
}

/// A per-thread reactor: polls for readiness, dispatches channel
/// callbacks, runs queued tasks and expired timers.
///
/// At most one `EventLoop` may exist per thread, and all of its operations
/// happen on that thread; the type is `!Send`, and a second construction
/// on the same thread panics. Cross-thread work goes through the
/// [`LoopHandle`] returned by [`handle`](EventLoop::handle).
pub struct EventLoop {
    core: Rc<LoopCore>,
    tasks: Receiver<Task>,
    wake_channel: Rc<Channel>,
    timer_channel: Rc<Channel>,
    active_channels: Vec<Rc<Channel>>,
    looping: bool,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let poller = Poller::new()?;
        let timers = TimerQueue::new()?;
        let waker = sys::Waker::new()?;
        let (sender, receiver) = mpsc::channel();

        let shared = Arc::new(HandleShared {
            sender,
            waker,
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            pending_count: AtomicUsize::new(0),
        });
        let core = Rc::new(LoopCore {
            shared,
            poller: RefCell::new(poller),
            timers,
            locals: RefCell::new(HashMap::new()),
            iteration: Cell::new(0),
            poll_return_time: Cell::new(Timestamp::default()),
            event_handling: Cell::new(false),
            context: RefCell::new(None),
        });

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.is_none(),
                "another EventLoop already exists on this thread"
            );
            *current = Some(core.clone());
        });

        let wake_channel = Channel::new(&core, core.shared.waker.as_raw_fd());
        {
            let core = Rc::downgrade(&core);
            wake_channel.set_read_callback(Box::new(move |_| {
                if let Some(core) = core.upgrade() {
                    if let Err(e) = core.shared.waker.drain() {
                        error!("wake-up drain: {}", e);
                    }
                }
            }));
        }
        wake_channel.enable_reading();

        let timer_channel = Channel::new(&core, core.timers.as_raw_fd());
        {
            let core = Rc::downgrade(&core);
            timer_channel.set_read_callback(Box::new(move |_| {
                if let Some(core) = core.upgrade() {
                    core.timers.handle_expired();
                }
            }));
        }
        timer_channel.enable_reading();

        debug!("EventLoop created on {:?}", thread::current().id());
        Ok(EventLoop {
            core,
            tasks: receiver,
            wake_channel,
            timer_channel,
            active_channels: Vec::new(),
            looping: false,
        })
    }

    /// Run the reactor until [`quit`](EventLoop::quit) is called.
    ///
    /// Each iteration polls, dispatches every active channel with the poll
    /// return timestamp, then drains the task queue, so tasks queued from
    /// callbacks always run after all channels of that iteration have been
    /// serviced.
    pub fn run(&mut self) {
        assert!(!self.looping);
        self.looping = true;
        trace!("EventLoop start looping");

        while !self.core.shared.quit.load(Ordering::SeqCst) {
            self.active_channels.clear();
            let receive_time = self
                .core
                .poller
                .borrow_mut()
                .poll(POLL_TIMEOUT_MS, &mut self.active_channels);
            self.core.poll_return_time.set(receive_time);
            self.core.iteration.set(self.core.iteration.get() + 1);

            self.core.event_handling.set(true);
            for channel in &self.active_channels {
                channel.handle_event(receive_time);
            }
            self.core.event_handling.set(false);

            self.process_pending_tasks();
        }

        // Tasks queued alongside the quit request (connection teardown,
        // mostly) still run; anything queued after this drain is lost.
        self.process_pending_tasks();
        trace!("EventLoop stop looping");
        self.looping = false;
    }

    fn process_pending_tasks(&self) {
        self.core
            .shared
            .calling_pending
            .store(true, Ordering::SeqCst);
        // Snapshot, then run: tasks the loop queues on itself while running
        // these stay behind for the next iteration (the queue() wake-up
        // guarantees there is one).
        let tasks: Vec<Task> = self.tasks.try_iter().collect();
        self.core
            .shared
            .pending_count
            .fetch_sub(tasks.len(), Ordering::SeqCst);
        for task in tasks {
            task();
        }
        self.core
            .shared
            .calling_pending
            .store(false, Ordering::SeqCst);
    }

    /// Ask the loop to stop after the current iteration. Callable from any
    /// thread via the handle; here for the owning thread.
    pub fn quit(&self) {
        self.core.shared.quit.store(true, Ordering::SeqCst);
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.core.shared.clone(),
        }
    }

    /// Run `f` now. The loop is `!Send`, so the caller necessarily is on
    /// the owning thread; this exists for symmetry with
    /// [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce()) {
        f();
    }

    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.core.shared.queue(Box::new(f));
    }

    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + 'static) -> TimerId {
        self.core.run_at_local(when, None, Box::new(callback))
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.core.run_after_local(delay, Box::new(callback))
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.core
            .run_at_local(Timestamp::now() + interval, Some(interval), Box::new(callback))
    }

    pub fn cancel(&self, id: TimerId) {
        self.core.timers.cancel_in_loop(id);
    }

    /// Time the last poll returned; read callbacks receive the same value.
    pub fn poll_return_time(&self) -> Timestamp {
        self.core.poll_return_time.get()
    }

    pub fn iteration(&self) -> u64 {
        self.core.iteration.get()
    }

    pub fn queue_size(&self) -> usize {
        self.core.shared.pending_count.load(Ordering::SeqCst)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.core.is_in_loop_thread()
    }

    /// Store an arbitrary per-loop value.
    pub fn set_context(&self, context: Box<dyn Any>) {
        *self.core.context.borrow_mut() = Some(context);
    }

    /// Borrow the loop context as `T`. `None` when unset or of another
    /// type.
    pub fn with_context<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.core.context.borrow_mut();
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    pub(crate) fn core(&self) -> &Rc<LoopCore> {
        &self.core
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        assert!(!self.looping);
        debug!("EventLoop drop on {:?}", thread::current().id());
        self.wake_channel.disable_all();
        self.wake_channel.remove();
        self.timer_channel.disable_all();
        self.timer_channel.remove();
        CURRENT_LOOP.with(|current| current.borrow_mut().take());
    }
}

/// Cloneable, `Send` handle to an [`EventLoop`], valid for the loop's
/// lifetime. Tasks posted to a destroyed loop are silently dropped.
///
/// These are exactly the cross-thread-safe loop operations: `run_in_loop`,
/// `queue_in_loop`, `wakeup`, `quit`, and timer scheduling.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<HandleShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Run `f` on the loop thread: immediately when already there,
    /// otherwise queued behind a wake-up.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queue `f` for the drain phase of a loop iteration, even when called
    /// on the loop thread.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.queue(Box::new(f));
    }

    /// Interrupt the loop's readiness wait.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.shared.pending_count.load(Ordering::SeqCst)
    }

    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(when, None, callback)
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timestamp::now() + delay, None, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timestamp::now() + interval, Some(interval), callback)
    }

    fn schedule(
        &self,
        when: Timestamp,
        interval: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        // The id is allocated here so the caller gets it synchronously; the
        // timer itself is built on the loop thread.
        let id = TimerId::next();
        self.run_in_loop(move || {
            LoopCore::current()
                .timers
                .add_timer_in_loop(Timer::new(id, Box::new(callback), when, interval));
        });
        id
    }

    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || LoopCore::current().timers.cancel_in_loop(id));
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}
