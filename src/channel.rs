use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use log::{trace, warn};

use crate::event_loop::LoopCore;
use crate::Timestamp;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

/// Registration state of a channel inside its loop's poller.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum PollState {
    /// Never handed to the poller.
    New,
    /// In the poller's map and registered with the kernel.
    Added,
    /// In the poller's map but deregistered from the kernel.
    Deleted,
}

pub(crate) type ReadEventCallback = Box<dyn FnMut(Timestamp)>;
pub(crate) type EventCallback = Box<dyn FnMut()>;

/// Binds one descriptor to an event loop: the interest mask, the received
/// events of the current iteration, and the per-event callbacks.
///
/// A `Channel` never owns its descriptor; the owner (connection, acceptor,
/// the loop itself for its wake-up and timer descriptors) keeps it alive
/// and removes the channel before closing the fd. An optional tie to the
/// owner is upgraded for the duration of each dispatch so a connection
/// torn down mid-iteration cannot be used after free.
pub(crate) struct Channel {
    core: Weak<LoopCore>,
    self_ref: Weak<Channel>,
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    poll_state: Cell<PollState>,
    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    tie: RefCell<Option<Weak<dyn Any>>>,
    read_callback: RefCell<Option<ReadEventCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub(crate) fn new(core: &Rc<LoopCore>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|self_ref| Channel {
            core: Rc::downgrade(core),
            self_ref: self_ref.clone(),
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            poll_state: Cell::new(PollState::New),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            tie: RefCell::new(None),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub(crate) fn set_read_callback(&self, cb: ReadEventCallback) {
        *self.read_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        *self.write_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        *self.close_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        *self.error_callback.borrow_mut() = Some(cb);
    }

    /// Tie this channel to its owner. Before every dispatch the weak
    /// reference is upgraded; if the owner is gone the events are stale and
    /// dispatch is skipped.
    pub(crate) fn tie(&self, owner: &Rc<dyn Any>) {
        *self.tie.borrow_mut() = Some(Rc::downgrade(owner));
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    pub(crate) fn enable_reading(&self) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    pub(crate) fn disable_reading(&self) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    pub(crate) fn poll_state(&self) -> PollState {
        self.poll_state.get()
    }

    pub(crate) fn set_poll_state(&self, state: PollState) {
        self.poll_state.set(state);
    }

    fn update(&self) {
        self.added_to_loop.set(true);
        if let (Some(core), Some(this)) = (self.core.upgrade(), self.self_ref.upgrade()) {
            core.update_channel(&this);
        }
    }

    /// Drop the poller registration. The channel must have no interests
    /// left.
    pub(crate) fn remove(&self) {
        assert!(self.is_none_event());
        self.added_to_loop.set(false);
        if let Some(core) = self.core.upgrade() {
            core.remove_channel(self);
        }
    }

    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.tie.borrow().clone();
        match tie {
            Some(tie) => {
                // Keep the owner alive across dispatch; a dead owner means
                // the events are stale.
                if let Some(_guard) = tie.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        self.event_handling.set(true);
        let revents = self.revents.get();
        trace!("fd = {} handling {{{}}}", self.fd, events_to_string(revents));

        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            warn!("fd = {} EPOLLHUP without pending read", self.fd);
            self.invoke(&self.close_callback);
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            self.invoke(&self.error_callback);
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
            self.invoke_read(receive_time);
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            self.invoke(&self.write_callback);
        }
        self.event_handling.set(false);
    }

    // Callbacks are taken out of their slot for the duration of the call,
    // so a callback may reach back into this channel (enable writing,
    // install a new callback) without double borrowing.
    fn invoke(&self, slot: &RefCell<Option<EventCallback>>) {
        let taken = slot.borrow_mut().take();
        if let Some(mut cb) = taken {
            cb();
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn invoke_read(&self, receive_time: Timestamp) {
        let taken = self.read_callback.borrow_mut().take();
        if let Some(mut cb) = taken {
            cb(receive_time);
            let mut slot = self.read_callback.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.get());
        // Owners normally deregister before letting go; cover abnormal
        // teardown so the poller never keeps a dangling fd.
        if self.added_to_loop.get() {
            if let Some(core) = self.core.upgrade() {
                trace!("fd = {} still registered at drop, removing", self.fd);
                self.events.set(NONE_EVENT);
                core.remove_channel(self);
            }
        }
    }
}

pub(crate) fn events_to_string(events: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (libc::EPOLLIN as u32, "IN"),
        (libc::EPOLLPRI as u32, "PRI"),
        (libc::EPOLLOUT as u32, "OUT"),
        (libc::EPOLLHUP as u32, "HUP"),
        (libc::EPOLLRDHUP as u32, "RDHUP"),
        (libc::EPOLLERR as u32, "ERR"),
    ] {
        if events & bit != 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
        }
    }
    out
}
