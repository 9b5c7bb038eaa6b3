use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use log::{error, trace};

use crate::channel::{events_to_string, Channel, PollState};
use crate::{sys, Timestamp};

const INIT_EVENT_LIST_SIZE: usize = 16;

/// The loop's readiness oracle.
///
/// Wraps the kernel selector (level-triggered epoll) together with the
/// fd-to-channel map and the ready list. Between dispatches the map is
/// consistent with the kernel registration state; the `PollState` on each
/// channel tracks which side of that state it is on.
pub(crate) struct Poller {
    selector: sys::Selector,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        Ok(Poller {
            selector: sys::Selector::new()?,
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    /// Wait for readiness, filling `active_channels` with every channel
    /// that has events pending. Returns the poll return time, which is
    /// handed to read callbacks as the receive timestamp.
    pub(crate) fn poll(
        &mut self,
        timeout_ms: i32,
        active_channels: &mut Vec<Rc<Channel>>,
    ) -> Timestamp {
        trace!("fd total count {}", self.channels.len());
        let result = self.selector.select(&mut self.events, timeout_ms);
        let now = Timestamp::now();
        match result {
            Ok(0) => trace!("nothing happened"),
            Ok(n) => {
                trace!("{} events happened", n);
                self.fill_active_channels(active_channels);
                if n == self.events.capacity() {
                    // The ready list came back full; grow it so a burst is
                    // picked up in one wait next time.
                    self.events.reserve(self.events.capacity());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!("Poller::poll: {}", e),
        }
        now
    }

    fn fill_active_channels(&self, active_channels: &mut Vec<Rc<Channel>>) {
        for event in &self.events {
            let fd = event.u64 as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .expect("readiness event for unknown fd");
            channel.set_revents(event.events);
            active_channels.push(channel.clone());
        }
    }

    /// Apply the channel's desired event mask to the kernel, moving it
    /// through the New/Added/Deleted registration states.
    pub(crate) fn update_channel(&mut self, channel: &Rc<Channel>) {
        let state = channel.poll_state();
        let fd = channel.fd();
        trace!(
            "fd = {} events = {{{}}} state = {:?}",
            fd,
            events_to_string(channel.events()),
            state
        );
        match state {
            PollState::New | PollState::Deleted => {
                if state == PollState::New {
                    assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, channel.clone());
                } else {
                    assert!(self.channels.contains_key(&fd));
                }
                channel.set_poll_state(PollState::Added);
                self.ctl("add", self.selector.register(fd, channel.events()), fd);
            }
            PollState::Added => {
                assert!(self.channels.contains_key(&fd));
                if channel.is_none_event() {
                    if let Err(e) = self.selector.deregister(fd) {
                        error!("epoll_ctl del fd = {}: {}", fd, e);
                    }
                    channel.set_poll_state(PollState::Deleted);
                } else {
                    self.ctl("mod", self.selector.reregister(fd, channel.events()), fd);
                }
            }
        }
    }

    // Failing to add or modify a registration leaves the loop blind to the
    // descriptor; there is no caller that can recover from that.
    fn ctl(&self, op: &str, result: io::Result<()>, fd: RawFd) {
        if let Err(e) = result {
            error!("epoll_ctl {} fd = {}: {}", op, fd, e);
            panic!("epoll_ctl {} failed for fd {}: {}", op, fd, e);
        }
    }

    /// Forget the channel entirely, deregistering it if still registered.
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("fd = {}", fd);
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let state = channel.poll_state();
        assert!(state == PollState::Added || state == PollState::Deleted);
        self.channels.remove(&fd);

        if state == PollState::Added {
            if let Err(e) = self.selector.deregister(fd) {
                error!("epoll_ctl del fd = {}: {}", fd, e);
            }
        }
        channel.set_poll_state(PollState::New);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|held| std::ptr::eq(held.as_ref(), channel))
    }
}
