use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    /// Wait for events, for at most `timeout_ms` milliseconds (-1 blocks
    /// indefinitely). `events` is filled up to its capacity; the caller is
    /// responsible for growing it when it comes back full.
    pub(crate) fn select(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout_ms: libc::c_int,
    ) -> io::Result<usize> {
        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout_ms,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
            n_events as usize
        })
    }

    pub(crate) fn register(&self, fd: RawFd, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}
