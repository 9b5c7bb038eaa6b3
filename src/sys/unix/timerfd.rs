use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A single timer descriptor on the monotonic clock.
///
/// The descriptor becomes readable when the armed expiration passes; the
/// read returns the number of expirations since the last read.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        Ok(TimerFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Rearm the descriptor to expire at the absolute monotonic time `at`.
    ///
    /// A zero `at` would disarm the descriptor, so the caller must hand in a
    /// strictly positive timestamp.
    pub(crate) fn set(&self, at: libc::timespec) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: at,
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            libc::TFD_TIMER_ABSTIME,
            &new_value,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }

    /// Acknowledge an expiration, returning how many times the timer fired.
    pub(crate) fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))?;
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read on timer descriptor",
            ));
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
