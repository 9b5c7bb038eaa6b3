pub(crate) mod net;

mod selector;
pub(crate) use self::selector::Selector;

mod timerfd;
pub(crate) use self::timerfd::TimerFd;

mod waker;
pub(crate) use self::waker::Waker;
