use std::io;
use std::os::fd::RawFd;

/// Size of the window reserved in front of the readable bytes, so that a
/// length or type prefix can be prepended without shifting the payload.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

const CRLF: &[u8] = b"\r\n";

/// A growable byte queue with a cheap-prepend window and scatter reads.
///
/// The backing storage is one contiguous region with two indices:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=       reader     <=       writer      <=      size
/// ```
///
/// Appends go in at `writer`, consumption advances `reader`, and the
/// region before `reader` (at least [`CHEAP_PREPEND`] bytes after a reset)
/// is available for prepending. Integer accessors use network byte order.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// Total size of the backing region; always equals
    /// `prependable + readable + writable`.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes allocated by the backing vector, including slack.
    pub fn internal_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// The readable bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Offset of the first CRLF within the readable bytes.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Offset of the first CRLF at or after `start` (an offset into
    /// [`peek`](Buffer::peek)).
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(CRLF.len())
            .position(|w| w == CRLF)
            .map(|pos| start + pos)
    }

    /// Offset of the first `\n` within the readable bytes.
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    /// Consume `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume everything, resetting both indices to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Consume and return `len` bytes.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let data = self.peek()[..len].to_vec();
        self.retrieve(len);
        data
    }

    /// Consume and return all readable bytes.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.take(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Give back the last `len` appended bytes.
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer -= len;
    }

    /// Write `data` in front of the readable bytes. Must fit in the
    /// prepend window.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer += len;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            // Shift readable data back to the prepend boundary; the free
            // space on both sides together covers the request.
            assert!(CHEAP_PREPEND < self.reader);
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
            assert_eq!(readable, self.readable_bytes());
        }
    }

    /// Drop slack so that at most `readable + reserve` writable bytes are
    /// kept around.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut other = Buffer::with_capacity(readable + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Read from `fd` directly into the buffer with a two-segment vectored
    /// read: the writable tail first, then a 64 KiB stack buffer. Whatever
    /// lands in the stack buffer is appended afterwards, growing the buffer
    /// once. This avoids both a syscall to size the read and oversized
    /// per-connection buffers.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();
        let mut iovs = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        // When there is enough space in this buffer, don't read into the
        // stack buffer at all. At most `writable + 64 KiB` is read per call.
        let iovcnt: libc::c_int = if writable < extrabuf.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iovs.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }
}

macro_rules! int_accessors {
    ($ty: ty, $append: ident, $peek: ident, $read: ident, $prepend: ident) => {
        impl Buffer {
            /// Append in network byte order.
            pub fn $append(&mut self, x: $ty) {
                self.append(&x.to_be_bytes());
            }

            /// Peek in network byte order. Requires enough readable bytes.
            pub fn $peek(&self) -> $ty {
                const N: usize = std::mem::size_of::<$ty>();
                assert!(self.readable_bytes() >= N);
                let mut raw = [0u8; N];
                raw.copy_from_slice(&self.peek()[..N]);
                <$ty>::from_be_bytes(raw)
            }

            /// Read (peek + consume) in network byte order.
            pub fn $read(&mut self) -> $ty {
                let x = self.$peek();
                self.retrieve(std::mem::size_of::<$ty>());
                x
            }

            /// Prepend in network byte order.
            pub fn $prepend(&mut self, x: $ty) {
                self.prepend(&x.to_be_bytes());
            }
        }
    };
}

int_accessors!(u8, append_u8, peek_u8, read_u8, prepend_u8);
int_accessors!(u16, append_u16, peek_u16, read_u16, prepend_u16);
int_accessors!(u32, append_u32, peek_u32, read_u32, prepend_u32);
int_accessors!(u64, append_u64, peek_u64, read_u64, prepend_u64);
int_accessors!(i8, append_i8, peek_i8, read_i8, prepend_i8);
int_accessors!(i16, append_i16, peek_i16, read_i16, prepend_i16);
int_accessors!(i32, append_i32, peek_i32, read_i32, prepend_i32);
int_accessors!(i64, append_i64, peek_i64, read_i64, prepend_i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let s = vec![b'x'; 200];
        buf.append(&s);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let taken = buf.take(50);
        assert_eq!(taken.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.append(&vec![b'y'; 200]);
        assert_eq!(buf.readable_bytes(), 350);

        let rest = buf.take_all();
        assert_eq!(rest.len(), 350);
        assert_eq!(&rest[..150], &vec![b'x'; 150][..]);
        assert_eq!(&rest[150..], &vec![b'y'; 200][..]);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn regions_sum_to_capacity() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        buf.retrieve(6);
        buf.append(&vec![0u8; 3000]);
        assert_eq!(
            buf.readable_bytes() + buf.writable_bytes() + buf.prependable_bytes(),
            buf.capacity()
        );
    }

    #[test]
    fn append_preserves_existing_readable() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        let before = buf.peek().to_vec();
        buf.append(&vec![b'z'; 4096]);
        assert_eq!(&buf.peek()[..3], &before[..]);
        assert_eq!(buf.readable_bytes(), 3 + 4096);
    }

    #[test]
    fn grow_by_reallocation() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        assert_eq!(buf.readable_bytes(), 400);

        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1400);
        assert!(buf.capacity() >= 1400 + CHEAP_PREPEND);
    }

    #[test]
    fn grow_by_shifting_inside() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 800]);
        buf.retrieve(500);
        assert_eq!(buf.readable_bytes(), 300);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 500);

        // 300 readable + 400 new fits once the readable bytes move back to
        // the prepend boundary; the backing region must not grow.
        let capacity = buf.capacity();
        buf.append(&vec![b'z'; 400]);
        assert_eq!(buf.capacity(), capacity);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn prepend_within_window() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 200]);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.prepend_u32(0x1234_5678);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.read_u32(), 0x1234_5678);
        assert_eq!(buf.readable_bytes(), 200);
    }

    #[test]
    fn int_round_trips() {
        let mut buf = Buffer::new();
        buf.append_u8(0xab);
        buf.append_u16(0xbeef);
        buf.append_u32(0xdead_beef);
        buf.append_u64(0x0102_0304_0506_0708);
        buf.append_i8(-9);
        buf.append_i16(-30000);
        buf.append_i32(-2_000_000_000);
        buf.append_i64(-9_000_000_000_000_000_000);
        assert_eq!(buf.readable_bytes(), 1 + 2 + 4 + 8 + 1 + 2 + 4 + 8);

        // Network byte order on the wire.
        assert_eq!(buf.peek()[0], 0xab);
        assert_eq!(&buf.peek()[1..3], &[0xbe, 0xef]);

        assert_eq!(buf.read_u8(), 0xab);
        assert_eq!(buf.read_u16(), 0xbeef);
        assert_eq!(buf.read_u32(), 0xdead_beef);
        assert_eq!(buf.read_u64(), 0x0102_0304_0506_0708);
        assert_eq!(buf.read_i8(), -9);
        assert_eq!(buf.read_i16(), -30000);
        assert_eq!(buf.read_i32(), -2_000_000_000);
        assert_eq!(buf.read_i64(), -9_000_000_000_000_000_000);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buf = Buffer::new();
        buf.append_u32(7);
        assert_eq!(buf.peek_u32(), 7);
        assert_eq!(buf.peek_u32(), 7);
        assert_eq!(buf.readable_bytes(), 4);
        assert_eq!(buf.read_u32(), 7);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        assert_eq!(buf.find_crlf(), None);
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_crlf_from(15), Some(23));
        assert_eq!(buf.find_eol(), Some(15));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
    }

    #[test]
    fn unwrite_and_shrink() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 2000]);
        buf.unwrite(500);
        assert_eq!(buf.readable_bytes(), 1500);

        buf.retrieve(1400);
        buf.shrink(16);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(&buf.peek()[..], &vec![b'x'; 100][..]);
        assert!(buf.capacity() <= CHEAP_PREPEND + 100 + 16);
    }

    #[test]
    #[should_panic]
    fn read_underflow_panics() {
        let mut buf = Buffer::new();
        buf.append_u16(1);
        let _ = buf.read_u32();
    }

    #[test]
    fn scatter_read_from_stream() {
        use std::io::Write;
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload: Vec<u8> = (0..70_000usize).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = std::thread::spawn(move || {
            tx.write_all(&payload).unwrap();
        });

        let mut buf = Buffer::new();
        while buf.readable_bytes() < expected.len() {
            match buf.read_from_fd(rx.as_raw_fd()) {
                Ok(0) => break,
                Ok(n) => {
                    // One call never reads past the writable tail plus the
                    // 64 KiB overflow segment.
                    assert!(n <= 65536 + buf.capacity());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("read_from_fd: {}", e),
            }
        }
        writer.join().unwrap();
        assert_eq!(buf.readable_bytes(), expected.len());
        assert_eq!(buf.peek(), &expected[..]);
        // 70 000 readable bytes cannot fit the initial region, so the
        // overflow segment forced at least one growth.
        assert!(buf.capacity() > CHEAP_PREPEND + INITIAL_SIZE);
    }

    #[test]
    fn scatter_read_exact_boundary() {
        use std::io::Write;
        use std::os::fd::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        // Exactly writable + 65535: one vectored read fills the writable
        // tail and all but one byte of the overflow segment.
        let total = INITIAL_SIZE + 65535;
        let payload = vec![0x5au8; total];
        let writer = std::thread::spawn(move || {
            tx.write_all(&payload).unwrap();
        });
        writer.join().unwrap();

        let mut buf = Buffer::new();
        let mut got = 0;
        while got < total {
            match buf.read_from_fd(rx.as_raw_fd()) {
                Ok(n) => got += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("read_from_fd: {}", e),
            }
        }
        assert_eq!(buf.readable_bytes(), total);
        assert!(buf.peek().iter().all(|&b| b == 0x5a));
    }
}
