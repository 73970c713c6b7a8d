use crate::macros::syscall;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

/// Bytes reserved ahead of the readable region so a fixed-length header
/// (e.g. a 32-bit length prefix) can be prepended without reallocating.
pub const CHEAP_PREPEND: usize = 8;
/// Default size of the readable+writable region of a freshly constructed
/// buffer, not counting the prepend reserve.
pub const INITIAL_SIZE: usize = 1024;

const OVERFLOW_SIZE: usize = 65536;

/// A growable byte queue with a small prepend area, used as both the
/// connection's input and output buffer.
///
/// Three cursors partition the backing storage: `[0, reader)` is the
/// prepend region, `[reader, writer)` is readable, `[writer, capacity)` is
/// writable. The invariant `readable() + writable() + prependable() ==
/// capacity()` holds after every operation.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            storage: vec![0u8; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn readable(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable(&self) -> usize {
        self.storage.len() - self.writer
    }

    pub fn prependable(&self) -> usize {
        self.reader
    }

    /// The readable region, as a slice.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader..self.writer]
    }

    /// Reads a 32-bit big-endian length prefix without consuming it.
    ///
    /// Precondition: `readable() >= 4`. Callers (e.g. a length-prefix
    /// framing decoder) must check this themselves before calling; unlike
    /// the original, which silently falls through and returns an
    /// uninitialized value when too few bytes are available, this makes
    /// the precondition explicit by panicking.
    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable() >= 4, "peek_i32: fewer than 4 readable bytes");
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.storage[self.reader..self.reader + 4]);
        i32::from_be_bytes(bytes)
    }

    /// Advances the read cursor by `n` bytes, which must not exceed
    /// `readable()`.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable());
        if n < self.readable() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Consumes the entire readable region and returns it as an owned
    /// `Vec<u8>`.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable();
        self.retrieve_as_vec(n)
    }

    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        let out = self.storage[self.reader..self.reader + n].to_vec();
        self.retrieve(n);
        out
    }

    /// Consumes the entire readable region and returns it as a `String`.
    ///
    /// Invalid UTF-8 is replaced, matching `String::from_utf8_lossy`; the
    /// original treats the buffer as an opaque `std::string` with no
    /// encoding requirement, so this is the closest faithful analogue in a
    /// language with a distinct string type.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_vec()).into_owned()
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
    }

    /// Appends `data` to the writable tail, growing the buffer if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    /// Writes `data` directly behind the prepend reserve, growing the
    /// write cursor backwards. Precondition: `data.len() <= prependable()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable());
        self.reader -= data.len();
        self.storage[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Shifts the readable region left to reclaim prepend+writable space,
    /// or grows the backing storage, per the growth policy: if
    /// `writable() + prependable() >= len + CHEAP_PREPEND` the readable
    /// bytes are shifted left; otherwise storage is resized to
    /// `writer + len`.
    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len + CHEAP_PREPEND {
            self.storage.resize(self.writer + len, 0);
        } else {
            let readable = self.readable();
            self.storage.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Reads from `fd` directly into the buffer's writable tail, spilling
    /// into a 64 KiB stack buffer if the kernel has more ready than fits.
    /// Returns the number of bytes read (0 on peer EOF), or an `io::Error`
    /// (including `WouldBlock`/`Interrupted`, which callers should treat as
    /// "try again on the next readiness event").
    ///
    /// This lets the reader pull an arbitrarily large datagram in one
    /// `readv(2)` without knowing the buffer's capacity ahead of time.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_SIZE];
        let writable = self.writable();

        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.storage[self.writer..]),
                IoSliceMut::new(&mut overflow),
            ];
            let res = syscall!(readv(
                fd,
                slices.as_mut_ptr() as *mut libc::iovec,
                slices.len() as libc::c_int,
            ));
            match res {
                Ok(n) => n as usize,
                Err(e) => return Err(e),
            }
        };

        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.storage.len();
            self.append(&overflow[..n - writable]);
        }

        Ok(n)
    }

    /// Writes the entire readable region to `fd` in one `write(2)` call,
    /// without retrying on a short write — the caller (`Connection`) is
    /// responsible for tracking how much was actually written.
    pub fn write_to_fd(&self, fd: RawFd) -> io::Result<usize> {
        let slice = [IoSlice::new(self.peek())];
        let res = syscall!(writev(fd, slice.as_ptr() as *const libc::iovec, 1));
        res.map(|n| n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_has_cheap_prepend_reserved() {
        let buf = Buffer::new();
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.prependable(), CHEAP_PREPEND);
        assert_eq!(buf.writable(), INITIAL_SIZE);
    }

    #[test]
    fn append_then_retrieve_all_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn append_i32_then_peek_i32_round_trips() {
        let mut buf = Buffer::new();
        buf.append_i32(-12345);
        assert_eq!(buf.peek_i32(), -12345);
        assert_eq!(buf.readable(), 4);
    }

    #[test]
    fn invariant_holds_after_operations() {
        let mut buf = Buffer::new();
        for _ in 0..10 {
            buf.append(&[0u8; 100]);
            buf.retrieve(40);
            assert_eq!(
                buf.readable() + buf.writable() + buf.prependable(),
                buf.capacity()
            );
        }
    }

    #[test]
    fn append_larger_than_initial_writable_grows_by_resize() {
        let mut buf = Buffer::with_capacity(16);
        let payload = vec![7u8; 10_000];
        buf.append(&payload);
        assert_eq!(buf.readable(), 10_000);
        assert_eq!(buf.retrieve_all_as_vec(), payload);
    }

    #[test]
    fn retrieving_then_appending_reclaims_space_by_shifting_left() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[1u8; 20]);
        buf.retrieve(20);
        // readable()=0, writable()=12, prependable()=28: plenty of room to
        // shift left instead of resizing for a request that fits.
        let cap_before = buf.capacity();
        buf.append(&[2u8; 20]);
        assert_eq!(buf.capacity(), cap_before);
        assert_eq!(buf.readable(), 20);
    }

    #[test]
    fn prepend_writes_just_behind_the_reader() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        buf.prepend(&4i32.to_be_bytes());
        assert_eq!(buf.readable(), 8);
        assert_eq!(buf.peek_i32(), 4);
    }

    #[test]
    #[should_panic]
    fn peek_i32_panics_with_fewer_than_four_readable_bytes() {
        let mut buf = Buffer::new();
        buf.append(b"ab");
        let _ = buf.peek_i32();
    }
}
