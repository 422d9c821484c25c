//! Growable byte buffer with a cheap prepend region.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0            read_pos         write_pos          storage.len()
//! ```
//!
//! Retrieving from the front only moves `read_pos`; appending writes at
//! `write_pos` and grows or compacts the storage as needed. The prepend
//! region lets a protocol layer stamp a length header in front of an
//! already-encoded payload without copying it.

use std::io;
use std::os::fd::RawFd;

use crate::sys;

/// Bytes reserved in front of the payload for prepending headers.
pub const CHEAP_PREPEND: usize = 8;

/// Initial payload capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Stack-resident overflow area used by [`Buffer::read_fd`] so a single
/// `readv` can pull in up to 64 KiB beyond the buffer's spare capacity.
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial],
            read_pos: CHEAP_PREPEND,
            write_pos: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Total allocated capacity, including the prepend region.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// View of the readable bytes.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Offset of the first `\r\n` within the readable bytes.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first `\n` within the readable bytes.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Discard `n` readable bytes from the front.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_pos += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Discard readable bytes up to (not including) offset `end`.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = CHEAP_PREPEND;
        self.write_pos = CHEAP_PREPEND;
    }

    /// Copy out and discard the first `n` readable bytes.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        debug_assert!(n <= self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    /// Copy out and discard all readable bytes.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Copy out all readable bytes as a string, replacing invalid UTF-8.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_bytes()).into_owned()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Write into the prepend region, immediately in front of the payload.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than the current prependable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_pos -= data.len();
        self.storage[self.read_pos..self.read_pos + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
        debug_assert!(self.writable_bytes() >= n);
    }

    /// Shrink the storage to the readable payload plus `reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut other = Buffer::with_capacity(readable + reserve);
        other.append(self.peek());
        *self = other;
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.storage.resize(self.write_pos + n, 0);
        } else {
            // Enough room overall: compact by sliding the payload forward.
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_pos..self.write_pos, CHEAP_PREPEND);
            self.read_pos = CHEAP_PREPEND;
            self.write_pos = CHEAP_PREPEND + readable;
        }
    }

    // Network-byte-order integer helpers.

    pub fn append_u8(&mut self, v: u8) {
        self.append(&[v]);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.append(&v.to_be_bytes());
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.peek().first().copied()
    }

    pub fn peek_u16(&self) -> Option<u16> {
        let b = self.peek().get(..2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn peek_u32(&self) -> Option<u32> {
        let b = self.peek().get(..4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn peek_u64(&self) -> Option<u64> {
        let b = self.peek().get(..8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Some(u64::from_be_bytes(raw))
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let v = self.peek_u8()?;
        self.retrieve(1);
        Some(v)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let v = self.peek_u16()?;
        self.retrieve(2);
        Some(v)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let v = self.peek_u32()?;
        self.retrieve(4);
        Some(v)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let v = self.peek_u64()?;
        self.retrieve(8);
        Some(v)
    }

    pub fn prepend_u8(&mut self, v: u8) {
        self.prepend(&[v]);
    }

    pub fn prepend_u16(&mut self, v: u16) {
        self.prepend(&v.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, v: u32) {
        self.prepend(&v.to_be_bytes());
    }

    /// Read from `fd` with a single scatter syscall: first into the spare
    /// capacity, overflowing into a 64 KiB stack buffer that is appended
    /// afterwards. Keeps the steady-state allocation small while still
    /// draining large bursts in one `readv`.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let spare = &mut self.storage[self.write_pos..];
            sys::readv2(fd, spare, &mut extra)?
        };
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 6);

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows_beyond_initial_size() {
        let mut buf = Buffer::new();
        let big = vec![b'x'; INITIAL_SIZE * 3];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE * 3);
        assert_eq!(buf.peek(), &big[..]);
    }

    #[test]
    fn compacts_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700);
        // 100 readable; 224 writable; plenty of reclaimable front space.
        let before = buf.capacity();
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.capacity(), before);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(&buf.peek()[..100], &[b'a'; 100][..]);
    }

    #[test]
    fn prepend_uses_reserved_region() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_u32(7);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_u32(), Some(7));
        assert_eq!(buf.peek(), b"payload");
    }

    #[test]
    fn integer_helpers_are_big_endian() {
        let mut buf = Buffer::new();
        buf.append_u16(0x0102);
        buf.append_u32(0x03040506);
        buf.append_u64(0x0708090a0b0c0d0e);
        assert_eq!(
            buf.peek(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e]
        );
        assert_eq!(buf.read_u16(), Some(0x0102));
        assert_eq!(buf.read_u32(), Some(0x03040506));
        assert_eq!(buf.read_u64(), Some(0x0708090a0b0c0d0e));
        assert_eq!(buf.read_u8(), None);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_eol(), Some(15));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
    }

    #[test]
    fn shrink_reclaims_storage() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 8192]);
        buf.retrieve(8000);
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 192);
        assert!(buf.capacity() < 8192);
    }

    #[test]
    fn read_fd_small_payload() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        assert_eq!(
            unsafe { libc::write(wr, b"ping".as_ptr() as *const _, 4) },
            4
        );

        let mut buf = Buffer::new();
        let n = buf.read_fd(rd).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.peek(), b"ping");

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn read_fd_overflows_into_extra_buffer() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        // More than the initial writable space in one burst.
        let payload = vec![b'z'; INITIAL_SIZE + 4000];
        let mut written = 0;
        while written < payload.len() {
            let n = unsafe {
                libc::write(
                    wr,
                    payload[written..].as_ptr() as *const _,
                    payload.len() - written,
                )
            };
            assert!(n > 0);
            written += n as usize;
        }

        let mut buf = Buffer::new();
        let mut total = 0;
        while total < payload.len() {
            total += buf.read_fd(rd).unwrap();
        }
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn read_fd_sees_eof() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        unsafe { libc::close(wr) };

        let mut buf = Buffer::new();
        assert_eq!(buf.read_fd(rd).unwrap(), 0);
        unsafe { libc::close(rd) };
    }
}
