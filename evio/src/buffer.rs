//! Growable byte buffer with read/write cursors.

use std::io;
use std::os::unix::io::RawFd;

/// Reserved space ahead of the data, letting callers prepend a small header
/// without shifting the payload.
const PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Contiguous byte buffer.
///
/// Layout: `[prependable | readable | writable]` with
/// `read_pos <= write_pos <= storage.len()`. Bytes in
/// `[read_pos, write_pos)` are readable. Growing first compacts consumed
/// space back to the prepend region; only when that is not enough does the
/// storage actually grow.
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            storage: vec![0; PREPEND + capacity],
            read_pos: PREPEND,
            write_pos: PREPEND,
        }
    }

    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// The readable bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Consume `n` readable bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.readable());
        if n < self.readable() {
            self.read_pos += n;
        } else {
            self.clear();
        }
    }

    /// Discard everything, resetting both cursors.
    pub fn clear(&mut self) {
        self.read_pos = PREPEND;
        self.write_pos = PREPEND;
    }

    /// Take all readable bytes out.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.clear();
        out
    }

    /// Take all readable bytes as a lossy string.
    pub fn take_string(&mut self) -> String {
        String::from_utf8_lossy(&self.take()).into_owned()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Write into the prepend region, ahead of the readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds the prependable space.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable(), "prepend space exhausted");
        self.read_pos -= data.len();
        self.storage[self.read_pos..self.read_pos + data.len()].copy_from_slice(data);
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable() >= n {
            return;
        }
        if self.writable() + self.prependable() >= n + PREPEND {
            // Enough total slack: compact readable bytes back to the front.
            let len = self.readable();
            self.storage.copy_within(self.read_pos..self.write_pos, PREPEND);
            self.read_pos = PREPEND;
            self.write_pos = PREPEND + len;
        } else {
            self.storage.resize(self.write_pos + n, 0);
        }
    }

    /// Read from `fd` into the buffer with one `readv` syscall.
    ///
    /// A 64 KiB stack spillover serves as the second iovec so a large read
    /// completes in a single call even when the tail is small; spillover
    /// bytes are appended afterwards. Returns the byte count (`0` = peer
    /// closed).
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable();

        let mut iov = [
            libc::iovec {
                iov_base: self.storage[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // Skip the spillover when the tail is already large.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_append_and_retrieve() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());
        buf.append(b"hello");
        assert_eq!(buf.readable(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.advance(2);
        assert_eq!(buf.peek(), b"llo");
        assert_eq!(buf.take(), b"llo");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&[0x07, 0x00]);
        assert_eq!(buf.peek(), b"\x07\x00payload");
    }

    #[test]
    fn test_grow_compacts_first() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'a'; 16]);
        buf.advance(12);
        let before = buf.storage.len();
        // 4 readable bytes left; 10 more fit after compaction.
        buf.append(&[b'b'; 10]);
        assert_eq!(buf.storage.len(), before);
        assert_eq!(buf.readable(), 14);
        assert_eq!(&buf.peek()[..4], b"aaaa");
    }

    #[test]
    fn test_grow_resizes_when_needed() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'a'; 16]);
        buf.append(&[b'b'; 64]);
        assert_eq!(buf.readable(), 80);
    }

    #[test]
    fn test_read_fd_from_pipe() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        writer.write_all(b"reactor bytes").unwrap();

        let mut buf = Buffer::new();
        let n = buf.read_fd(reader.as_raw_fd()).unwrap();
        assert_eq!(n, 13);
        assert_eq!(buf.peek(), b"reactor bytes");
    }

    #[test]
    fn test_read_fd_spillover() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        let payload = vec![b'x'; 8192];
        writer.write_all(&payload).unwrap();

        // Tail smaller than the incoming data forces the spillover path.
        let mut buf = Buffer::with_capacity(128);
        let n = buf.read_fd(reader.as_raw_fd()).unwrap();
        assert_eq!(n, 8192);
        assert_eq!(buf.peek(), &payload[..]);
    }
}
