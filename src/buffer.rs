//! Byte buffer backing connection I/O.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0        <=     reader_index    <=  writer_index   <=   size
//! ```
//!
//! The prependable region lets protocol code stamp a length header in front
//! of already-serialized payload without shifting it.

use std::io;
use std::os::fd::RawFd;

/// Bytes reserved in front of the readable region for cheap prepending.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack spill region used by [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 64 * 1024;

pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_initial_size(INITIAL_SIZE)
    }

    pub fn with_initial_size(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consume `len` readable bytes. Consuming everything (or more) resets
    /// both indices to the prepend mark.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Lossy UTF-8 convenience over [`Buffer::retrieve_as_bytes`].
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough slack in front: slide the readable bytes back down to
            // the prepend mark instead of growing.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Read from `fd` into the writable tail with a 64 KiB stack spill as the
    /// second scatter segment, so one syscall can absorb bursts larger than
    /// the current buffer. Spilled bytes are appended afterwards.
    ///
    /// `Ok(0)` means the peer closed the connection.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) as *mut libc::c_void },
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`. Does not consume; the caller
    /// retrieves whatever the kernel actually took.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.buf.as_ptr().add(self.reader_index) as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn check_invariants(buf: &Buffer) {
        assert!(buf.reader_index <= buf.writer_index);
        assert!(buf.writer_index <= buf.buf.len());
        assert!(buf.buf.len() >= CHEAP_PREPEND);
        assert_eq!(buf.readable_bytes(), buf.writer_index - buf.reader_index);
    }

    #[test]
    fn fresh_buffer_layout() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_invariants(&buf);
    }

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        buf.append(&data);
        check_invariants(&buf);
        assert_eq!(buf.readable_bytes(), data.len());
        assert_eq!(buf.retrieve_all_as_bytes(), data);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn partial_retrieve_advances_reader() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.retrieve_as_string(5), "hello");
        assert_eq!(buf.readable_bytes(), 6);
        assert_eq!(buf.retrieve_all_as_string(), " world");
        check_invariants(&buf);
    }

    #[test]
    fn retrieve_all_is_idempotent() {
        let mut buf = Buffer::new();
        buf.append(b"data");
        buf.retrieve_all();
        let (r, w) = (buf.reader_index, buf.writer_index);
        buf.retrieve_all();
        assert_eq!((buf.reader_index, buf.writer_index), (r, w));
    }

    #[test]
    fn make_space_reclaims_prepend_slack() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; INITIAL_SIZE]);
        buf.retrieve(900);
        let capacity_before = buf.buf.len();
        // 900 reclaimable in front plus 0 writable is enough for 800.
        buf.append(&vec![b'y'; 800]);
        assert_eq!(buf.buf.len(), capacity_before);
        assert_eq!(buf.reader_index, CHEAP_PREPEND);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE - 900 + 800);
        check_invariants(&buf);
    }

    #[test]
    fn make_space_grows_when_slack_insufficient() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; INITIAL_SIZE]);
        let capacity_before = buf.buf.len();
        buf.append(&vec![b'y'; 4096]);
        assert!(buf.buf.len() > capacity_before);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE + 4096);
        check_invariants(&buf);
    }

    #[test]
    fn read_fd_spills_into_stack_buffer() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        tx.write_all(&payload).unwrap();

        let mut buf = Buffer::new();
        let mut got = Vec::new();
        while got.len() < payload.len() {
            let n = buf.read_fd(rx.as_raw_fd()).unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf.retrieve_all_as_bytes());
        }
        assert_eq!(got, payload);
    }

    #[test]
    fn read_fd_reports_peer_close() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let mut buf = Buffer::new();
        assert_eq!(buf.read_fd(rx.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn write_fd_then_retrieve() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let mut buf = Buffer::new();
        buf.append(b"pipelined");
        let n = buf.write_fd(tx.as_raw_fd()).unwrap();
        buf.retrieve(n);
        assert_eq!(n, 9);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 16];
        use std::io::Read;
        let m = rx.read(&mut out).unwrap();
        assert_eq!(&out[..m], b"pipelined");
    }
}
