use std::io;
use std::os::fd::RawFd;

const INITIAL_SIZE: usize = 1024;

/// Size of the on-stack spill area used by [`Buffer::read_fd`]. Keeps the
/// heap buffer small while still draining a bursty socket in one syscall.
const EXTRA_BUF_SIZE: usize = 64 * 1024;

/// A growable byte queue with a read cursor and a write cursor.
///
/// ```text
/// +-------------------+------------------+------------------+
/// |  retrieved bytes  |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0       <=      read_idx    <=     write_idx    <=     len
/// ```
///
/// Incoming data is appended at the write cursor, consumed from the read
/// cursor. The already-retrieved prefix is reclaimed by compaction before
/// the buffer grows.
pub struct Buffer {
    buf: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Buffer {
    /// Creates an empty buffer with the default capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates an empty buffer backed by `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            buf: vec![0; capacity],
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// Number of bytes available for reading.
    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_idx
    }

    /// A contiguous view of the readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_idx..self.write_idx]
    }

    /// Consumes `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_idx += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything, resetting both cursors.
    pub fn retrieve_all(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Consumes and returns the entire readable region.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let data = self.peek().to_vec();
        self.retrieve_all();
        data
    }

    /// Consumes the readable region and returns it as a string, replacing
    /// invalid UTF-8 sequences.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let data = self.retrieve_all_as_bytes();
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Appends `data` at the write cursor, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.read_idx + self.writable_bytes() < len {
            self.buf.resize(self.write_idx + len, 0);
        } else {
            // enough room once the retrieved prefix is reclaimed
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_idx..self.write_idx, 0);
            self.read_idx = 0;
            self.write_idx = readable;
        }
    }

    /// Reads as much as is immediately available from `fd` in a single
    /// `readv`, scattering into the heap buffer and a 64 KiB stack area.
    /// Spill from the stack area is appended afterwards, so the heap
    /// buffer only grows when the socket really delivered more than its
    /// free space.
    ///
    /// Returns the number of bytes read; zero means end of stream.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.write_idx) } as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // skip the stack area when the heap buffer alone is larger
        let iovcnt: libc::c_int = if writable < extra.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.write_idx += n;
        } else {
            self.write_idx = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, EXTRA_BUF_SIZE, INITIAL_SIZE};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC)).unwrap();
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_all(fd: &OwnedFd, mut data: &[u8]) {
        while !data.is_empty() {
            let n = syscall!(write(
                fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len()
            ))
            .unwrap() as usize;
            data = &data[n..];
        }
    }

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        assert_eq!(buf.retrieve_all_as_string(), "world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn grows_and_compacts() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'x'; 12]);
        buf.retrieve(10);
        // 2 readable, 4 writable, 10 reclaimable: compaction is enough
        buf.append(&[b'y'; 12]);
        assert_eq!(buf.readable_bytes(), 14);

        // now force a real resize
        buf.append(&[b'z'; 100]);
        assert_eq!(buf.readable_bytes(), 114);
        assert_eq!(&buf.peek()[..2], b"xx");
    }

    #[test]
    fn read_fd_spills_into_extra_area() {
        let (read_end, write_end) = pipe();
        let payload = vec![7u8; INITIAL_SIZE + 100];
        write_all(&write_end, &payload);
        drop(write_end);

        let mut buf = Buffer::new();
        let n = buf.read_fd(read_end.as_raw_fd()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        // end of stream
        assert_eq!(buf.read_fd(read_end.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn read_fd_uses_single_iovec_for_large_buffers() {
        let (read_end, write_end) = pipe();
        write_all(&write_end, b"abc");

        let mut buf = Buffer::with_capacity(EXTRA_BUF_SIZE + 1);
        let n = buf.read_fd(read_end.as_raw_fd()).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.peek(), b"abc");
    }
}
