use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

/// Wakeup descriptor backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are converted (native endian) into a 64 bit
/// unsigned integer and added to the count. Reads must also be 8 bytes
/// and reset the count to 0, returning the count.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Bumps the counter, making the descriptor readable and breaking a
    /// blocked poll.
    pub(crate) fn wake(&self) {
        if let Err(err) = self.add(1) {
            if err.kind() == io::ErrorKind::WouldBlock {
                // Writing only blocks if the counter is about to
                // overflow; drain it and signal again.
                self.drain();
                if let Err(err) = self.add(1) {
                    error!("eventfd wake failed: {}", err);
                }
            } else {
                error!("eventfd wake failed: {}", err);
            }
        }
    }

    /// Resets the counter to zero, returning the previous total.
    pub(crate) fn drain(&self) -> u64 {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(8) => u64::from_ne_bytes(buf),
            // not woken yet
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Ok(n) => {
                error!("eventfd read returned {} bytes instead of 8", n);
                0
            }
            Err(err) => {
                error!("eventfd read failed: {}", err);
                0
            }
        }
    }

    fn add(&self, n: u64) -> io::Result<()> {
        let buf: [u8; 8] = n.to_ne_bytes();
        syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::Waker;

    #[test]
    fn wake_and_drain() {
        let waker = Waker::new().unwrap();
        assert_eq!(waker.drain(), 0);

        waker.wake();
        waker.wake();
        waker.wake();
        assert_eq!(waker.drain(), 3);
        assert_eq!(waker.drain(), 0);
    }
}
