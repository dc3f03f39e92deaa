use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Outcome of one bounded wait for a ring block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket signalled input or an error condition.
    Ready,
    /// Nothing happened within the interval.
    TimedOut,
    /// A signal arrived before either of the above.
    Interrupted,
}

/// Something the acquisition loop can block on between ownership checks.
pub trait Wait {
    fn wait(&mut self, timeout: Duration) -> io::Result<Readiness>;
}

/// `poll(2)` on the capture socket for `POLLIN | POLLERR`.
#[derive(Debug)]
pub struct PollWaiter {
    fd: RawFd,
}

impl PollWaiter {
    /// The caller keeps `fd` open for as long as the waiter is used.
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
    // Round up so a sub-millisecond interval still sleeps.
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

impl Wait for PollWaiter {
    fn wait(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms(timeout)) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                log::trace!("poll interrupted by a signal");
                return Ok(Readiness::Interrupted);
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(Readiness::Ready)
    }
}
