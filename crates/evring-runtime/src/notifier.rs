//! `WakeupFd` - cross-thread wakeup for an event loop.
//!
//! Writes to an eventfd to make the owning loop's epoll wait return.
//! Coalescing: multiple calls to `notify()` before the loop drains the
//! eventfd result in a single wakeup (eventfd counter semantics).
//!
//! The loop registers the descriptor as an ordinary readable channel and
//! calls `drain()` from its read handler, so the fd stays armed for the
//! next notification.

use evring_core::{ktrace, last_errno, NetError, NetResult};

use std::os::unix::io::RawFd;

pub struct WakeupFd {
    fd: RawFd,
}

impl WakeupFd {
    /// Create a new nonblocking, close-on-exec eventfd.
    pub fn new() -> NetResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::last_os("eventfd"));
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Signal the loop. Never blocks.
    pub fn notify(&self) -> NetResult<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            // EAGAIN: the counter would overflow, so a wakeup is already pending.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(NetError::Os { op: "eventfd write", errno });
        }
        Ok(())
    }

    /// Reset the counter. Returns how many notifications were coalesced.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            if errno != libc::EAGAIN && errno != libc::EINTR {
                ktrace!("eventfd {} read failed: errno={}", self.fd, errno);
            }
            return 0;
        }
        val
    }
}

impl Drop for WakeupFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let w = WakeupFd::new().unwrap();
        assert_eq!(w.drain(), 0);
        w.notify().unwrap();
        w.notify().unwrap();
        w.notify().unwrap();
        assert_eq!(w.drain(), 3);
        assert_eq!(w.drain(), 0);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let w = std::sync::Arc::new(WakeupFd::new().unwrap());
        let w2 = std::sync::Arc::clone(&w);
        std::thread::spawn(move || w2.notify().unwrap()).join().unwrap();
        assert_eq!(w.drain(), 1);
    }
}
