//! `Ticker` - periodic timerfd driving the loop's time resolution.
//!
//! When a loop is configured with a time resolution, it stops reading the
//! wall clock after every wait and refreshes its cached `now` only when this
//! timerfd expires. The timerfd is registered as an ordinary readable
//! channel; each expiry also wakes a loop that would otherwise block
//! forever, which is what gives timers their `< requested + resolution`
//! bound.

use evring_core::{last_errno, ktrace, NetError, NetResult};

use std::os::unix::io::RawFd;

pub struct Ticker {
    fd: RawFd,
    interval_ms: i64,
}

impl Ticker {
    /// Create a monotonic timerfd that fires every `interval_ms`.
    pub fn new(interval_ms: i64) -> NetResult<Self> {
        if interval_ms <= 0 {
            return Err(NetError::InvalidArgument("ticker interval must be > 0"));
        }
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(NetError::last_os("timerfd_create"));
        }
        let ticker = Self { fd, interval_ms };
        ticker.arm()?;
        Ok(ticker)
    }

    fn arm(&self) -> NetResult<()> {
        let period = libc::timespec {
            tv_sec: (self.interval_ms / 1000) as libc::time_t,
            tv_nsec: ((self.interval_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let spec = libc::itimerspec { it_interval: period, it_value: period };
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(NetError::last_os("timerfd_settime"));
        }
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Consume pending expirations. Returns how many ticks elapsed.
    pub fn drain(&self) -> u64 {
        let mut expirations: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = last_errno();
            if errno != libc::EAGAIN && errno != libc::EINTR {
                ktrace!("timerfd {} read failed: errno={}", self.fd, errno);
            }
            return 0;
        }
        expirations
    }
}

impl Drop for Ticker {
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
    use std::time::Duration;

    #[test]
    fn test_rejects_zero_interval() {
        assert!(Ticker::new(0).is_err());
    }

    #[test]
    fn test_ticks_accumulate() {
        let t = Ticker::new(10).unwrap();
        assert_eq!(t.drain(), 0);
        std::thread::sleep(Duration::from_millis(55));
        let n = t.drain();
        assert!(n >= 3 && n <= 6, "expirations = {}", n);
    }
}
