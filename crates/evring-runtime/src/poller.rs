//! epoll multiplexer
//!
//! Owns the epoll descriptor and translates raw readiness bits into the
//! four logical classes of [`Readiness`]:
//!
//! ```text
//!   EPOLLERR, or EPOLLHUP without EPOLLIN  ──►  ERROR (nothing else)
//!   EPOLLIN + EPOLLRDHUP                   ──►  PEER_SHUTDOWN
//!   EPOLLIN                                ──►  READABLE
//!   EPOLLOUT                               ──►  WRITABLE
//! ```
//!
//! Read interest always registers `EPOLLIN | EPOLLRDHUP` so a half-closed
//! peer is visible without an extra `recv`. Each registration carries the
//! channel's token in `epoll_event.u64`; `poll()` resolves tokens back to
//! channels and splits them into listening and ordinary batches.
//!
//! The event buffer starts at [`defaults::POLLER_INITIAL_EVENTS`] entries
//! and doubles whenever a wait fills it completely.
//!
//! [`defaults::POLLER_INITIAL_EVENTS`]: crate::config::defaults::POLLER_INITIAL_EVENTS

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use evring_core::{kdebug, kerror, last_errno, Interest, NetError, NetResult, PollOp, Readiness};

use crate::channel::ChannelCore;
use crate::config::defaults;

/// Ready channels from one wait, in the order they must be dispatched.
#[derive(Default)]
pub struct ActiveChannels {
    pub listening: Vec<Rc<ChannelCore>>,
    pub ordinary: Vec<Rc<ChannelCore>>,
}

impl ActiveChannels {
    pub fn is_empty(&self) -> bool {
        self.listening.is_empty() && self.ordinary.is_empty()
    }

    pub fn clear(&mut self) {
        self.listening.clear();
        self.ordinary.clear();
    }
}

/// Translate epoll event bits into readiness classes.
pub fn translate(bits: u32) -> Readiness {
    let has = |flag: libc::c_int| bits & flag as u32 != 0;

    if has(libc::EPOLLERR) || (has(libc::EPOLLHUP) && !has(libc::EPOLLIN)) {
        return Readiness::ERROR;
    }

    let mut ready = Readiness::empty();
    if has(libc::EPOLLIN) {
        if has(libc::EPOLLRDHUP) {
            ready |= Readiness::PEER_SHUTDOWN;
        } else {
            ready |= Readiness::READABLE;
        }
    }
    if has(libc::EPOLLOUT) {
        ready |= Readiness::WRITABLE;
    }
    ready
}

/// epoll bits for an interest set.
pub fn interest_bits(interest: Interest, edge_triggered: bool) -> u32 {
    let mut bits = 0u32;
    if interest.contains(Interest::READ) {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.contains(Interest::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    if edge_triggered {
        bits |= libc::EPOLLET as u32;
    }
    bits
}

pub struct Poller {
    epfd: RawFd,
    events: RefCell<Vec<libc::epoll_event>>,
}

impl Poller {
    pub fn new() -> NetResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::last_os("epoll_create1"));
        }
        Ok(Self {
            epfd,
            events: RefCell::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                defaults::POLLER_INITIAL_EVENTS
            ]),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.epfd
    }

    fn ctl(&self, op: PollOp, fd: RawFd, token: u64, bits: u32) -> NetResult<()> {
        let raw_op = match op {
            PollOp::Add => libc::EPOLL_CTL_ADD,
            PollOp::Modify => libc::EPOLL_CTL_MOD,
            PollOp::Delete => libc::EPOLL_CTL_DEL,
        };
        let mut ev = libc::epoll_event { events: bits, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd, raw_op, fd, &mut ev) };
        if ret < 0 {
            let errno = last_errno();
            kerror!("{} fd={} token={} failed: errno={}", op.as_str(), fd, token, errno);
            return Err(NetError::Register { op, fd, errno });
        }
        Ok(())
    }

    /// Start watching `fd` for `interest`.
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest, edge_triggered: bool) -> NetResult<()> {
        self.ctl(PollOp::Add, fd, token, interest_bits(interest, edge_triggered))
    }

    /// Change the interest of an already registered `fd`.
    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest, edge_triggered: bool) -> NetResult<()> {
        self.ctl(PollOp::Modify, fd, token, interest_bits(interest, edge_triggered))
    }

    /// Stop watching `fd`.
    pub fn deregister(&self, fd: RawFd) -> NetResult<()> {
        self.ctl(PollOp::Delete, fd, 0, 0)
    }

    /// Wait up to `timeout_ms` (-1 blocks) and bucket ready channels.
    ///
    /// `resolve` maps a token back to its channel; tokens whose channel is
    /// gone are dropped. Returns the number of raw events reported.
    /// EINTR is treated as an empty wait.
    pub fn poll<F>(&self, timeout_ms: i32, mut resolve: F, active: &mut ActiveChannels) -> usize
    where
        F: FnMut(u64) -> Option<Rc<ChannelCore>>,
    {
        let mut events = self.events.borrow_mut();
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout_ms)
        };
        if n < 0 {
            let errno = last_errno();
            if errno != libc::EINTR {
                kerror!("epoll_wait on epfd {} failed: errno={}", self.epfd, errno);
            }
            return 0;
        }

        let n = n as usize;
        for ev in events.iter().take(n) {
            let bits = ev.events;
            let token = ev.u64;
            let Some(channel) = resolve(token) else {
                continue;
            };
            channel.set_readiness(translate(bits));
            if channel.is_listening() {
                active.listening.push(channel);
            } else {
                active.ordinary.push(channel);
            }
        }

        if n == events.len() {
            let grown = events.len() * 2;
            kdebug!("epoll event buffer full, growing to {}", grown);
            events.resize(grown, libc::epoll_event { events: 0, u64: 0 });
        }
        n
    }

    /// Current event buffer capacity
    pub fn capacity(&self) -> usize {
        self.events.borrow().len()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe { libc::close(self.epfd); }
            self.epfd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(flags: &[libc::c_int]) -> u32 {
        flags.iter().fold(0u32, |acc, f| acc | *f as u32)
    }

    #[test]
    fn test_translate_error_suppresses_everything() {
        let r = translate(bits(&[libc::EPOLLERR, libc::EPOLLIN, libc::EPOLLOUT]));
        assert_eq!(r, Readiness::ERROR);
        assert_eq!(translate(bits(&[libc::EPOLLHUP, libc::EPOLLOUT])), Readiness::ERROR);
    }

    #[test]
    fn test_translate_peer_shutdown_excludes_readable() {
        let r = translate(bits(&[libc::EPOLLIN, libc::EPOLLRDHUP]));
        assert_eq!(r, Readiness::PEER_SHUTDOWN);
        let r = translate(bits(&[libc::EPOLLIN, libc::EPOLLRDHUP, libc::EPOLLHUP]));
        assert_eq!(r, Readiness::PEER_SHUTDOWN);
    }

    #[test]
    fn test_translate_read_write_independent() {
        assert_eq!(translate(bits(&[libc::EPOLLIN])), Readiness::READABLE);
        assert_eq!(translate(bits(&[libc::EPOLLOUT])), Readiness::WRITABLE);
        assert_eq!(
            translate(bits(&[libc::EPOLLIN, libc::EPOLLOUT])),
            Readiness::READABLE | Readiness::WRITABLE
        );
        assert!(translate(0).is_empty());
    }

    #[test]
    fn test_interest_bits() {
        let b = interest_bits(Interest::READ, false);
        assert_eq!(b, bits(&[libc::EPOLLIN, libc::EPOLLRDHUP]));
        let b = interest_bits(Interest::ALL, true);
        assert_eq!(
            b,
            bits(&[libc::EPOLLIN, libc::EPOLLRDHUP, libc::EPOLLOUT, libc::EPOLLET])
        );
        assert_eq!(interest_bits(Interest::empty(), false), 0);
    }

    #[test]
    fn test_register_bad_fd_reports_errno() {
        let p = Poller::new().unwrap();
        let err = p.register(-1, 1, Interest::READ, false).unwrap_err();
        assert_eq!(err, NetError::Register { op: PollOp::Add, fd: -1, errno: libc::EBADF });
    }

    #[test]
    fn test_zero_timeout_returns_immediately() {
        let p = Poller::new().unwrap();
        let mut active = ActiveChannels::default();
        let n = p.poll(0, |_| None, &mut active);
        assert_eq!(n, 0);
        assert!(active.is_empty());
        assert_eq!(p.capacity(), defaults::POLLER_INITIAL_EVENTS);
    }
}
