//! Channel - one descriptor's interest, readiness and callbacks
//!
//! A channel never does I/O itself. It records what its owner wants to be
//! told about (`Interest`), what the multiplexer last reported
//! (`Readiness`), and up to four handlers: read, write, peer-shutdown and
//! error.
//!
//! # Ownership
//!
//! ```text
//!   owner ──owns──► Channel ──Rc──► ChannelCore ◄──Weak── loop registry
//!                                        ▲
//!                     dispatch batch ────┘ (Rc, only for one iteration)
//! ```
//!
//! The owning [`Channel`] is not clonable; dropping it clears its interest
//! from epoll synchronously and removes it from the loop registry. Handlers
//! that need to touch their own channel capture a [`WeakChannel`].
//!
//! All methods must be called on the loop's thread.

use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use evring_core::{ktrace, Interest, NetError, NetResult, Readiness};

use crate::event_loop::{EventLoop, LoopInner};

/// Channel callback. Receives the loop that dispatched it.
pub type Handler = Box<dyn FnMut(&EventLoop)>;

#[derive(Default)]
struct Handlers {
    read: Option<Handler>,
    write: Option<Handler>,
    peer_shutdown: Option<Handler>,
    error: Option<Handler>,
}

#[derive(Clone, Copy)]
enum Slot {
    Read,
    Write,
    PeerShutdown,
    Error,
}

impl Handlers {
    fn slot(&mut self, slot: Slot) -> &mut Option<Handler> {
        match slot {
            Slot::Read => &mut self.read,
            Slot::Write => &mut self.write,
            Slot::PeerShutdown => &mut self.peer_shutdown,
            Slot::Error => &mut self.error,
        }
    }
}

/// Shared state of a channel. Reached through [`Channel`] or an upgraded
/// [`WeakChannel`].
pub struct ChannelCore {
    token: u64,
    fd: Cell<RawFd>,
    interest: Cell<Interest>,
    readiness: Cell<Readiness>,
    edge_triggered: Cell<bool>,
    listening: Cell<bool>,
    monitoring: Cell<bool>,
    report_peer_shutdown: Cell<bool>,
    handlers: RefCell<Handlers>,
    lp: Weak<LoopInner>,
}

impl ChannelCore {
    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    /// Registry token carried in `epoll_event.u64`
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    /// Readiness observed by the last wait that reported this channel
    pub fn readiness(&self) -> Readiness {
        self.readiness.get()
    }

    pub(crate) fn set_readiness(&self, ready: Readiness) {
        self.readiness.set(ready);
    }

    pub fn is_reading(&self) -> bool {
        self.interest.get().contains(Interest::READ)
    }

    pub fn is_writing(&self) -> bool {
        self.interest.get().contains(Interest::WRITE)
    }

    /// Whether the descriptor is currently registered with epoll
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.get()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    pub fn is_edge_triggered(&self) -> bool {
        self.edge_triggered.get()
    }

    /// Dispatch this channel before ordinary ones and before the
    /// post-accept hook.
    pub fn mark_listening(&self) {
        self.listening.set(true);
    }

    /// Deliver peer shutdown as plain readability. Used by sockets that
    /// want to drain data with `recv` and see EOF themselves.
    pub fn disable_peer_shutdown(&self) {
        self.report_peer_shutdown.set(false);
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn set_handler(&self, slot: Slot, handler: Handler) {
        let old = self.handlers.borrow_mut().slot(slot).replace(handler);
        drop(old);
    }

    pub fn set_read_handler<F: FnMut(&EventLoop) + 'static>(&self, f: F) {
        self.set_handler(Slot::Read, Box::new(f));
    }

    pub fn set_write_handler<F: FnMut(&EventLoop) + 'static>(&self, f: F) {
        self.set_handler(Slot::Write, Box::new(f));
    }

    pub fn set_peer_shutdown_handler<F: FnMut(&EventLoop) + 'static>(&self, f: F) {
        self.set_handler(Slot::PeerShutdown, Box::new(f));
    }

    pub fn set_error_handler<F: FnMut(&EventLoop) + 'static>(&self, f: F) {
        self.set_handler(Slot::Error, Box::new(f));
    }

    /// Run one handler. The handler is taken out for the call so it can
    /// replace itself or any sibling handler; a replacement installed
    /// during the call wins over the original.
    fn invoke(&self, slot: Slot, lp: &EventLoop) -> bool {
        let taken = self.handlers.borrow_mut().slot(slot).take();
        let Some(mut handler) = taken else {
            return false;
        };
        handler(lp);
        let mut handlers = self.handlers.borrow_mut();
        let place = handlers.slot(slot);
        if place.is_none() {
            *place = Some(handler);
        }
        true
    }

    /// Dispatch the readiness recorded by the last wait.
    ///
    /// ERROR runs only the error handler. Otherwise exactly one of
    /// peer-shutdown or readable runs, then writable if the channel is
    /// still interested in writing at that point.
    pub(crate) fn handle_event(&self, lp: &EventLoop) {
        let ready = self.readiness.get();
        if ready.is_empty() {
            return;
        }

        if ready.contains(Readiness::ERROR) {
            self.invoke(Slot::Error, lp);
            return;
        }

        if ready.contains(Readiness::PEER_SHUTDOWN) {
            if self.report_peer_shutdown.get() {
                self.invoke(Slot::PeerShutdown, lp);
            } else {
                self.invoke(Slot::Read, lp);
            }
        } else if ready.contains(Readiness::READABLE) {
            self.invoke(Slot::Read, lp);
        }

        // A handler above may have disabled writing or cleared readiness.
        if self.readiness.get().contains(Readiness::WRITABLE) && self.is_writing() {
            self.invoke(Slot::Write, lp);
        }
    }

    // ========================================================================
    // Interest
    // ========================================================================

    fn update(&self) -> NetResult<()> {
        let lp = self.lp.upgrade().ok_or(NetError::LoopClosed)?;
        let fd = self.fd.get();
        let interest = self.interest.get();
        let edge = self.edge_triggered.get();

        if interest.is_empty() {
            if self.monitoring.get() {
                self.monitoring.set(false);
                lp.poller.deregister(fd)?;
            }
        } else if self.monitoring.get() {
            lp.poller.modify(fd, self.token, interest, edge)?;
        } else {
            lp.poller.register(fd, self.token, interest, edge)?;
            self.monitoring.set(true);
        }
        Ok(())
    }

    fn change_interest(&self, interest: Interest) -> NetResult<()> {
        let old = self.interest.get();
        if old == interest {
            return Ok(());
        }
        self.interest.set(interest);
        if let Err(e) = self.update() {
            self.interest.set(old);
            return Err(e);
        }
        // Stale readiness for anything no longer watched must not be delivered.
        let mut ready = self.readiness.get();
        ready.retain(interest.readiness_mask());
        if interest.is_empty() {
            ready = Readiness::empty();
        }
        self.readiness.set(ready);
        Ok(())
    }

    pub fn enable_reading(&self) -> NetResult<()> {
        let mut i = self.interest.get();
        i.insert(Interest::READ);
        self.change_interest(i)
    }

    pub fn enable_writing(&self) -> NetResult<()> {
        let mut i = self.interest.get();
        i.insert(Interest::WRITE);
        self.change_interest(i)
    }

    pub fn enable_all(&self) -> NetResult<()> {
        self.change_interest(Interest::ALL)
    }

    pub fn disable_reading(&self) -> NetResult<()> {
        let mut i = self.interest.get();
        i.remove(Interest::READ);
        self.change_interest(i)
    }

    pub fn disable_writing(&self) -> NetResult<()> {
        let mut i = self.interest.get();
        i.remove(Interest::WRITE);
        self.change_interest(i)
    }

    pub fn disable_all(&self) -> NetResult<()> {
        let result = self.change_interest(Interest::empty());
        self.readiness.set(Readiness::empty());
        result
    }

    /// Switch between edge- and level-triggered delivery. Takes effect
    /// immediately when the channel is registered.
    pub fn set_edge_triggered(&self, edge: bool) -> NetResult<()> {
        if self.edge_triggered.get() == edge {
            return Ok(());
        }
        self.edge_triggered.set(edge);
        if self.monitoring.get() {
            if let Err(e) = self.update() {
                self.edge_triggered.set(!edge);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Owning handle to a channel.
pub struct Channel {
    core: Rc<ChannelCore>,
}

impl Channel {
    /// Create a channel for `fd` on `lp`. Nothing is registered with epoll
    /// until an interest is enabled.
    pub fn new(lp: &EventLoop, fd: RawFd) -> Self {
        let inner = lp.inner();
        let token = inner.next_channel_token();
        let core = Rc::new(ChannelCore {
            token,
            fd: Cell::new(fd),
            interest: Cell::new(Interest::empty()),
            readiness: Cell::new(Readiness::empty()),
            edge_triggered: Cell::new(false),
            listening: Cell::new(false),
            monitoring: Cell::new(false),
            report_peer_shutdown: Cell::new(true),
            handlers: RefCell::new(Handlers::default()),
            lp: Rc::downgrade(inner),
        });
        inner.channels.borrow_mut().insert(token, Rc::downgrade(&core));
        Self { core }
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel(Rc::downgrade(&self.core))
    }

    /// Move the channel to a new descriptor. Interest is cleared; the
    /// caller re-enables what it needs.
    pub fn reset_fd(&self, fd: RawFd) -> NetResult<()> {
        let result = self.core.disable_all();
        self.core.fd.set(fd);
        result
    }
}

impl Deref for Channel {
    type Target = ChannelCore;

    fn deref(&self) -> &ChannelCore {
        &self.core
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.core.disable_all() {
            if e != NetError::LoopClosed {
                ktrace!("channel fd={} dropped with error: {}", self.core.fd(), e);
            }
        }
        if let Some(lp) = self.core.lp.upgrade() {
            lp.channels.borrow_mut().remove(&self.core.token);
        }
        // Break cycles through handlers that captured their owner.
        let handlers = std::mem::take(&mut *self.core.handlers.borrow_mut());
        drop(handlers);
    }
}

/// Non-owning reference to a channel, for use inside its own handlers.
#[derive(Clone)]
pub struct WeakChannel(Weak<ChannelCore>);

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Rc<ChannelCore>> {
        self.0.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn write_byte(fd: RawFd) {
        let b = [1u8];
        let n = unsafe { libc::write(fd, b.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd); }
    }

    #[test]
    fn test_enable_is_idempotent() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let (r, w) = pipe();
        let ch = Channel::new(&lp, r);
        assert!(!ch.is_monitoring());
        ch.enable_reading().unwrap();
        ch.enable_reading().unwrap();
        assert!(ch.is_monitoring());
        assert_eq!(ch.interest(), Interest::READ);
        ch.disable_reading().unwrap();
        assert!(!ch.is_monitoring());
        ch.disable_all().unwrap();
        drop(ch);
        close(r);
        close(w);
    }

    #[test]
    fn test_read_handler_fires() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let (r, w) = pipe();
        let hits = Rc::new(RefCell::new(0));
        let ch = Channel::new(&lp, r);
        let h = Rc::clone(&hits);
        ch.set_read_handler(move |_| *h.borrow_mut() += 1);
        ch.enable_reading().unwrap();

        write_byte(w);
        lp.wait_and_process(100, None);
        assert_eq!(*hits.borrow(), 1);
        assert!(ch.readiness().contains(Readiness::READABLE));
        drop(ch);
        close(r);
        close(w);
    }

    #[test]
    fn test_peer_shutdown_reported_on_close() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let ch = Channel::new(&lp, fds[0]);
        let s = Rc::clone(&seen);
        ch.set_read_handler(move |_| s.borrow_mut().push("read"));
        let s = Rc::clone(&seen);
        ch.set_peer_shutdown_handler(move |_| s.borrow_mut().push("shutdown"));
        ch.enable_reading().unwrap();

        close(fds[1]);
        lp.wait_and_process(100, None);
        assert_eq!(*seen.borrow(), vec!["shutdown"]);

        ch.disable_peer_shutdown();
        lp.wait_and_process(100, None);
        assert_eq!(*seen.borrow(), vec!["shutdown", "read"]);
        drop(ch);
        close(fds[0]);
    }

    #[test]
    fn test_write_skipped_after_disable_in_read_handler() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        write_byte(fds[1]);

        let writes = Rc::new(RefCell::new(0));
        let ch = Channel::new(&lp, fds[0]);
        let weak = ch.downgrade();
        ch.set_read_handler(move |_| {
            if let Some(ch) = weak.upgrade() {
                ch.disable_writing().unwrap();
            }
        });
        let w = Rc::clone(&writes);
        ch.set_write_handler(move |_| *w.borrow_mut() += 1);
        ch.enable_all().unwrap();

        lp.wait_and_process(100, None);
        assert_eq!(*writes.borrow(), 0);
        assert!(!ch.is_writing());
        assert!(!ch.readiness().contains(Readiness::WRITABLE));
        drop(ch);
        close(fds[0]);
        close(fds[1]);
    }

    #[test]
    fn test_handler_can_replace_itself() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let (r, w) = pipe();
        let log = Rc::new(RefCell::new(Vec::new()));
        let ch = Channel::new(&lp, r);
        let weak = ch.downgrade();
        let l = Rc::clone(&log);
        ch.set_read_handler(move |_| {
            l.borrow_mut().push(1);
            let l2 = Rc::clone(&l);
            if let Some(ch) = weak.upgrade() {
                ch.set_read_handler(move |_| l2.borrow_mut().push(2));
            }
        });
        ch.enable_reading().unwrap();
        write_byte(w);
        lp.wait_and_process(100, None);
        lp.wait_and_process(100, None);
        assert_eq!(*log.borrow(), vec![1, 2]);
        drop(ch);
        close(r);
        close(w);
    }

    #[test]
    fn test_drop_deregisters() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let (r, w) = pipe();
        let base = lp.channel_count();
        let ch = Channel::new(&lp, r);
        ch.enable_reading().unwrap();
        assert_eq!(lp.channel_count(), base + 1);
        drop(ch);
        assert_eq!(lp.channel_count(), base);

        // fd is no longer in the epoll set: adding it again must succeed.
        let ch = Channel::new(&lp, r);
        ch.enable_reading().unwrap();
        drop(ch);
        close(r);
        close(w);
    }

    #[test]
    fn test_register_failure_keeps_state() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let ch = Channel::new(&lp, -1);
        assert!(ch.enable_reading().is_err());
        assert!(ch.interest().is_empty());
        assert!(!ch.is_monitoring());
    }
}
