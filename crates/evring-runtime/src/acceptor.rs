//! Acceptor - accept bursts on a listening socket
//!
//! Owns a listening [`Channel`] for a descriptor the caller created (see
//! [`tcp_listener`]). Each readiness callback accepts up to `max_per_call`
//! connections and hands every one to the new-connection handler, whose
//! [`AcceptDecision`] can end the burst early.
//!
//! `enable_listening` / `disable_listening` are what the worker token hooks
//! toggle: only the worker holding the accept token keeps its acceptors
//! registered.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use evring_core::{kdebug, kerror, kwarn, last_errno, AcceptDecision, NetError, NetResult};

use crate::channel::Channel;
use crate::config::defaults;
use crate::event_loop::EventLoop;

/// Receives each accepted descriptor; owns it from then on.
pub type NewConnection = Box<dyn FnMut(&EventLoop, RawFd) -> AcceptDecision>;

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> NetResult<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(NetError::last_os("setsockopt"));
    }
    Ok(())
}

/// Create a nonblocking IPv4 listener on `port` (0 picks a free port).
///
/// `SO_REUSEADDR` is always set; `reuse_port` adds `SO_REUSEPORT`.
pub fn tcp_listener(port: u16, backlog: i32, reuse_port: bool) -> NetResult<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(NetError::last_os("socket"));
    }

    let setup = || -> NetResult<()> {
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if reuse_port {
            set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::UNSPECIFIED).to_be();
        addr.sin_port = port.to_be();
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(NetError::last_os("bind"));
        }
        if unsafe { libc::listen(fd, backlog) } < 0 {
            return Err(NetError::last_os("listen"));
        }
        Ok(())
    };

    if let Err(e) = setup() {
        unsafe { libc::close(fd); }
        return Err(e);
    }
    Ok(fd)
}

/// Port a bound IPv4 socket ended up on.
pub fn local_port(fd: RawFd) -> NetResult<u16> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(NetError::last_os("getsockname"));
    }
    Ok(u16::from_be(addr.sin_port))
}

struct AcceptState {
    listen_fd: RawFd,
    min_per_call: usize,
    max_per_call: usize,
    on_new: RefCell<Option<NewConnection>>,
    accepted: Cell<u64>,
}

impl AcceptState {
    fn on_readable(&self, lp: &EventLoop) {
        let mut burst = 0usize;
        while burst < self.max_per_call {
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let errno = last_errno();
                if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK && errno != libc::EINTR {
                    kerror!("accept4 on fd {} failed: errno={}", self.listen_fd, errno);
                }
                break;
            }
            if let Err(e) = set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) {
                kdebug!("TCP_NODELAY on fd {}: {}", fd, e);
            }
            burst += 1;
            self.accepted.set(self.accepted.get() + 1);

            let taken = self.on_new.borrow_mut().take();
            let Some(mut handler) = taken else {
                kwarn!("no new-connection handler on fd {}, closing fd {}", self.listen_fd, fd);
                unsafe { libc::close(fd); }
                break;
            };
            let decision = handler(lp, fd);
            {
                let mut slot = self.on_new.borrow_mut();
                if slot.is_none() {
                    *slot = Some(handler);
                }
            }
            if decision.ends_burst(burst, self.min_per_call) {
                break;
            }
        }
    }
}

pub struct Acceptor {
    channel: Channel,
    state: Rc<AcceptState>,
}

impl Acceptor {
    /// Wrap `listen_fd`. `min_per_call` and `max_per_call` bound one
    /// accept burst; a zero maximum is raised to one. Listening starts
    /// disabled.
    pub fn new(lp: &EventLoop, listen_fd: RawFd, min_per_call: usize, max_per_call: usize) -> Self {
        let max_per_call = max_per_call.max(1);
        let state = Rc::new(AcceptState {
            listen_fd,
            min_per_call: min_per_call.min(max_per_call),
            max_per_call,
            on_new: RefCell::new(None),
            accepted: Cell::new(0),
        });
        let channel = Channel::new(lp, listen_fd);
        channel.mark_listening();
        let s = Rc::clone(&state);
        channel.set_read_handler(move |lp| s.on_readable(lp));
        Self { channel, state }
    }

    /// Acceptor with the default burst bounds.
    pub fn with_defaults(lp: &EventLoop, listen_fd: RawFd) -> Self {
        Self::new(
            lp,
            listen_fd,
            defaults::MIN_ACCEPTS_PER_CALL,
            defaults::MAX_ACCEPTS_PER_CALL,
        )
    }

    pub fn set_new_connection_handler<F>(&self, f: F)
    where
        F: FnMut(&EventLoop, RawFd) -> AcceptDecision + 'static,
    {
        *self.state.on_new.borrow_mut() = Some(Box::new(f));
    }

    pub fn enable_listening(&self) -> NetResult<()> {
        self.channel.enable_reading()
    }

    pub fn disable_listening(&self) -> NetResult<()> {
        self.channel.disable_reading()
    }

    pub fn is_listening(&self) -> bool {
        self.channel.is_reading()
    }

    pub fn listen_fd(&self) -> RawFd {
        self.state.listen_fd
    }

    /// Connections accepted over the acceptor's lifetime
    pub fn accepted(&self) -> u64 {
        self.state.accepted.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn connect(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).unwrap()
    }

    fn spin(lp: &EventLoop, limit: Duration, done: impl Fn() -> bool) {
        let start = Instant::now();
        while !done() && start.elapsed() < limit {
            lp.wait_and_process(10, None);
        }
    }

    #[test]
    fn test_accepts_and_sets_nodelay() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let fd = tcp_listener(0, 128, false).unwrap();
        let port = local_port(fd).unwrap();
        let acceptor = Acceptor::with_defaults(&lp, fd);
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = Rc::clone(&got);
        acceptor.set_new_connection_handler(move |_, conn| {
            let mut v: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            unsafe {
                libc::getsockopt(
                    conn,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &mut v as *mut libc::c_int as *mut libc::c_void,
                    &mut len,
                );
            }
            g.borrow_mut().push((conn, v));
            AcceptDecision::AcceptNext
        });
        acceptor.enable_listening().unwrap();
        acceptor.enable_listening().unwrap();
        assert!(acceptor.is_listening());

        let _a = connect(port);
        let _b = connect(port);
        spin(&lp, Duration::from_secs(1), || got.borrow().len() == 2);
        assert_eq!(got.borrow().len(), 2);
        assert!(got.borrow().iter().all(|(_, nodelay)| *nodelay != 0));
        assert_eq!(acceptor.accepted(), 2);

        for (conn, _) in got.borrow().iter() {
            unsafe { libc::close(*conn); }
        }
        drop(acceptor);
        unsafe { libc::close(fd); }
    }

    #[test]
    fn test_stop_ends_burst() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let fd = tcp_listener(0, 128, false).unwrap();
        let port = local_port(fd).unwrap();
        let acceptor = Acceptor::new(&lp, fd, 1, 16);
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = Rc::clone(&got);
        acceptor.set_new_connection_handler(move |_, conn| {
            g.borrow_mut().push(conn);
            AcceptDecision::Stop
        });

        let _streams: Vec<TcpStream> = (0..3).map(|_| connect(port)).collect();
        // Let the handshakes land in the backlog before listening starts.
        std::thread::sleep(Duration::from_millis(50));
        acceptor.enable_listening().unwrap();
        lp.wait_and_process(100, None);
        assert_eq!(got.borrow().len(), 1);

        spin(&lp, Duration::from_secs(1), || got.borrow().len() == 3);
        assert_eq!(got.borrow().len(), 3);
        for conn in got.borrow().iter() {
            unsafe { libc::close(*conn); }
        }
        drop(acceptor);
        unsafe { libc::close(fd); }
    }

    #[test]
    fn test_disable_listening_stops_accepting() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let fd = tcp_listener(0, 128, false).unwrap();
        let port = local_port(fd).unwrap();
        let acceptor = Acceptor::new(&lp, fd, 1, 4);
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        acceptor.set_new_connection_handler(move |_, conn| {
            c.set(c.get() + 1);
            unsafe { libc::close(conn); }
            AcceptDecision::AcceptNext
        });
        acceptor.enable_listening().unwrap();
        acceptor.disable_listening().unwrap();
        acceptor.disable_listening().unwrap();
        assert!(!acceptor.is_listening());

        let _s = connect(port);
        std::thread::sleep(Duration::from_millis(20));
        lp.wait_and_process(50, None);
        assert_eq!(count.get(), 0);

        acceptor.enable_listening().unwrap();
        spin(&lp, Duration::from_secs(1), || count.get() == 1);
        assert_eq!(count.get(), 1);
        drop(acceptor);
        unsafe { libc::close(fd); }
    }
}
