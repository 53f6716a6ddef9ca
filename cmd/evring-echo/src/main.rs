//! evring Echo Server
//!
//! Multi-threaded TCP echo server: a WorkerGroup passes the accept token
//! around, every worker runs its own epoll loop and closes connections that
//! stay quiet longer than the idle timeout.
//!
//! Usage:
//!     cargo build --release -p evring-echo
//!     ./target/release/evring-echo [port] [idle_ms]
//!
//! Tuning via environment:
//!     EVR_WORKERS=8 EVR_LOAD_BALANCE=smaller EVR_LOG_LEVEL=debug ./target/release/evring-echo
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use evring::{
    kdebug, kerror, kinfo, AcceptDecision, Acceptor, Channel, EventLoop, LoopConfig, NetResult,
    SignalService, TimerHandle, WorkerContext, WorkerGroup, WorkerGroupConfig,
};

const BUF_SIZE: usize = 4096;
const STATS_INTERVAL_MS: i64 = 5000;

// ── Stats shared across workers ──

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    idle_closes: AtomicU64,
    bytes: AtomicU64,
}

impl Stats {
    fn print(&self, conns: i64) {
        kinfo!(
            "conns={} accepts={} closes={} idle_closes={} bytes={}",
            conns,
            self.accepts.load(Ordering::Relaxed),
            self.closes.load(Ordering::Relaxed),
            self.idle_closes.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        );
    }
}

// ── Per-connection state ──

struct Conn {
    fd: RawFd,
    channel: Channel,
    /// Bytes read but not yet written back
    pending: RefCell<Vec<u8>>,
    idle: RefCell<Option<TimerHandle>>,
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(timer) = self.idle.borrow_mut().take() {
            timer.cancel();
        }
        let _ = self.channel.disable_all();
        unsafe { libc::close(self.fd); }
    }
}

/// Connections owned by one worker.
struct ConnTable {
    conns: RefCell<HashMap<RawFd, Rc<Conn>>>,
    active: Arc<AtomicI64>,
    stats: Arc<Stats>,
    idle_ms: i64,
    /// Idle timeout minus one wheel tick, as `add_idle_timer` applies it
    idle_restart_ms: i64,
}

impl ConnTable {
    fn close(&self, fd: RawFd) {
        if self.conns.borrow_mut().remove(&fd).is_some() {
            self.active.fetch_sub(1, Ordering::Relaxed);
            self.stats.closes.fetch_add(1, Ordering::Relaxed);
            kdebug!("fd {} closed", fd);
        }
    }

    fn touch(&self, conn: &Conn) {
        if let Some(timer) = conn.idle.borrow().as_ref() {
            timer.restart(self.idle_restart_ms, 0);
        }
    }

    fn open(self: &Rc<Self>, lp: &EventLoop, fd: RawFd) -> NetResult<()> {
        let conn = Rc::new(Conn {
            fd,
            channel: Channel::new(lp, fd),
            pending: RefCell::new(Vec::new()),
            idle: RefCell::new(None),
        });

        let table = Rc::downgrade(self);
        let weak = Rc::downgrade(&conn);
        conn.channel.set_read_handler(move |_| on_readable(&table, &weak));
        let table = Rc::downgrade(self);
        let weak = Rc::downgrade(&conn);
        conn.channel.set_write_handler(move |_| on_writable(&table, &weak));
        let table = Rc::downgrade(self);
        conn.channel.set_peer_shutdown_handler(move |_| close_fd(&table, fd));
        let table = Rc::downgrade(self);
        conn.channel.set_error_handler(move |_| close_fd(&table, fd));
        conn.channel.enable_reading()?;

        let table = Rc::downgrade(self);
        let timer = lp.add_idle_timer(self.idle_ms, move |_| {
            if let Some(t) = table.upgrade() {
                t.stats.idle_closes.fetch_add(1, Ordering::Relaxed);
                t.close(fd);
            }
        });
        *conn.idle.borrow_mut() = timer;

        self.conns.borrow_mut().insert(fd, conn);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.stats.accepts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn close_fd(table: &Weak<ConnTable>, fd: RawFd) {
    if let Some(t) = table.upgrade() {
        t.close(fd);
    }
}

/// Write as much of `pending` as the socket takes. Returns false on a
/// fatal error.
fn flush(conn: &Conn) -> bool {
    let mut pending = conn.pending.borrow_mut();
    while !pending.is_empty() {
        let n = unsafe {
            libc::send(
                conn.fd,
                pending.as_ptr() as *const libc::c_void,
                pending.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let errno = evring::last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return errno == libc::EAGAIN || errno == libc::EWOULDBLOCK;
        }
        pending.drain(..n as usize);
    }
    true
}

fn on_readable(table: &Weak<ConnTable>, conn: &Weak<Conn>) {
    let (Some(table), Some(conn)) = (table.upgrade(), conn.upgrade()) else {
        return;
    };
    let mut buf = [0u8; BUF_SIZE];
    let n = unsafe { libc::recv(conn.fd, buf.as_mut_ptr() as *mut libc::c_void, BUF_SIZE, 0) };
    if n == 0 {
        table.close(conn.fd);
        return;
    }
    if n < 0 {
        let errno = evring::last_errno();
        if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK && errno != libc::EINTR {
            table.close(conn.fd);
        }
        return;
    }

    table.stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    table.touch(&conn);
    conn.pending.borrow_mut().extend_from_slice(&buf[..n as usize]);
    if !flush(&conn) {
        table.close(conn.fd);
        return;
    }
    if !conn.pending.borrow().is_empty() {
        // Stop reading until the backlog drains.
        let _ = conn.channel.disable_reading();
        if conn.channel.enable_writing().is_err() {
            table.close(conn.fd);
        }
    }
}

fn on_writable(table: &Weak<ConnTable>, conn: &Weak<Conn>) {
    let (Some(table), Some(conn)) = (table.upgrade(), conn.upgrade()) else {
        return;
    };
    if !flush(&conn) {
        table.close(conn.fd);
        return;
    }
    if conn.pending.borrow().is_empty() {
        let _ = conn.channel.disable_writing();
        if conn.channel.enable_reading().is_err() {
            table.close(conn.fd);
        }
    }
}

// ── Worker setup ──

fn setup_worker(ctx: &mut WorkerContext, listen_fd: RawFd, idle_ms: i64, stats: &Arc<Stats>) {
    let lp = ctx.event_loop().clone();
    let idle_tick = lp.idle_wheel().map_or(0, |w| w.tick_interval());
    let active = Arc::new(AtomicI64::new(0));
    let table = Rc::new(ConnTable {
        conns: RefCell::new(HashMap::new()),
        active: Arc::clone(&active),
        stats: Arc::clone(stats),
        idle_ms,
        idle_restart_ms: (idle_ms - idle_tick).max(0),
    });

    let acceptor = Rc::new(Acceptor::with_defaults(&lp, listen_fd));
    let t = Rc::clone(&table);
    acceptor.set_new_connection_handler(move |lp, fd| {
        // A failed open has already closed `fd` with its Conn.
        if let Err(e) = t.open(lp, fd) {
            kerror!("fd {}: {}", fd, e);
        }
        AcceptDecision::SuggestStop
    });

    let metric = Arc::clone(&active);
    ctx.set_load_metric(move || metric.load(Ordering::Relaxed));

    let a = Rc::clone(&acceptor);
    ctx.set_token_acquired(move || {
        if let Err(e) = a.enable_listening() {
            kerror!("enable listening: {}", e);
        }
    });
    let a = Rc::clone(&acceptor);
    ctx.set_token_yielded(move || {
        if let Err(e) = a.disable_listening() {
            kerror!("disable listening: {}", e);
        }
    });
    kdebug!("worker {} ready", ctx.worker_id());
}

fn run() -> NetResult<()> {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let idle_ms: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(30_000);

    evring::init_logging();
    let config = WorkerGroupConfig::from_env();
    if evring::env_get_bool("EVR_PRINT_CONFIG", false) {
        config.print();
    }

    // Block signals before any worker thread exists.
    let signals = SignalService::global()?;
    signals.enable()?;

    let listen_fd = evring::tcp_listener(port, 4096, false)?;
    kinfo!(
        "evring-echo: listening on 0.0.0.0:{} ({}, {} workers, idle {}ms)",
        port,
        evring::POLLER_NAME,
        config.workers,
        idle_ms
    );

    let stats = Arc::new(Stats::default());
    let mut group = WorkerGroup::new(config)?;
    let s = Arc::clone(&stats);
    group.start(move |ctx| setup_worker(ctx, listen_fd, idle_ms, &s))?;

    // Main thread: signals and periodic stats.
    let lp = EventLoop::new(LoopConfig::new())?;
    lp.attach_signal_service(signals);
    let _int = lp.add_signal_handler(libc::SIGINT, |lp, _| lp.quit())?;
    let _term = lp.add_signal_handler(libc::SIGTERM, |lp, _| lp.quit())?;

    let workers: Vec<_> = group.workers().to_vec();
    let s = Arc::clone(&stats);
    lp.run_after(STATS_INTERVAL_MS, STATS_INTERVAL_MS, move |_| {
        let conns: i64 = workers.iter().map(|w| w.load_metric()).sum();
        s.print(conns);
    });
    lp.run();

    kinfo!("evring-echo: shutting down...");
    group.stop();
    stats.print(0);
    unsafe { libc::close(listen_fd); }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        kerror!("evring-echo: {}", e);
        std::process::exit(1);
    }
}
