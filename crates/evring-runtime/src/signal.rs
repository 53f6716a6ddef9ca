//! Signal delivery to event loops
//!
//! ```text
//!   kernel ──sigaction handler──► socketpair ──► signal thread (own loop)
//!                                                     │ signal_raised(sig)
//!                         ┌───────────────────────────┼──────────────┐
//!                         ▼                           ▼              ▼
//!                    LoopHandle A                LoopHandle B      ...
//!                         │ wakeup_and_run
//!                         ▼
//!              SignalHandlers of loop A (registration order)
//! ```
//!
//! [`SignalService`] is process-wide state: it owns the socketpair, the
//! saved dispositions and the listener table. `enable()` blocks every
//! signal in the calling thread (threads spawned afterwards inherit the
//! mask) and starts the listener thread, which is the only thread left
//! with signals unblocked.
//!
//! The async-signal-safe part is a single `write(2)` of the signal number
//! to the descriptor published in [`NOTIFY_FD`]; only one service can own
//! it at a time, so processes normally use [`SignalService::global`].
//!
//! Only the standard signals known to `nix::sys::signal::Signal` are
//! accepted; `SIGKILL` and `SIGSTOP` never are.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock, PoisonError};
use std::thread;

use evring_core::{kdebug, kerror, kinfo, ktrace, last_errno, NetError, NetResult};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::channel::Channel;
use crate::config::LoopConfig;
use crate::event_loop::{EventLoop, LoopHandle, LoopInner};

/// Write end of the active service's socketpair; -1 when none.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

static GLOBAL: OnceLock<SignalService> = OnceLock::new();

/// Per-loop signal callback. Receives the loop and the signal number.
pub type SignalCallback = Box<dyn FnMut(&EventLoop, i32)>;

extern "C" fn on_signal(sig: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();
    let byte = sig as u8;
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
    Errno::set_raw(saved);
}

/// Check that `sig` can carry a handler.
pub fn check_signal(sig: i32) -> NetResult<Signal> {
    if sig == libc::SIGKILL || sig == libc::SIGSTOP {
        return Err(NetError::InvalidSignal(sig));
    }
    Signal::try_from(sig).map_err(|_| NetError::InvalidSignal(sig))
}

/// Symbolic name such as `"SIGINT"`, or `"UNKNOWN"`.
pub fn signal_name(sig: i32) -> &'static str {
    Signal::try_from(sig).map(|s| s.as_str()).unwrap_or("UNKNOWN")
}

fn set_thread_mask(how: SigmaskHow) {
    if let Err(e) = signal::pthread_sigmask(how, Some(&SigSet::all()), None) {
        kerror!("pthread_sigmask failed: {}", e);
    }
}

// ============================================================================
// Process-wide service
// ============================================================================

struct ListenerTable {
    listeners: BTreeMap<i32, Vec<LoopHandle>>,
    saved: HashMap<i32, SigAction>,
}

struct ServiceInner {
    read_fd: RawFd,
    write_fd: RawFd,
    table: Mutex<ListenerTable>,
    enabled: AtomicBool,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        let _ = NOTIFY_FD.compare_exchange(self.write_fd, -1, Ordering::AcqRel, Ordering::Relaxed);
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Fans caught signals out to the loops that asked for them.
#[derive(Clone)]
pub struct SignalService {
    inner: Arc<ServiceInner>,
}

impl SignalService {
    /// Create a service with its own socketpair. Nothing is installed
    /// until the first listener registers.
    pub fn new() -> NetResult<Self> {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret != 0 {
            return Err(NetError::last_os("socketpair"));
        }
        Ok(Self {
            inner: Arc::new(ServiceInner {
                read_fd: fds[0],
                write_fd: fds[1],
                table: Mutex::new(ListenerTable { listeners: BTreeMap::new(), saved: HashMap::new() }),
                enabled: AtomicBool::new(false),
            }),
        })
    }

    /// The process-wide service, created on first use.
    pub fn global() -> NetResult<SignalService> {
        if let Some(service) = GLOBAL.get() {
            return Ok(service.clone());
        }
        let service = SignalService::new()?;
        Ok(GLOBAL.get_or_init(|| service).clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Block all signals in the calling thread and start the listener
    /// thread. Call from the main thread before spawning workers.
    pub fn enable(&self) -> NetResult<()> {
        if self.inner.enabled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        set_thread_mask(SigmaskHow::SIG_BLOCK);

        let (tx, rx) = mpsc::channel::<NetResult<()>>();
        let service = self.clone();
        let spawned = thread::Builder::new()
            .name("evring-signal".to_string())
            .spawn(move || service.listen(tx));
        if let Err(e) = spawned {
            self.inner.enabled.store(false, Ordering::Release);
            return Err(NetError::from(e));
        }
        rx.recv().unwrap_or(Err(NetError::LoopClosed))?;
        kinfo!("signal handling enabled");
        Ok(())
    }

    fn listen(self, ready: mpsc::Sender<NetResult<()>>) {
        set_thread_mask(SigmaskHow::SIG_UNBLOCK);

        let lp = match EventLoop::new(LoopConfig::new()) {
            Ok(lp) => lp,
            Err(e) => {
                kerror!("signal thread: cannot create event loop: {}", e);
                let _ = ready.send(Err(e));
                return;
            }
        };
        let channel = Channel::new(&lp, self.inner.read_fd);
        let service = self.clone();
        channel.set_read_handler(move |_| service.on_readable());
        if let Err(e) = channel.enable_reading() {
            let _ = ready.send(Err(e));
            return;
        }
        let _ = ready.send(Ok(()));
        lp.run();
    }

    fn on_readable(&self) {
        let mut caught = [0u32; 256];
        let mut buf = [0u8; 1024];
        loop {
            let n = unsafe {
                libc::recv(self.inner.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                if errno != libc::EAGAIN {
                    kerror!("signal socket recv failed: errno={}", errno);
                }
                break;
            }
            if n == 0 {
                break;
            }
            for &sig in &buf[..n as usize] {
                ktrace!("signal {} {} caught", sig, signal_name(i32::from(sig)));
                caught[sig as usize] += 1;
            }
        }

        for (sig, &count) in caught.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let sig = sig as i32;
            let targets = self.listeners_of(sig);
            for _ in 0..count {
                for handle in &targets {
                    handle.signal_raised(sig);
                }
            }
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, ListenerTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners_of(&self, sig: i32) -> Vec<LoopHandle> {
        self.table().listeners.get(&sig).cloned().unwrap_or_default()
    }

    /// Number of loops listening for `sig`.
    pub fn listener_count(&self, sig: i32) -> usize {
        self.table().listeners.get(&sig).map_or(0, Vec::len)
    }

    /// Route `sig` to `handle`. The first listener for a signal installs
    /// the process-level disposition.
    pub fn register_listener(&self, sig: i32, handle: &LoopHandle) -> NetResult<()> {
        let signal = check_signal(sig)?;
        let mut table = self.table();
        if let Some(list) = table.listeners.get_mut(&sig) {
            if !list.iter().any(|h| h.same_loop(handle)) {
                list.push(handle.clone());
            }
            return Ok(());
        }

        NOTIFY_FD.store(self.inner.write_fd, Ordering::Release);
        let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::all());
        let old = unsafe { signal::sigaction(signal, &action) }.map_err(|e| {
            kerror!("sigaction({}) failed: {}", signal.as_str(), e);
            NetError::Os { op: "sigaction", errno: e as i32 }
        })?;
        table.saved.insert(sig, old);
        table.listeners.insert(sig, vec![handle.clone()]);
        kdebug!("handler installed for {}", signal.as_str());
        Ok(())
    }

    /// Stop routing `sig` to `handle`. The last listener to leave restores
    /// the disposition that was in place before.
    pub fn unregister_listener(&self, sig: i32, handle: &LoopHandle) {
        let mut table = self.table();
        let Some(list) = table.listeners.get_mut(&sig) else {
            return;
        };
        list.retain(|h| !h.same_loop(handle));
        if !list.is_empty() {
            return;
        }
        table.listeners.remove(&sig);
        if let (Some(old), Ok(signal)) = (table.saved.remove(&sig), Signal::try_from(sig)) {
            if let Err(e) = unsafe { signal::sigaction(signal, &old) } {
                kerror!("restoring {} failed: {}", signal.as_str(), e);
            }
            kdebug!("handler restored for {}", signal.as_str());
        }
    }
}

// ============================================================================
// Per-loop registry
// ============================================================================

#[derive(Default)]
pub(crate) struct SignalHandlers {
    next_id: u64,
    map: BTreeMap<i32, Vec<(u64, Option<SignalCallback>)>>,
}

impl SignalHandlers {
    fn insert(&mut self, sig: i32, callback: SignalCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.map.entry(sig).or_default().push((id, Some(callback)));
        id
    }

    /// Take out one handler. Returns its callback, unless it is running,
    /// and whether `sig` has no handlers left.
    fn remove(&mut self, sig: i32, id: u64) -> Option<(Option<SignalCallback>, bool)> {
        let list = self.map.get_mut(&sig)?;
        let pos = list.iter().position(|(i, _)| *i == id)?;
        let (_, callback) = list.remove(pos);
        let emptied = list.is_empty();
        if emptied {
            self.map.remove(&sig);
        }
        Some((callback, emptied))
    }

    fn ids(&self, sig: i32) -> Vec<u64> {
        self.map
            .get(&sig)
            .map(|l| l.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    fn slot(&mut self, sig: i32, id: u64) -> Option<&mut Option<SignalCallback>> {
        self.map.get_mut(&sig)?.iter_mut().find(|(i, _)| *i == id).map(|(_, cb)| cb)
    }
}

/// Registration of one callback for one signal on one loop. Dropping it
/// removes the callback.
#[must_use = "dropping a SignalHandler removes its callback"]
pub struct SignalHandler {
    lp: Weak<LoopInner>,
    sig: i32,
    id: u64,
}

impl SignalHandler {
    pub fn signal(&self) -> i32 {
        self.sig
    }

    /// Remove the callback. Safe from inside the callback itself, and a
    /// no-op once done.
    pub fn close(&self) {
        if let Some(lp) = self.lp.upgrade() {
            lp.remove_signal_handler(self.sig, self.id);
        }
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.close();
    }
}

impl LoopInner {
    fn remove_signal_handler(&self, sig: i32, id: u64) {
        let removed = self.signals.borrow_mut().remove(sig, id);
        let Some((callback, emptied)) = removed else {
            return;
        };
        if emptied {
            if let Some(service) = self.signal_service.borrow().as_ref() {
                service.unregister_listener(sig, self.handle_ref());
            }
        }
        // Its captures may close other handlers.
        drop(callback);
    }

    /// Leave every listener list this loop joined.
    pub(crate) fn release_signals(&self) {
        let sigs: Vec<i32> = self.signals.borrow().map.keys().copied().collect();
        if sigs.is_empty() {
            return;
        }
        if let Some(service) = self.signal_service.borrow().as_ref() {
            for sig in sigs {
                service.unregister_listener(sig, self.handle_ref());
            }
        }
    }
}

impl EventLoop {
    /// Route signals caught by `service` to this loop. Handlers added
    /// before the call are not re-registered with the new service.
    pub fn attach_signal_service(&self, service: SignalService) {
        *self.inner().signal_service.borrow_mut() = Some(service);
    }

    /// Run `f` on this loop's thread whenever `sig` is caught. Handlers of
    /// the same signal run in registration order.
    pub fn add_signal_handler<F>(&self, sig: i32, f: F) -> NetResult<SignalHandler>
    where
        F: FnMut(&EventLoop, i32) + 'static,
    {
        check_signal(sig)?;
        let inner = self.inner();
        let service = inner
            .signal_service
            .borrow()
            .clone()
            .ok_or(NetError::NoSignalService)?;

        let first = !inner.signals.borrow().map.contains_key(&sig);
        if first {
            service.register_listener(sig, &self.handle())?;
        }
        let id = inner.signals.borrow_mut().insert(sig, Box::new(f));
        ktrace!("signal handler {} added for {}", id, signal_name(sig));
        Ok(SignalHandler { lp: Rc::downgrade(inner), sig, id })
    }

    /// Number of handlers installed for `sig` on this loop.
    pub fn signal_handler_count(&self, sig: i32) -> usize {
        self.inner().signals.borrow().map.get(&sig).map_or(0, Vec::len)
    }

    pub(crate) fn dispatch_signal(&self, sig: i32) {
        let signals = &self.inner().signals;
        let ids = signals.borrow().ids(sig);
        for id in ids {
            let taken = signals.borrow_mut().slot(sig, id).and_then(Option::take);
            let Some(mut callback) = taken else {
                continue;
            };
            callback(self, sig);
            let mut registry = signals.borrow_mut();
            if let Some(slot) = registry.slot(sig, id) {
                *slot = Some(callback);
            }
        }
    }
}
