//! WorkerGroup - N worker threads wired into one accept-token ring
//!
//! # Example
//!
//! ```rust,ignore
//! use evring_runtime::{Acceptor, WorkerGroup, WorkerGroupConfig};
//!
//! let listen_fd = evring_runtime::tcp_listener(8080, 1024, false)?;
//! let mut group = WorkerGroup::new(WorkerGroupConfig::from_env())?;
//! group.start(move |ctx| {
//!     let acceptor = Rc::new(Acceptor::with_defaults(ctx.event_loop(), listen_fd));
//!     let a = Rc::clone(&acceptor);
//!     ctx.set_token_acquired(move || { let _ = a.enable_listening(); });
//!     let a = Rc::clone(&acceptor);
//!     ctx.set_token_yielded(move || { let _ = a.disable_listening(); });
//! })?;
//! // ...
//! group.stop();
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use evring_core::{kerror, kinfo, NetError, NetResult, TokenLock};

use crate::config::{defaults, WorkerGroupConfig};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::worker::{set_current_worker_id, Worker, WorkerContext, WorkerRef, WorkerShared};

pub struct WorkerGroup {
    config: WorkerGroupConfig,
    ring: Vec<Arc<WorkerShared>>,
    refs: Vec<WorkerRef>,
    lock: Arc<TokenLock>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Validate `config` and create the workers' loop handles. No thread
    /// runs until [`start`](Self::start).
    pub fn new(config: WorkerGroupConfig) -> NetResult<Self> {
        config.validate().map_err(|e| match e {
            crate::config::ConfigError::InvalidValue(msg) => NetError::InvalidArgument(msg),
        })?;
        let mut ring = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            ring.push(Arc::new(WorkerShared::new(id, LoopHandle::new()?)));
        }
        let refs = ring.iter().cloned().map(WorkerRef::new).collect();
        Ok(Self {
            config,
            ring,
            refs,
            lock: Arc::new(TokenLock::new()),
            handles: Vec::new(),
        })
    }

    /// Spawn one thread per worker. `setup` runs on each worker thread with
    /// its fresh loop, before the worker starts looping.
    pub fn start<F>(&mut self, setup: F) -> NetResult<()>
    where
        F: Fn(&mut WorkerContext) + Send + Sync + 'static,
    {
        if !self.handles.is_empty() {
            return Err(NetError::InvalidArgument("worker group already started"));
        }
        kinfo!(
            "starting {} workers, strategy={}",
            self.config.workers,
            self.config.strategy
        );

        let setup = Arc::new(setup);
        for id in 0..self.ring.len() {
            let ring = self.ring.clone();
            let lock = Arc::clone(&self.lock);
            let setup = Arc::clone(&setup);
            let loop_config = self.config.loop_config.clone();
            let strategy = self.config.strategy;
            let retry = self.config.lock_retry_delay_ms;

            let spawned = thread::Builder::new()
                .name(format!("evring-worker-{}", id))
                .spawn(move || {
                    set_current_worker_id(id);
                    let shared = Arc::clone(&ring[id]);
                    let lp = match EventLoop::with_handle(loop_config, shared.handle().clone()) {
                        Ok(lp) => lp,
                        Err(e) => {
                            kerror!("worker {}: cannot create event loop: {}", id, e);
                            std::process::exit(1);
                        }
                    };
                    let mut ctx = WorkerContext::new(lp, shared, ring.len());
                    setup(&mut ctx);
                    let mut worker = Worker::new(ctx, &ring, strategy, lock, retry);
                    worker.run();
                });
            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    kerror!("failed to spawn worker {}: {}", id, e);
                    self.stop();
                    return Err(NetError::from(e));
                }
            }
        }
        Ok(())
    }

    /// Request every worker to stop, wait until all have left their loops,
    /// then join the threads.
    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for w in &self.refs {
            w.request_stop();
        }
        let poll = Duration::from_millis(defaults::STOP_POLL_INTERVAL_MS);
        loop {
            let running = self
                .refs
                .iter()
                .zip(&self.handles)
                .any(|(w, h)| !w.has_stopped() && !h.is_finished());
            if !running {
                break;
            }
            thread::sleep(poll);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                kerror!("worker thread panicked");
            }
        }
        kinfo!("all workers stopped");
    }

    pub fn workers(&self) -> &[WorkerRef] {
        &self.refs
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn config(&self) -> &WorkerGroupConfig {
        &self.config
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::{local_port, tcp_listener, Acceptor};
    use evring_core::{AcceptDecision, LoadBalanceStrategy};
    use std::net::TcpStream;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Ev {
        Acquired(usize),
        Yielded(usize),
    }

    struct Harness {
        group: WorkerGroup,
        listen_fd: i32,
        port: u16,
        events: Arc<Mutex<Vec<Ev>>>,
        accepted: Arc<Vec<AtomicI64>>,
    }

    impl Harness {
        fn start(workers: usize, strategy: LoadBalanceStrategy) -> Self {
            let listen_fd = tcp_listener(0, 128, false).unwrap();
            let port = local_port(listen_fd).unwrap();
            let events = Arc::new(Mutex::new(Vec::new()));
            let accepted: Arc<Vec<AtomicI64>> = Arc::new((0..workers).map(|_| AtomicI64::new(0)).collect());

            let config = WorkerGroupConfig::new()
                .workers(workers)
                .strategy(strategy)
                .lock_retry_delay_ms(5);
            let mut group = WorkerGroup::new(config).unwrap();

            let ev = Arc::clone(&events);
            let acc = Arc::clone(&accepted);
            group
                .start(move |ctx| {
                    let id = ctx.worker_id();
                    let acceptor = Rc::new(Acceptor::with_defaults(ctx.event_loop(), listen_fd));
                    let counts = Arc::clone(&acc);
                    acceptor.set_new_connection_handler(move |_, fd| {
                        counts[id].fetch_add(1, Ordering::SeqCst);
                        unsafe { libc::close(fd); }
                        AcceptDecision::SuggestStop
                    });

                    let metric = Arc::clone(&acc);
                    ctx.set_load_metric(move || metric[id].load(Ordering::SeqCst));

                    let a = Rc::clone(&acceptor);
                    let e = Arc::clone(&ev);
                    ctx.set_token_acquired(move || {
                        e.lock().unwrap().push(Ev::Acquired(id));
                        a.enable_listening().unwrap();
                    });
                    let a = Rc::clone(&acceptor);
                    let e = Arc::clone(&ev);
                    ctx.set_token_yielded(move || {
                        a.disable_listening().unwrap();
                        e.lock().unwrap().push(Ev::Yielded(id));
                    });
                })
                .unwrap();
            Self { group, listen_fd, port, events, accepted }
        }

        fn total(&self) -> i64 {
            self.accepted.iter().map(|a| a.load(Ordering::SeqCst)).sum()
        }

        /// Connect `n` times, one at a time, waiting for each accept.
        fn connect_each(&self, n: i64) {
            for i in 0..n {
                let _s = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
                let start = Instant::now();
                while self.total() < i + 1 && start.elapsed() < Duration::from_secs(2) {
                    thread::sleep(Duration::from_millis(2));
                }
                assert_eq!(self.total(), i + 1, "connection {} not accepted", i);
            }
        }

        fn finish(mut self) -> (Vec<Ev>, Vec<i64>) {
            self.group.stop();
            assert!(self.group.workers().iter().all(|w| w.has_stopped() && !w.holds_token()));
            unsafe { libc::close(self.listen_fd); }
            let events = self.events.lock().unwrap().clone();
            let counts = self.accepted.iter().map(|a| a.load(Ordering::SeqCst)).collect();
            (events, counts)
        }
    }

    /// Acquire and yield strictly alternate: at most one holder at a time.
    fn assert_alternating(events: &[Ev]) {
        let mut holder: Option<usize> = None;
        for ev in events {
            match *ev {
                Ev::Acquired(id) => {
                    assert_eq!(holder, None, "worker {} acquired while {:?} held", id, holder);
                    holder = Some(id);
                }
                Ev::Yielded(id) => {
                    assert_eq!(holder, Some(id), "worker {} yielded without holding", id);
                    holder = None;
                }
            }
        }
        assert_eq!(holder, None);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let err = WorkerGroup::new(WorkerGroupConfig::new().workers(0)).err();
        assert_eq!(err, Some(NetError::InvalidArgument("workers must be > 0")));
    }

    #[test]
    fn test_round_robin_token_visits_every_worker() {
        let h = Harness::start(3, LoadBalanceStrategy::RoundRobin);
        assert_eq!(h.group.len(), 3);
        h.connect_each(6);
        let (events, counts) = h.finish();
        assert_alternating(&events);
        assert_eq!(counts, vec![2, 2, 2]);
    }

    #[test]
    fn test_metric_smaller_spreads_load() {
        let h = Harness::start(2, LoadBalanceStrategy::MetricSmaller);
        h.connect_each(6);
        let (events, counts) = h.finish();
        assert_alternating(&events);
        assert!((counts[0] - counts[1]).abs() <= 1, "uneven: {:?}", counts);
    }

    #[test]
    fn test_lock_strategy_single_holder() {
        let h = Harness::start(3, LoadBalanceStrategy::Lock);
        h.connect_each(5);
        let (events, counts) = h.finish();
        assert_alternating(&events);
        assert_eq!(counts.iter().sum::<i64>(), 5);
    }

    #[test]
    fn test_single_worker_holds_token() {
        let h = Harness::start(1, LoadBalanceStrategy::RoundRobin);
        let start = Instant::now();
        while !h.group.workers()[0].holds_token() && start.elapsed() < Duration::from_secs(1) {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(h.group.workers()[0].holds_token());
        h.connect_each(3);
        assert!(h.group.workers()[0].holds_token());
        let (events, counts) = h.finish();
        assert_eq!(events, vec![Ev::Acquired(0), Ev::Yielded(0)]);
        assert_eq!(counts, vec![3]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut group = WorkerGroup::new(WorkerGroupConfig::new().workers(2)).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&started);
        group
            .start(move |ctx| {
                assert_eq!(ctx.worker_count(), 2);
                s.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(group.start(|_| {}).is_err());
        group.stop();
        group.stop();
        assert!(!group.is_running());
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }
}
