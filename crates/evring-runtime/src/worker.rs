//! Worker - one loop thread taking part in the accept-token ring
//!
//! Every worker runs ordinary I/O all the time; only the worker holding the
//! accept token keeps its listening channels enabled (the transport layer
//! does that from the token-acquired / token-yielded hooks).
//!
//! ```text
//!   iteration:  acquire? ──► wait_and_process ──► listening ready ──► load_balance
//!                                                                       │
//!         lock:         yield + unlock                                  │
//!         round-robin:  yield + relay to next buddy          ◄──────────┘
//!         smaller:      relay to first buddy with metric <  own
//!         larger:       relay to first buddy with metric >  own
//! ```
//!
//! A relay sets the target's `relayed` flag and wakes its loop; the target
//! picks the token up at the top of its next iteration. Buddies are the
//! other workers in ring order starting right after this one.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use evring_core::{kdebug, kinfo, ktrace, kwarn, LoadBalanceStrategy, TokenLock};

use crate::event_loop::{EventLoop, LoopHandle};

/// Load metric readable by ring neighbours from their own threads.
pub type LoadMetric = Arc<dyn Fn() -> i64 + Send + Sync>;

thread_local! {
    static CURRENT_WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Id of the worker running on this thread, if any.
pub fn current_worker_id() -> Option<usize> {
    let id = CURRENT_WORKER_ID.with(|c| c.get());
    (id != usize::MAX).then_some(id)
}

pub(crate) fn set_current_worker_id(id: usize) {
    CURRENT_WORKER_ID.with(|c| c.set(id));
}

// ============================================================================
// Cross-thread state
// ============================================================================

/// The part of a worker its neighbours and the group may touch.
pub(crate) struct WorkerShared {
    id: usize,
    handle: LoopHandle,
    relayed: AtomicBool,
    held: AtomicBool,
    exited: AtomicBool,
    metric: OnceLock<LoadMetric>,
}

impl WorkerShared {
    pub(crate) fn new(id: usize, handle: LoopHandle) -> Self {
        Self {
            id,
            handle,
            relayed: AtomicBool::new(false),
            held: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            metric: OnceLock::new(),
        }
    }

    pub(crate) fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    fn load_metric(&self) -> i64 {
        self.metric.get().map_or(0, |m| m())
    }

    /// Hand the token to this worker and wake it.
    fn relay(&self) {
        self.relayed.store(true, Ordering::Release);
        self.handle.wakeup();
    }
}

/// Group-side view of a worker.
#[derive(Clone)]
pub struct WorkerRef {
    shared: Arc<WorkerShared>,
}

impl WorkerRef {
    pub(crate) fn new(shared: Arc<WorkerShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Ask the worker to leave its loop after the current iteration.
    pub fn request_stop(&self) {
        self.shared.handle.quit();
    }

    pub fn has_stopped(&self) -> bool {
        self.shared.exited.load(Ordering::Acquire)
    }

    pub fn holds_token(&self) -> bool {
        self.shared.held.load(Ordering::Acquire)
    }

    /// Current load metric, 0 until the worker installs one.
    pub fn load_metric(&self) -> i64 {
        self.shared.load_metric()
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.shared.handle.clone()
    }
}

impl std::fmt::Debug for WorkerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRef")
            .field("id", &self.id())
            .field("holds_token", &self.holds_token())
            .field("stopped", &self.has_stopped())
            .finish()
    }
}

// ============================================================================
// Setup context
// ============================================================================

#[derive(Default)]
struct Hooks {
    before_acquire: Option<Box<dyn FnMut() -> bool>>,
    acquired: Option<Box<dyn FnMut()>>,
    yielded: Option<Box<dyn FnMut()>>,
}

/// Handed to the group's setup function on each worker thread, before the
/// worker starts looping.
pub struct WorkerContext {
    lp: EventLoop,
    shared: Arc<WorkerShared>,
    worker_count: usize,
    hooks: Hooks,
}

impl WorkerContext {
    pub(crate) fn new(lp: EventLoop, shared: Arc<WorkerShared>, worker_count: usize) -> Self {
        Self { lp, shared, worker_count, hooks: Hooks::default() }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.lp
    }

    pub fn worker_id(&self) -> usize {
        self.shared.id
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// A single worker holds the token for good and never balances.
    pub fn is_single(&self) -> bool {
        self.worker_count == 1
    }

    /// Consulted before each lock attempt under the lock strategy;
    /// returning false skips the attempt.
    pub fn set_before_acquire_token<F: FnMut() -> bool + 'static>(&mut self, f: F) {
        self.hooks.before_acquire = Some(Box::new(f));
    }

    /// Install the load metric. Only the first call takes effect.
    pub fn set_load_metric<F: Fn() -> i64 + Send + Sync + 'static>(&mut self, f: F) {
        if self.shared.metric.set(Arc::new(f)).is_err() {
            kwarn!("worker {}: load metric already set", self.shared.id);
        }
    }

    pub fn set_token_acquired<F: FnMut() + 'static>(&mut self, f: F) {
        self.hooks.acquired = Some(Box::new(f));
    }

    pub fn set_token_yielded<F: FnMut() + 'static>(&mut self, f: F) {
        self.hooks.yielded = Some(Box::new(f));
    }
}

// ============================================================================
// Worker
// ============================================================================

pub(crate) struct Worker {
    lp: EventLoop,
    shared: Arc<WorkerShared>,
    buddies: Vec<Arc<WorkerShared>>,
    is_head: bool,
    strategy: LoadBalanceStrategy,
    lock: Arc<TokenLock>,
    retry_delay_ms: i32,
    hooks: Hooks,
}

impl Worker {
    /// `ring` is every worker of the group in group order.
    pub(crate) fn new(
        ctx: WorkerContext,
        ring: &[Arc<WorkerShared>],
        strategy: LoadBalanceStrategy,
        lock: Arc<TokenLock>,
        retry_delay_ms: i64,
    ) -> Self {
        let id = ctx.shared.id;
        let buddies = arrange_buddies(ring, id);
        Self {
            lp: ctx.lp,
            is_head: ring.first().map_or(false, |w| w.id == id),
            shared: ctx.shared,
            buddies,
            strategy,
            lock,
            retry_delay_ms: retry_delay_ms.clamp(1, i32::MAX as i64) as i32,
            hooks: ctx.hooks,
        }
    }

    fn is_single(&self) -> bool {
        self.buddies.is_empty()
    }

    fn held(&self) -> bool {
        self.shared.held.load(Ordering::Acquire)
    }

    fn token_acquired(&mut self) {
        ktrace!("worker {} acquired token", self.shared.id);
        self.shared.held.store(true, Ordering::Release);
        if let Some(hook) = self.hooks.acquired.as_mut() {
            hook();
        }
    }

    fn yield_token(&mut self) {
        ktrace!("worker {} yields token", self.shared.id);
        self.shared.held.store(false, Ordering::Release);
        if let Some(hook) = self.hooks.yielded.as_mut() {
            hook();
        }
    }

    fn acquire_token(&mut self) {
        if self.is_single() || self.held() {
            return;
        }
        match self.strategy {
            LoadBalanceStrategy::Lock => {
                if let Some(before) = self.hooks.before_acquire.as_mut() {
                    if !before() {
                        return;
                    }
                }
                if self.lock.try_lock() {
                    self.token_acquired();
                }
            }
            _ => {
                if self.shared.relayed.swap(false, Ordering::AcqRel) {
                    self.token_acquired();
                }
            }
        }
    }

    /// Runs after listening channels were dispatched.
    fn load_balance(&mut self) {
        if !self.held() {
            return;
        }
        match self.strategy {
            LoadBalanceStrategy::Lock => {
                self.yield_token();
                self.lock.unlock();
            }
            LoadBalanceStrategy::RoundRobin => {
                if let Some(next) = self.buddies.first().cloned() {
                    self.yield_token();
                    next.relay();
                }
            }
            LoadBalanceStrategy::MetricSmaller => self.relay_by_metric(|theirs, mine| theirs < mine),
            LoadBalanceStrategy::MetricLarger => self.relay_by_metric(|theirs, mine| theirs > mine),
        }
    }

    fn relay_by_metric(&mut self, better: impl Fn(i64, i64) -> bool) {
        let mine = self.shared.load_metric();
        let target = self
            .buddies
            .iter()
            .find(|b| better(b.load_metric(), mine))
            .cloned();
        if let Some(target) = target {
            kdebug!("worker {} relays token to {} (metric {})", self.shared.id, target.id, mine);
            self.yield_token();
            target.relay();
        }
    }

    pub(crate) fn run(&mut self) {
        kinfo!(
            "worker {} starting: strategy={} buddies={}",
            self.shared.id,
            self.strategy,
            self.buddies.len()
        );
        if self.is_single() || (self.is_head && self.strategy.is_ring()) {
            self.token_acquired();
        }

        let lp = self.lp.clone();
        let single = self.is_single();
        while !lp.is_quit() {
            self.acquire_token();
            let timeout = if !self.held() && self.strategy == LoadBalanceStrategy::Lock {
                self.retry_delay_ms
            } else {
                -1
            };
            if single {
                lp.wait_and_process(timeout, None);
            } else {
                let mut balance = || self.load_balance();
                lp.wait_and_process(timeout, Some(&mut balance));
            }
        }

        if self.held() {
            self.yield_token();
            if self.strategy == LoadBalanceStrategy::Lock && !self.is_single() {
                self.lock.unlock();
            }
        }
        self.shared.exited.store(true, Ordering::Release);
        kdebug!("worker {} exited", self.shared.id);
    }
}

/// Ring order after `id`: for 4 workers, worker 1 sees 2, 3, 0.
fn arrange_buddies(ring: &[Arc<WorkerShared>], id: usize) -> Vec<Arc<WorkerShared>> {
    let Some(pos) = ring.iter().position(|w| w.id == id) else {
        return Vec::new();
    };
    ring[pos + 1..]
        .iter()
        .chain(ring[..pos].iter())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;

    fn ring(n: usize) -> Vec<Arc<WorkerShared>> {
        (0..n)
            .map(|i| Arc::new(WorkerShared::new(i, LoopHandle::new().unwrap())))
            .collect()
    }

    fn worker(ring: &[Arc<WorkerShared>], id: usize, strategy: LoadBalanceStrategy) -> Worker {
        let shared = Arc::clone(&ring[id]);
        let lp = EventLoop::with_handle(LoopConfig::new(), shared.handle().clone()).unwrap();
        let ctx = WorkerContext::new(lp, shared, ring.len());
        Worker::new(ctx, ring, strategy, Arc::new(TokenLock::new()), 10)
    }

    #[test]
    fn test_arrange_buddies_ring_order() {
        let r = ring(4);
        let ids = |id| arrange_buddies(&r, id).iter().map(|w| w.id).collect::<Vec<_>>();
        assert_eq!(ids(0), vec![1, 2, 3]);
        assert_eq!(ids(1), vec![2, 3, 0]);
        assert_eq!(ids(3), vec![0, 1, 2]);
        assert!(arrange_buddies(&r[..1], 0).is_empty());
    }

    #[test]
    fn test_round_robin_relays_to_next() {
        let r = ring(3);
        let mut w0 = worker(&r, 0, LoadBalanceStrategy::RoundRobin);
        assert!(w0.is_head);
        w0.token_acquired();
        w0.load_balance();
        assert!(!w0.held());
        assert!(r[1].relayed.load(Ordering::Acquire));
        assert!(!r[2].relayed.load(Ordering::Acquire));

        let mut w1 = worker(&r, 1, LoadBalanceStrategy::RoundRobin);
        assert!(!w1.is_head);
        w1.acquire_token();
        assert!(w1.held());
        assert!(!r[1].relayed.load(Ordering::Acquire));
    }

    #[test]
    fn test_metric_smaller_keeps_token_on_tie() {
        let r = ring(3);
        r[0].metric.set(Arc::new(|| 5)).ok();
        r[1].metric.set(Arc::new(|| 5)).ok();
        r[2].metric.set(Arc::new(|| 7)).ok();
        let mut w0 = worker(&r, 0, LoadBalanceStrategy::MetricSmaller);
        w0.token_acquired();
        w0.load_balance();
        assert!(w0.held());
        assert!(!r[1].relayed.load(Ordering::Acquire));
        assert!(!r[2].relayed.load(Ordering::Acquire));
    }

    #[test]
    fn test_metric_larger_picks_first_in_ring_order() {
        let r = ring(4);
        r[0].metric.set(Arc::new(|| 1)).ok();
        r[1].metric.set(Arc::new(|| 0)).ok();
        r[2].metric.set(Arc::new(|| 3)).ok();
        r[3].metric.set(Arc::new(|| 9)).ok();
        let mut w0 = worker(&r, 0, LoadBalanceStrategy::MetricLarger);
        w0.token_acquired();
        w0.load_balance();
        assert!(!w0.held());
        assert!(r[2].relayed.load(Ordering::Acquire));
        assert!(!r[3].relayed.load(Ordering::Acquire));
    }

    #[test]
    fn test_lock_strategy_respects_before_acquire() {
        let r = ring(2);
        let lock = Arc::new(TokenLock::new());
        let shared = Arc::clone(&r[1]);
        let lp = EventLoop::with_handle(LoopConfig::new(), shared.handle().clone()).unwrap();
        let mut ctx = WorkerContext::new(lp, shared, 2);
        let allow = std::rc::Rc::new(Cell::new(false));
        let a = std::rc::Rc::clone(&allow);
        ctx.set_before_acquire_token(move || a.get());
        let mut w1 = Worker::new(ctx, &r, LoadBalanceStrategy::Lock, Arc::clone(&lock), 10);

        w1.acquire_token();
        assert!(!w1.held());
        assert!(!lock.is_locked());

        allow.set(true);
        w1.acquire_token();
        assert!(w1.held());
        assert!(lock.is_locked());

        w1.load_balance();
        assert!(!w1.held());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_load_balance_without_token_is_noop() {
        let r = ring(2);
        let mut w0 = worker(&r, 0, LoadBalanceStrategy::RoundRobin);
        w0.load_balance();
        assert!(!r[1].relayed.load(Ordering::Acquire));
    }

    #[test]
    fn test_current_worker_id() {
        assert_eq!(current_worker_id(), None);
        std::thread::spawn(|| {
            set_current_worker_id(3);
            assert_eq!(current_worker_id(), Some(3));
        })
        .join()
        .unwrap();
        assert_eq!(current_worker_id(), None);
    }
}
