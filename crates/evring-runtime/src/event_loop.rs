//! EventLoop - the per-thread reactor
//!
//! One loop per thread. Each iteration of [`EventLoop::wait_and_process`]:
//!
//! ```text
//!   poll(timeout) ──► listening channels ──► post-accept hook
//!        │                                         │
//!        │            ordinary channels ◄──────────┘
//!        │                   │
//!        │                   ▼
//!        │         cross-thread functors (swap-drained once)
//!        │                   │
//!        └──────────► heap expiry (only if time moved or timeout == 0)
//! ```
//!
//! Wheels are driven by repeating heap timers, so they expire as part of
//! heap expiry.
//!
//! # Clock
//!
//! `now()` is a cached wall clock in ms since the epoch. With a time
//! resolution of 0 it is refreshed after every wait and the wait timeout
//! is clipped to the earliest heap deadline. With a positive resolution a
//! timerfd ticker refreshes it once per period instead; timers then fire
//! on the first tick at or after their deadline.
//!
//! # Threads
//!
//! [`EventLoop`] is `!Send`: channels, timers and handlers stay on the
//! loop's thread. The only way in from another thread is a [`LoopHandle`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use evring_core::{kdebug, kerror, NetResult, POLLER_NAME};

use crate::channel::{Channel, ChannelCore};
use crate::config::LoopConfig;
use crate::notifier::WakeupFd;
use crate::poller::{ActiveChannels, Poller};
use crate::signal::{SignalHandlers, SignalService};
use crate::ticker::Ticker;
use crate::timer::{
    TimeWheel, TimerCallback, TimerContainer, TimerHandle, TimerHeap, TimerKey, TimerKind,
    TimerSlab, TimerStats, WheelCore,
};

/// Work submitted from another thread.
pub type Functor = Box<dyn FnOnce(&EventLoop) + Send>;

/// Wall clock in ms since the Unix epoch.
pub fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Cross-thread handle
// ============================================================================

struct LoopShared {
    wakeup: WakeupFd,
    pending: Mutex<Vec<Functor>>,
    quit: AtomicBool,
}

/// Thread-safe handle to a loop.
///
/// Cloneable and `Send + Sync`. A handle may be created before its loop
/// (see [`EventLoop::with_handle`]) so that other threads can hold it
/// while the loop is still being built; it must not back two live loops.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn new() -> NetResult<Self> {
        Ok(Self {
            shared: Arc::new(LoopShared {
                wakeup: WakeupFd::new()?,
                pending: Mutex::new(Vec::new()),
                quit: AtomicBool::new(false),
            }),
        })
    }

    /// Queue `f` to run on the loop's thread and wake the loop.
    ///
    /// Functors queued while the loop drains its queue run on the next
    /// iteration.
    pub fn wakeup_and_run<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
        self.wakeup();
    }

    /// Make the loop's current or next wait return.
    pub fn wakeup(&self) {
        if let Err(e) = self.shared.wakeup.notify() {
            kerror!("loop wakeup failed: {}", e);
        }
    }

    /// Ask the loop to leave `run()` after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.wakeup();
    }

    pub fn is_quit(&self) -> bool {
        self.shared.quit.load(Ordering::Acquire)
    }

    /// Deliver a caught signal to the loop's handlers.
    pub fn signal_raised(&self, sig: i32) {
        self.wakeup_and_run(move |lp| lp.dispatch_signal(sig));
    }

    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn take_pending(&self) -> Vec<Functor> {
        std::mem::take(&mut *self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("wakeup_fd", &self.shared.wakeup.fd())
            .field("quit", &self.is_quit())
            .finish()
    }
}

// ============================================================================
// Loop state
// ============================================================================

pub(crate) struct LoopInner {
    pub(crate) poller: Poller,
    pub(crate) channels: RefCell<HashMap<u64, Weak<ChannelCore>>>,
    next_token: Cell<u64>,
    pub(crate) now: Cell<i64>,
    config: LoopConfig,
    resolution: i64,
    pub(crate) heap: RefCell<TimerHeap>,
    pub(crate) wheels: RefCell<TimerSlab<WheelCore>>,
    idle_wheel: RefCell<Option<TimeWheel>>,
    wakeup_channel: RefCell<Option<Channel>>,
    ticker: RefCell<Option<(Ticker, Channel)>>,
    pub(crate) signals: RefCell<SignalHandlers>,
    pub(crate) signal_service: RefCell<Option<SignalService>>,
    handle: LoopHandle,
}

impl LoopInner {
    pub(crate) fn handle_ref(&self) -> &LoopHandle {
        &self.handle
    }

    pub(crate) fn next_channel_token(&self) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        token
    }

    /// Clock used to anchor heap deadlines: the fresh wall clock when the
    /// cache is only refreshed by the ticker, so deadlines are never early.
    pub(crate) fn anchor(&self) -> i64 {
        if self.resolution > 0 {
            wall_clock_ms()
        } else {
            self.now.get()
        }
    }

    /// Run `f` against the container a timer lives in. Heap timers see the
    /// anchored clock, wheel timers the cached one since they move in ticks.
    ///
    /// The container borrow ends before the result is handed back, so a
    /// [`Released`](crate::timer::Released) returned by `f` is dropped
    /// outside it.
    pub(crate) fn with_container<R>(
        &self,
        kind: TimerKind,
        f: impl FnOnce(&mut dyn TimerContainer, i64) -> R,
    ) -> Option<R> {
        match kind {
            TimerKind::Heap(_) => {
                let now = self.anchor();
                let mut heap = self.heap.borrow_mut();
                Some(f(&mut *heap, now))
            }
            TimerKind::Wheel(id, _) => {
                let now = self.now.get();
                let mut wheels = self.wheels.borrow_mut();
                let wheel = wheels.get_mut(id)?;
                Some(f(wheel, now))
            }
        }
    }

    pub(crate) fn close_wheel(&self, id: TimerKey) {
        let removed = self.wheels.borrow_mut().remove(id);
        let Some(wheel) = removed else {
            return;
        };
        if let Some(driver) = wheel.driver() {
            let released = self.heap.borrow_mut().cancel(driver);
            drop(released);
        }
        kdebug!("time wheel closed with {} timers", wheel.len());
        drop(wheel);
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        self.release_signals();
    }
}

// ============================================================================
// EventLoop
// ============================================================================

/// Single-threaded reactor. Cheap to clone; clones share the loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create a loop with its own handle.
    ///
    /// Fails only when a kernel object (epoll, eventfd, timerfd) cannot be
    /// created.
    pub fn new(config: LoopConfig) -> NetResult<Self> {
        Self::with_handle(config, LoopHandle::new()?)
    }

    /// Create a loop around a handle made in advance.
    pub fn with_handle(config: LoopConfig, handle: LoopHandle) -> NetResult<Self> {
        let resolution = config.effective_time_resolution();
        let inner = Rc::new(LoopInner {
            poller: Poller::new()?,
            channels: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            now: Cell::new(wall_clock_ms()),
            config,
            resolution,
            heap: RefCell::new(TimerHeap::new()),
            wheels: RefCell::new(TimerSlab::new()),
            idle_wheel: RefCell::new(None),
            wakeup_channel: RefCell::new(None),
            ticker: RefCell::new(None),
            signals: RefCell::new(SignalHandlers::default()),
            signal_service: RefCell::new(None),
            handle,
        });
        let lp = EventLoop { inner };

        let wakeup = Channel::new(&lp, lp.inner.handle.shared.wakeup.fd());
        wakeup.set_read_handler(|lp: &EventLoop| {
            lp.inner.handle.shared.wakeup.drain();
        });
        wakeup.enable_reading()?;
        *lp.inner.wakeup_channel.borrow_mut() = Some(wakeup);

        if resolution > 0 {
            let ticker = Ticker::new(resolution)?;
            let channel = Channel::new(&lp, ticker.fd());
            channel.set_read_handler(|lp: &EventLoop| lp.on_tick());
            channel.enable_reading()?;
            *lp.inner.ticker.borrow_mut() = Some((ticker, channel));
        }

        kdebug!(
            "event loop up: poller={} resolution={}ms",
            POLLER_NAME,
            resolution
        );
        Ok(lp)
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }

    pub fn handle(&self) -> LoopHandle {
        self.inner.handle.clone()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    /// Clock refresh period in ms, 0 when the ticker is off.
    pub fn time_resolution(&self) -> i64 {
        self.inner.resolution
    }

    /// Cached wall clock, ms since the epoch.
    pub fn now(&self) -> i64 {
        self.inner.now.get()
    }

    /// Re-read the wall clock into the cache.
    pub fn refresh_now(&self) -> i64 {
        let now = wall_clock_ms();
        self.inner.now.set(now);
        now
    }

    fn on_tick(&self) {
        if let Some((ticker, _)) = self.inner.ticker.borrow().as_ref() {
            ticker.drain();
        }
        self.refresh_now();
    }

    /// Queue `f` for the next iteration. Same as going through the handle.
    pub fn wakeup_and_run<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        self.inner.handle.wakeup_and_run(f);
    }

    pub fn quit(&self) {
        self.inner.handle.quit();
    }

    pub fn is_quit(&self) -> bool {
        self.inner.handle.is_quit()
    }

    /// Live channels, including the loop's own wakeup and ticker channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.borrow().len()
    }

    /// Timers held by the heap and every wheel, wheel drivers included.
    pub fn timer_count(&self) -> usize {
        let wheels: usize = self.inner.wheels.borrow().iter().map(|(_, w)| w.len()).sum();
        self.inner.heap.borrow().len() + wheels
    }

    /// Counters summed over the heap and every open wheel.
    pub fn timer_stats(&self) -> TimerStats {
        let mut stats = self.inner.heap.borrow().stats();
        for (_, wheel) in self.inner.wheels.borrow().iter() {
            stats.merge(&wheel.stats());
        }
        stats
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Run iterations until [`quit`](Self::quit) is called.
    pub fn run(&self) {
        while !self.is_quit() {
            self.wait_and_process(-1, None);
        }
    }

    fn clip_timeout(&self, timeout: i32) -> i32 {
        if self.inner.resolution > 0 {
            return timeout;
        }
        let earliest = self.inner.heap.borrow().earliest_timeout(self.inner.now.get());
        if earliest < 0 {
            return timeout;
        }
        let earliest = earliest.min(i32::MAX as i64) as i32;
        if timeout < 0 {
            earliest
        } else {
            timeout.min(earliest)
        }
    }

    /// One wait-and-dispatch cycle.
    ///
    /// `timeout` is in ms: -1 blocks, 0 polls. `post_accept` runs after the
    /// listening channels, only when at least one of them was ready.
    pub fn wait_and_process(&self, timeout: i32, post_accept: Option<&mut dyn FnMut()>) {
        let timeout = self.clip_timeout(timeout);
        let before = self.inner.now.get();

        let mut active = ActiveChannels::default();
        {
            let channels = &self.inner.channels;
            self.inner.poller.poll(
                timeout,
                |token| channels.borrow().get(&token).and_then(Weak::upgrade),
                &mut active,
            );
        }
        if self.inner.resolution == 0 {
            self.refresh_now();
        }

        for channel in &active.listening {
            channel.handle_event(self);
        }
        if !active.listening.is_empty() {
            if let Some(hook) = post_accept {
                hook();
            }
        }
        for channel in &active.ordinary {
            channel.handle_event(self);
        }
        active.clear();

        self.run_pending();

        if timeout == 0 || self.inner.now.get() != before {
            self.expire_heap();
        }
    }

    fn run_pending(&self) {
        let functors = self.inner.handle.take_pending();
        for f in functors {
            f(self);
        }
    }

    fn expire_heap(&self) {
        let heap = &self.inner.heap;
        let now = self.inner.now.get();
        heap.borrow_mut().begin_pass();
        loop {
            let next = heap.borrow_mut().begin_fire(now);
            let Some((key, mut callback)) = next else {
                break;
            };
            callback(self);
            let released = heap.borrow_mut().end_fire(self.inner.now.get(), key, callback);
            drop(released);
        }
        heap.borrow_mut().end_pass();
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Fire `f` at the absolute time `when`, then every `interval` ms if
    /// positive. `None` for a negative interval.
    pub fn run_at<F>(&self, when: i64, interval: i64, f: F) -> Option<TimerHandle>
    where
        F: FnMut(&EventLoop) + 'static,
    {
        if interval < 0 {
            return None;
        }
        let key = self.inner.heap.borrow_mut().add_at(when, interval, Box::new(f));
        Some(TimerHandle::new(Rc::downgrade(&self.inner), TimerKind::Heap(key)))
    }

    /// Fire `f` `after` ms from now, then every `interval` ms if positive.
    /// `None` for negative values.
    pub fn run_after<F>(&self, after: i64, interval: i64, f: F) -> Option<TimerHandle>
    where
        F: FnMut(&EventLoop) + 'static,
    {
        let callback: TimerCallback = Box::new(f);
        let key = self
            .inner
            .heap
            .borrow_mut()
            .add(self.inner.anchor(), after, interval, callback)?;
        Some(TimerHandle::new(Rc::downgrade(&self.inner), TimerKind::Heap(key)))
    }

    /// Create a wheel of `slots` slots advancing every `tick_ms`.
    pub fn add_time_wheel(&self, slots: usize, tick_ms: i64) -> Option<TimeWheel> {
        if slots == 0 || tick_ms <= 0 {
            return None;
        }
        let id = self.inner.wheels.borrow_mut().insert(WheelCore::new(slots, tick_ms));
        let driver: TimerCallback = Box::new(move |lp: &EventLoop| lp.tick_wheel(id));
        let added = self
            .inner
            .heap
            .borrow_mut()
            .add(self.inner.anchor(), tick_ms, tick_ms, driver);
        let Some(driver_key) = added else {
            self.inner.wheels.borrow_mut().remove(id);
            return None;
        };
        if let Some(wheel) = self.inner.wheels.borrow_mut().get_mut(id) {
            wheel.set_driver(driver_key);
        }
        kdebug!("time wheel added: slots={} tick={}ms", slots, tick_ms);
        Some(TimeWheel::new(Rc::downgrade(&self.inner), id))
    }

    pub(crate) fn tick_wheel(&self, id: TimerKey) {
        let wheels = &self.inner.wheels;
        match wheels.borrow_mut().get_mut(id) {
            Some(wheel) => wheel.begin_tick(),
            None => return,
        }
        loop {
            let next = wheels.borrow_mut().get_mut(id).and_then(|w| w.begin_fire());
            let Some((key, mut callback)) = next else {
                break;
            };
            callback(self);
            let mut guard = wheels.borrow_mut();
            let released = match guard.get_mut(id) {
                Some(wheel) => wheel.end_fire(self.inner.now.get(), key, callback),
                // Closed from inside the callback.
                None => {
                    drop(guard);
                    drop(callback);
                    return;
                }
            };
            drop(guard);
            drop(released);
        }
        if let Some(wheel) = wheels.borrow_mut().get_mut(id) {
            wheel.end_tick();
        }
    }

    /// The idle-timer wheel, created on first use from the loop config.
    pub fn idle_wheel(&self) -> Option<TimeWheel> {
        let existing = self.inner.idle_wheel.borrow().clone();
        if let Some(wheel) = existing {
            if wheel.is_open() {
                return Some(wheel);
            }
        }
        let config = &self.inner.config;
        let wheel = self.add_time_wheel(config.idle_wheel_slots, config.idle_wheel_tick_ms)?;
        *self.inner.idle_wheel.borrow_mut() = Some(wheel.clone());
        Some(wheel)
    }

    /// Fire `f` once after about `idle_ms` on the idle wheel.
    ///
    /// The horizon is shortened by one tick, so with tick `T` the timer
    /// fires within `(idle_ms - T, idle_ms]`.
    pub fn add_idle_timer<F>(&self, idle_ms: i64, f: F) -> Option<TimerHandle>
    where
        F: FnMut(&EventLoop) + 'static,
    {
        if idle_ms < 0 {
            return None;
        }
        let wheel = self.idle_wheel()?;
        let after = (idle_ms - wheel.tick_interval()).max(0);
        wheel.add_timer(after, 0, f)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("poller", &POLLER_NAME)
            .field("resolution_ms", &self.inner.resolution)
            .field("channels", &self.channel_count())
            .field("timers", &self.timer_count())
            .finish()
    }
}
