//! Timer engine
//!
//! Two containers share one contract ([`TimerContainer`]): a deadline-ordered
//! heap for sparse or long-horizon timers and a slotted wheel for dense,
//! bounded-horizon ones (idle and keepalive timeouts).
//!
//! # Architecture
//!
//! ```text
//!                         EventLoop (one thread)
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │                                                              │
//!   │  run_at / run_after ──► TimerHeap  BTreeMap<(when, seq), key> │
//!   │                             │                                │
//!   │                             │ periodic driver timer per wheel│
//!   │                             ▼                                │
//!   │  TimeWheel::add_timer ──► WheelCore  [slot 0][slot 1]...[n-1]│
//!   │                           each slot: due list + long list    │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timers live in a generational arena ([`TimerSlab`]); callers hold a
//! [`TimerHandle`] naming the container and the arena key, never a pointer.
//! A released key fails its generation check, so cancelling or restarting a
//! stale handle is a harmless no-op.
//!
//! # Firing discipline
//!
//! Per timer: `pending → firing → pending (repeat / restart) | released`.
//! Before a callback runs, the container unlinks the timer and moves the
//! callback onto the caller's stack, then releases its `RefCell` borrow.
//! The callback may therefore add, cancel or restart any timer, itself
//! included. When it returns the container decides: cancelled timers are
//! dropped, restarted or repeating ones are re-linked, one-shots released.
//!
//! A callback can own anything, including handles whose `Drop` cancels other
//! timers. Containers therefore never drop a callback themselves: `cancel`
//! and `end_fire` hand it back as [`Released`], and the loop drops that only
//! once its container borrow has ended.

pub mod heap;
pub mod wheel;

use std::rc::Weak;

use crate::event_loop::{EventLoop, LoopInner};

pub use heap::TimerHeap;
pub use wheel::{TimeWheel, WheelCore};

/// Timer callback. Receives the loop that fired it.
pub type TimerCallback = Box<dyn FnMut(&EventLoop)>;

/// A callback a container has let go of.
///
/// Dropping it runs the callback's captured destructors, which may reach
/// back into the timer containers, so it must outlive any container borrow.
#[must_use = "drop released timers after the container borrow ends"]
pub struct Released(Option<TimerCallback>);

impl Released {
    pub(crate) fn none() -> Self {
        Released(None)
    }

    /// Whether a callback is held.
    pub fn holds_callback(&self) -> bool {
        self.0.is_some()
    }
}

impl From<TimerCallback> for Released {
    fn from(callback: TimerCallback) -> Self {
        Released(Some(callback))
    }
}

impl From<Option<TimerCallback>> for Released {
    fn from(callback: Option<TimerCallback>) -> Self {
        Released(callback)
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Generational index into a [`TimerSlab`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    index: u32,
    generation: u32,
}

struct SlabEntry<T> {
    generation: u32,
    value: Option<T>,
}

/// Vec-backed arena with generation-checked keys.
pub struct TimerSlab<T> {
    entries: Vec<SlabEntry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for TimerSlab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerSlab<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new(), free: Vec::new(), len: 0 }
    }

    pub fn insert(&mut self, value: T) -> TimerKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return TimerKey { index, generation: entry.generation };
        }
        let index = self.entries.len() as u32;
        self.entries.push(SlabEntry { generation: 0, value: Some(value) });
        TimerKey { index, generation: 0 }
    }

    pub fn get(&self, key: TimerKey) -> Option<&T> {
        self.entries
            .get(key.index as usize)
            .filter(|e| e.generation == key.generation)
            .and_then(|e| e.value.as_ref())
    }

    pub fn get_mut(&mut self, key: TimerKey) -> Option<&mut T> {
        self.entries
            .get_mut(key.index as usize)
            .filter(|e| e.generation == key.generation)
            .and_then(|e| e.value.as_mut())
    }

    /// Remove and invalidate every outstanding copy of `key`.
    pub fn remove(&mut self, key: TimerKey) -> Option<T> {
        let entry = self.entries.get_mut(key.index as usize)?;
        if entry.generation != key.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, key: TimerKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (TimerKey, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.value
                .as_ref()
                .map(|v| (TimerKey { index: i as u32, generation: e.generation }, v))
        })
    }
}

// ============================================================================
// Container contract
// ============================================================================

/// Counters kept by every container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub inserted: u64,
    pub fired: u64,
    pub cancelled: u64,
    pub restarted: u64,
}

impl TimerStats {
    pub fn merge(&mut self, other: &TimerStats) {
        self.inserted += other.inserted;
        self.fired += other.fired;
        self.cancelled += other.cancelled;
        self.restarted += other.restarted;
    }
}

/// Operations shared by the heap and the wheel.
///
/// `now` is the owning loop's clock: the cached one, or for heap restarts
/// under a time resolution the fresh wall clock. Every method tolerates
/// stale keys and negative durations by doing nothing.
pub trait TimerContainer {
    /// Add a timer firing `after` ms from `now`, repeating every `interval`
    /// ms when `interval > 0`.
    fn add(&mut self, now: i64, after: i64, interval: i64, callback: TimerCallback) -> Option<TimerKey>;

    /// Remove a pending timer, or mark a firing one for release once its
    /// callback returns. `None` for a stale key.
    fn cancel(&mut self, key: TimerKey) -> Option<Released>;

    /// Reschedule to `after` ms from `now` with a new `interval`.
    fn restart(&mut self, now: i64, key: TimerKey, after: i64, interval: i64) -> bool;

    /// Milliseconds until the timer is due; 0 while it is firing.
    fn remaining_time(&self, now: i64, key: TimerKey) -> Option<i64>;

    /// Absolute deadline in ms since epoch
    fn deadline(&self, key: TimerKey) -> Option<i64>;

    /// Repeat interval, 0 for one-shots
    fn interval(&self, key: TimerKey) -> Option<i64>;

    /// Timers held, including one that is currently firing.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> TimerStats;

    fn name(&self) -> &'static str;
}

// ============================================================================
// Handle
// ============================================================================

/// Which container a handle points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Heap(TimerKey),
    Wheel(TimerKey, TimerKey),
}

/// Caller-side reference to a timer.
///
/// Valid on the loop's thread only. Once the timer is released (fired as
/// a one-shot, or cancelled) every method becomes a no-op.
#[derive(Clone)]
pub struct TimerHandle {
    lp: Weak<LoopInner>,
    kind: TimerKind,
}

impl TimerHandle {
    pub(crate) fn new(lp: Weak<LoopInner>, kind: TimerKind) -> Self {
        Self { lp, kind }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn TimerContainer, i64) -> R) -> Option<R> {
        let lp = self.lp.upgrade()?;
        lp.with_container(self.kind, f)
    }

    fn key(&self) -> TimerKey {
        match self.kind {
            TimerKind::Heap(key) | TimerKind::Wheel(_, key) => key,
        }
    }

    /// Cancel the timer. Safe from inside its own callback.
    pub fn cancel(&self) -> bool {
        let key = self.key();
        // Dropped here, after the container borrow has ended.
        let released = self.with(|c, _| c.cancel(key)).flatten();
        released.is_some()
    }

    /// Reschedule `after` ms from now, repeating every `interval` ms.
    /// Negative values are ignored.
    pub fn restart(&self, after: i64, interval: i64) -> bool {
        let key = self.key();
        self.with(|c, now| c.restart(now, key, after, interval)).unwrap_or(false)
    }

    /// Milliseconds until due; 0 while firing or once released.
    pub fn remaining_time(&self) -> i64 {
        let key = self.key();
        self.with(|c, now| c.remaining_time(now, key)).flatten().unwrap_or(0)
    }

    /// Whether the timer is still held by its container.
    pub fn is_pending(&self) -> bool {
        let key = self.key();
        self.with(|c, _| c.deadline(key).is_some()).unwrap_or(false)
    }

    pub fn deadline(&self) -> Option<i64> {
        let key = self.key();
        self.with(|c, _| c.deadline(key)).flatten()
    }

    pub fn interval(&self) -> Option<i64> {
        let key = self.key();
        self.with(|c, _| c.interval(key)).flatten()
    }

    /// Handles compare equal when they name the same live timer slot.
    pub fn same_timer(&self, other: &TimerHandle) -> bool {
        self.kind == other.kind && Weak::ptr_eq(&self.lp, &other.lp)
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").field("kind", &self.kind).finish()
    }
}

/// Convert a duration into whole wheel ticks, rounding up.
///
/// `0` (or negative) means "the current slot", anything shorter than one
/// tick still takes a full tick.
#[inline]
pub fn time_to_ticks(delay: i64, tick: i64) -> i64 {
    if delay <= 0 {
        0
    } else if delay < tick {
        1
    } else {
        delay / tick + i64::from(delay % tick != 0)
    }
}
