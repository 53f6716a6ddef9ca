//! Slotted timer wheel
//!
//! ```text
//!                 current
//!                    │
//!   ┌─────┬─────┬────▼┬─────┬─────┬─────┬─────┬─────┐
//!   │  0  │  1  │  2  │  3  │  4  │  5  │  6  │  7  │   slot_count = 8
//!   └─────┴─────┴─────┴─────┴─────┴─────┴─────┴─────┘
//!     each slot: due  (rotation == -1, fire on next visit)
//!                long (rotation >= 0, demoted once per visit)
//! ```
//!
//! A wheel is driven by a repeating heap timer with period `tick`. Every
//! tick visits `current`: long timers there lose one rotation and drop into
//! the due list once it goes negative, every due timer fires, then
//! `current` advances by one slot.
//!
//! Adding a timer `H` ms out takes `ticks = time_to_ticks(H)`, lands in slot
//! `(current + ticks) % n` with `rotation = ticks / n` (`0` is stored as
//! `-1`). Since `current` is the slot visited by the *next* tick, a timer
//! fires between `ticks` and `ticks + 1` tick periods after it was added.
//!
//! Lists hold `(key, link)` pairs. Relinking a timer bumps its link number,
//! which turns any older pair into a stale entry that is skipped and dropped
//! when its slot is visited. Cancel and restart are O(1).

use std::collections::VecDeque;
use std::rc::Weak;

use super::{time_to_ticks, Released, TimerCallback, TimerContainer, TimerHandle, TimerKey, TimerKind, TimerSlab, TimerStats};
use crate::event_loop::{EventLoop, LoopInner};

type Link = (TimerKey, u32);

#[derive(Default)]
struct WheelSlot {
    due: VecDeque<Link>,
    long: Vec<Link>,
}

struct WheelTimer {
    when: i64,
    interval: i64,
    interval_ticks: i64,
    slot: usize,
    rotation: i64,
    link: u32,
    /// `Some(restarted)` while the callback runs
    firing: Option<bool>,
    callback: Option<TimerCallback>,
}

pub struct WheelCore {
    slots: Vec<WheelSlot>,
    tick: i64,
    current: usize,
    expiring: bool,
    /// Due entries the current tick may still pop
    tick_budget: usize,
    timers: TimerSlab<WheelTimer>,
    driver: Option<TimerKey>,
    stats: TimerStats,
}

impl WheelCore {
    /// `slot_count` and `tick` must both be positive.
    pub fn new(slot_count: usize, tick: i64) -> Self {
        let slot_count = slot_count.max(1);
        Self {
            slots: (0..slot_count).map(|_| WheelSlot::default()).collect(),
            tick: tick.max(1),
            current: 0,
            expiring: false,
            tick_budget: 0,
            timers: TimerSlab::new(),
            driver: None,
            stats: TimerStats::default(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn tick_interval(&self) -> i64 {
        self.tick
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn is_expiring(&self) -> bool {
        self.expiring
    }

    pub(crate) fn driver(&self) -> Option<TimerKey> {
        self.driver
    }

    pub(crate) fn set_driver(&mut self, key: TimerKey) {
        self.driver = Some(key);
    }

    /// Live timers parked in `slot`, due and long combined.
    pub fn slot_len(&self, slot: usize) -> usize {
        let Some(s) = self.slots.get(slot) else {
            return 0;
        };
        s.due.iter().chain(s.long.iter()).filter(|l| self.is_live(**l)).count()
    }

    fn ticks(&self, delay: i64) -> i64 {
        time_to_ticks(delay, self.tick)
    }

    /// Slot and rotation for a timer `ticks` ticks out.
    ///
    /// While the current slot is being expired the pointer is about to
    /// advance past it, so a full-revolution timer landing on it needs one
    /// rotation less, and a zero-tick timer goes to the next slot.
    fn position(&self, ticks: i64) -> (usize, i64) {
        let n = self.slots.len() as i64;
        if ticks == 0 && self.expiring {
            return ((self.current + 1) % self.slots.len(), -1);
        }
        let slot = ((self.current as i64 + ticks % n) % n) as usize;
        let mut rotation = ticks / n;
        if rotation == 0 {
            rotation = -1;
        } else if rotation > 0 && self.expiring && slot == self.current {
            rotation -= 1;
        }
        (slot, rotation)
    }

    fn link(&mut self, key: TimerKey) {
        let Some(t) = self.timers.get_mut(key) else {
            return;
        };
        t.link = t.link.wrapping_add(1);
        let entry = (key, t.link);
        if t.rotation < 0 {
            self.slots[t.slot].due.push_back(entry);
        } else {
            self.slots[t.slot].long.push(entry);
        }
    }

    fn is_live(&self, (key, link): Link) -> bool {
        self.timers
            .get(key)
            .map_or(false, |t| t.link == link && t.firing.is_none())
    }

    // ========================================================================
    // Tick protocol, driven by the event loop
    // ========================================================================

    /// Demote long timers in the current slot and enter the expiring state.
    pub fn begin_tick(&mut self) {
        let cur = self.current;
        let long = std::mem::take(&mut self.slots[cur].long);
        let mut keep = Vec::with_capacity(long.len());
        for entry in long {
            if !self.is_live(entry) {
                continue;
            }
            let Some(t) = self.timers.get_mut(entry.0) else {
                continue;
            };
            t.rotation -= 1;
            if t.rotation < 0 {
                self.slots[cur].due.push_back(entry);
            } else {
                keep.push(entry);
            }
        }
        self.slots[cur].long = keep;
        self.tick_budget = self.slots[cur].due.len();
        self.expiring = true;
    }

    /// Detach the next due timer of the current slot. Entries linked into
    /// the slot after `begin_tick` wait for its next visit.
    pub fn begin_fire(&mut self) -> Option<(TimerKey, TimerCallback)> {
        let cur = self.current;
        while self.tick_budget > 0 {
            self.tick_budget -= 1;
            let Some(entry) = self.slots[cur].due.pop_front() else {
                break;
            };
            if !self.is_live(entry) {
                continue;
            }
            let Some(t) = self.timers.get_mut(entry.0) else {
                continue;
            };
            let Some(callback) = t.callback.take() else {
                continue;
            };
            t.firing = Some(false);
            self.stats.fired += 1;
            return Some((entry.0, callback));
        }
        None
    }

    /// Settle a timer whose callback has returned. A cancelled or one-shot
    /// timer hands its callback back for the caller to drop.
    pub fn end_fire(&mut self, now: i64, key: TimerKey, callback: TimerCallback) -> Released {
        let Some(t) = self.timers.get(key) else {
            return callback.into();
        };
        let restarted = t.firing == Some(true);
        let interval = t.interval;
        let interval_ticks = t.interval_ticks;

        if !restarted && interval <= 0 {
            self.timers.remove(key);
            return callback.into();
        }

        let position = if restarted { None } else { Some(self.position(interval_ticks)) };
        if let Some(t) = self.timers.get_mut(key) {
            if let Some((slot, rotation)) = position {
                t.when = now + interval;
                t.slot = slot;
                t.rotation = rotation;
            }
            t.firing = None;
            t.callback = Some(callback);
        }
        self.link(key);
        Released::none()
    }

    /// Leave the expiring state and advance the pointer.
    pub fn end_tick(&mut self) {
        self.expiring = false;
        self.tick_budget = 0;
        self.current = (self.current + 1) % self.slots.len();
    }
}

impl TimerContainer for WheelCore {
    fn add(&mut self, now: i64, after: i64, interval: i64, callback: TimerCallback) -> Option<TimerKey> {
        if after < 0 || interval < 0 {
            return None;
        }
        let after_ticks = self.ticks(after);
        let interval_ticks = self.ticks(interval);
        let (slot, rotation) = self.position(after_ticks);
        let key = self.timers.insert(WheelTimer {
            when: now + after_ticks * self.tick,
            interval: interval_ticks * self.tick,
            interval_ticks,
            slot,
            rotation,
            link: 0,
            firing: None,
            callback: Some(callback),
        });
        self.link(key);
        self.stats.inserted += 1;
        Some(key)
    }

    fn cancel(&mut self, key: TimerKey) -> Option<Released> {
        let timer = self.timers.remove(key)?;
        self.stats.cancelled += 1;
        Some(timer.callback.into())
    }

    fn restart(&mut self, now: i64, key: TimerKey, after: i64, interval: i64) -> bool {
        if after < 0 || interval < 0 || !self.timers.contains(key) {
            return false;
        }
        let after_ticks = self.ticks(after);
        let interval_ticks = self.ticks(interval);
        let (slot, rotation) = self.position(after_ticks);
        let tick = self.tick;

        let Some(t) = self.timers.get_mut(key) else {
            return false;
        };
        t.when = now + after_ticks * tick;
        t.interval = interval_ticks * tick;
        t.interval_ticks = interval_ticks;
        t.slot = slot;
        t.rotation = rotation;
        let firing = t.firing.is_some();
        if firing {
            t.firing = Some(true);
        } else {
            self.link(key);
        }
        self.stats.restarted += 1;
        true
    }

    fn remaining_time(&self, _now: i64, key: TimerKey) -> Option<i64> {
        let t = self.timers.get(key)?;
        if t.firing == Some(false) {
            return Some(0);
        }
        let n = self.slots.len() as i64;
        let mut left = (t.slot as i64 - self.current as i64).rem_euclid(n);
        if t.rotation >= 0 {
            if t.slot == self.current && self.expiring {
                left += n;
            }
            left += t.rotation * n;
        }
        Some(left * self.tick)
    }

    fn deadline(&self, key: TimerKey) -> Option<i64> {
        self.timers.get(key).map(|t| t.when)
    }

    fn interval(&self, key: TimerKey) -> Option<i64> {
        self.timers.get(key).map(|t| t.interval)
    }

    fn len(&self) -> usize {
        self.timers.len()
    }

    fn stats(&self) -> TimerStats {
        self.stats
    }

    fn name(&self) -> &'static str {
        "wheel"
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a wheel owned by an event loop.
#[derive(Clone)]
pub struct TimeWheel {
    lp: Weak<LoopInner>,
    id: TimerKey,
}

impl TimeWheel {
    pub(crate) fn new(lp: Weak<LoopInner>, id: TimerKey) -> Self {
        Self { lp, id }
    }

    fn with<R>(&self, f: impl FnOnce(&mut WheelCore) -> R) -> Option<R> {
        let lp = self.lp.upgrade()?;
        let mut wheels = lp.wheels.borrow_mut();
        wheels.get_mut(self.id).map(f)
    }

    /// Add a timer `after` ms out, repeating every `interval` ms when
    /// positive. Both round up to whole ticks. `None` for negative values
    /// or a closed wheel.
    pub fn add_timer<F>(&self, after: i64, interval: i64, f: F) -> Option<TimerHandle>
    where
        F: FnMut(&EventLoop) + 'static,
    {
        let lp = self.lp.upgrade()?;
        let now = lp.now.get();
        let key = {
            let mut wheels = lp.wheels.borrow_mut();
            wheels.get_mut(self.id)?.add(now, after, interval, Box::new(f))?
        };
        Some(TimerHandle::new(self.lp.clone(), TimerKind::Wheel(self.id, key)))
    }

    /// Stop the driving tick and drop every timer on the wheel.
    /// Outstanding handles become no-ops.
    pub fn close(&self) {
        if let Some(lp) = self.lp.upgrade() {
            lp.close_wheel(self.id);
        }
    }

    pub fn is_open(&self) -> bool {
        self.with(|_| ()).is_some()
    }

    pub fn slot_count(&self) -> usize {
        self.with(|w| w.slot_count()).unwrap_or(0)
    }

    pub fn tick_interval(&self) -> i64 {
        self.with(|w| w.tick_interval()).unwrap_or(0)
    }

    pub fn current_slot(&self) -> usize {
        self.with(|w| w.current_slot()).unwrap_or(0)
    }

    pub fn timer_count(&self) -> usize {
        self.with(|w| w.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> TimerStats {
        self.with(|w| w.stats()).unwrap_or_default()
    }
}
