//! Deadline-ordered timer container
//!
//! Pending timers sit in a `BTreeMap` keyed by `(deadline, seq)`. The
//! sequence number makes the map a stable multimap: equal deadlines fire in
//! insertion order.
//!
//! An expiry pass is bracketed by [`TimerHeap::begin_pass`]; only entries
//! inserted before the pass started are eligible in it. A repeating timer
//! re-inserted after firing, or one added from inside a callback with a
//! deadline that is already due, waits for the next pass, so short intervals
//! cannot starve the rest of the queue.

use std::collections::BTreeMap;

use super::{Released, TimerCallback, TimerContainer, TimerKey, TimerSlab, TimerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeapState {
    /// In the map under this sequence number
    Pending(u64),
    /// Callback is running; `restarted` means a restart happened during it
    Firing { restarted: bool },
}

struct HeapTimer {
    when: i64,
    interval: i64,
    state: HeapState,
    callback: Option<TimerCallback>,
}

pub struct TimerHeap {
    timers: TimerSlab<HeapTimer>,
    queue: BTreeMap<(i64, u64), TimerKey>,
    next_seq: u64,
    pass_limit: u64,
    stats: TimerStats,
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            timers: TimerSlab::new(),
            queue: BTreeMap::new(),
            next_seq: 0,
            pass_limit: u64::MAX,
            stats: TimerStats::default(),
        }
    }

    fn enqueue(&mut self, key: TimerKey, when: i64) -> HeapState {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((when, seq), key);
        HeapState::Pending(seq)
    }

    /// Add a timer due at the absolute time `when`.
    pub fn add_at(&mut self, when: i64, interval: i64, callback: TimerCallback) -> TimerKey {
        let interval = interval.max(0);
        let key = self.timers.insert(HeapTimer {
            when,
            interval,
            state: HeapState::Firing { restarted: false },
            callback: Some(callback),
        });
        let state = self.enqueue(key, when);
        if let Some(t) = self.timers.get_mut(key) {
            t.state = state;
        }
        self.stats.inserted += 1;
        key
    }

    /// Milliseconds until the earliest deadline: `-1` when empty, never
    /// negative otherwise.
    pub fn earliest_timeout(&self, now: i64) -> i64 {
        match self.queue.keys().next() {
            Some(&(when, _)) => (when - now).max(0),
            None => -1,
        }
    }

    /// Earliest pending deadline
    pub fn earliest_deadline(&self) -> Option<i64> {
        self.queue.keys().next().map(|&(when, _)| when)
    }

    // ========================================================================
    // Expiry protocol, driven by the event loop
    // ========================================================================

    /// Start an expiry pass. Entries inserted from now on are not eligible
    /// until the next pass.
    pub fn begin_pass(&mut self) {
        self.pass_limit = self.next_seq;
    }

    pub fn end_pass(&mut self) {
        self.pass_limit = u64::MAX;
    }

    /// Detach the earliest eligible due timer and hand out its callback.
    pub fn begin_fire(&mut self, now: i64) -> Option<(TimerKey, TimerCallback)> {
        let limit = self.pass_limit;
        let (&slot, &key) = self
            .queue
            .range(..=(now, u64::MAX))
            .find(|entry| (entry.0).1 < limit)?;
        self.queue.remove(&slot);

        let timer = self.timers.get_mut(key)?;
        timer.state = HeapState::Firing { restarted: false };
        let callback = timer.callback.take()?;
        self.stats.fired += 1;
        Some((key, callback))
    }

    /// Settle a timer whose callback has returned. A cancelled or one-shot
    /// timer hands its callback back for the caller to drop.
    pub fn end_fire(&mut self, now: i64, key: TimerKey, callback: TimerCallback) -> Released {
        let Some(timer) = self.timers.get_mut(key) else {
            // Cancelled while firing
            return callback.into();
        };
        let when = match timer.state {
            HeapState::Firing { restarted: true } => timer.when,
            HeapState::Firing { restarted: false } if timer.interval > 0 => now + timer.interval,
            _ => {
                self.timers.remove(key);
                return callback.into();
            }
        };
        timer.when = when;
        timer.callback = Some(callback);
        let state = self.enqueue(key, when);
        if let Some(t) = self.timers.get_mut(key) {
            t.state = state;
        }
        Released::none()
    }
}

impl TimerContainer for TimerHeap {
    fn add(&mut self, now: i64, after: i64, interval: i64, callback: TimerCallback) -> Option<TimerKey> {
        if after < 0 || interval < 0 {
            return None;
        }
        Some(self.add_at(now + after, interval, callback))
    }

    fn cancel(&mut self, key: TimerKey) -> Option<Released> {
        let timer = self.timers.get(key)?;
        if let HeapState::Pending(seq) = timer.state {
            self.queue.remove(&(timer.when, seq));
        }
        let timer = self.timers.remove(key)?;
        self.stats.cancelled += 1;
        Some(timer.callback.into())
    }

    fn restart(&mut self, now: i64, key: TimerKey, after: i64, interval: i64) -> bool {
        if after < 0 || interval < 0 {
            return false;
        }
        let Some(timer) = self.timers.get_mut(key) else {
            return false;
        };
        let old_when = timer.when;
        timer.when = now + after;
        timer.interval = interval;
        match timer.state {
            HeapState::Firing { .. } => {
                timer.state = HeapState::Firing { restarted: true };
            }
            HeapState::Pending(seq) => {
                let when = timer.when;
                self.queue.remove(&(old_when, seq));
                let state = self.enqueue(key, when);
                if let Some(t) = self.timers.get_mut(key) {
                    t.state = state;
                }
            }
        }
        self.stats.restarted += 1;
        true
    }

    fn remaining_time(&self, now: i64, key: TimerKey) -> Option<i64> {
        let timer = self.timers.get(key)?;
        match timer.state {
            HeapState::Firing { restarted: false } => Some(0),
            _ => Some((timer.when - now).max(0)),
        }
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
        "heap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::event_loop::EventLoop;
    use crate::timer::TimerHandle;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    /// Drive one pass by hand, recording fire order through `order`.
    fn expire(heap: &mut TimerHeap, lp: &EventLoop, now: i64) {
        heap.begin_pass();
        while let Some((key, mut cb)) = heap.begin_fire(now) {
            cb(lp);
            drop(heap.end_fire(now, key, cb));
        }
        heap.end_pass();
    }

    fn recorder(order: &Rc<RefCell<Vec<i64>>>, tag: i64) -> TimerCallback {
        let order = Rc::clone(order);
        Box::new(move |_| order.borrow_mut().push(tag))
    }

    #[test]
    fn test_fires_in_deadline_order_and_never_early() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let mut heap = TimerHeap::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for when in [50, 10, 30, 10, 70, 20, 60] {
            heap.add_at(when, 0, recorder(&order, when));
        }

        expire(&mut heap, &lp, 5);
        assert!(order.borrow().is_empty());

        expire(&mut heap, &lp, 30);
        assert_eq!(*order.borrow(), vec![10, 10, 20, 30]);

        expire(&mut heap, &lp, 100);
        assert_eq!(*order.borrow(), vec![10, 10, 20, 30, 50, 60, 70]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_generated_deadlines_fire_in_order_never_early() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move |bound: i64| -> i64 {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((seed >> 33) % bound as u64) as i64
        };

        for round in 0..50 {
            let mut heap = TimerHeap::new();
            // (deadline, time it fired at)
            let fired: Rc<RefCell<Vec<(i64, i64)>>> = Rc::new(RefCell::new(Vec::new()));
            let clock = Rc::new(Cell::new(0i64));
            let count = 1 + next(64) as usize;
            for _ in 0..count {
                let when = next(200);
                let f = Rc::clone(&fired);
                let c = Rc::clone(&clock);
                heap.add_at(when, 0, Box::new(move |_| f.borrow_mut().push((when, c.get()))));
            }

            let mut now = 0;
            while !heap.is_empty() {
                now += 1 + next(25);
                clock.set(now);
                expire(&mut heap, &lp, now);
                if let Some(left) = heap.earliest_deadline() {
                    assert!(left > now, "round {}: {} still queued at {}", round, left, now);
                }
            }

            let fired = fired.borrow();
            assert_eq!(fired.len(), count, "round {}", round);
            for pair in fired.windows(2) {
                assert!(pair[0].0 <= pair[1].0, "round {}: {:?} out of order", round, pair);
            }
            for &(when, at) in fired.iter() {
                assert!(at >= when, "round {}: due {} fired at {}", round, when, at);
            }
        }
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let mut heap = TimerHeap::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..5 {
            heap.add_at(100, 0, recorder(&order, tag));
        }
        expire(&mut heap, &lp, 100);
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_repeat_reinserted_after_pass() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let mut heap = TimerHeap::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let key = heap.add_at(0, 10, recorder(&order, 1));

        expire(&mut heap, &lp, 0);
        assert_eq!(order.borrow().len(), 1);
        assert_eq!(heap.deadline(key), Some(10));
        assert_eq!(heap.remaining_time(3, key), Some(7));

        // Late by three intervals: still one fire per pass.
        expire(&mut heap, &lp, 40);
        assert_eq!(order.borrow().len(), 2);
        assert_eq!(heap.deadline(key), Some(50));
    }

    #[test]
    fn test_cancel_pending_and_stale() {
        let mut heap = TimerHeap::new();
        let a = heap.add_at(10, 0, noop());
        let b = heap.add_at(20, 0, noop());
        assert!(heap.cancel(a).is_some_and(|r| r.holds_callback()));
        assert!(heap.cancel(a).is_none());
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.earliest_deadline(), Some(20));
        assert_eq!(heap.earliest_timeout(5), 15);
        assert_eq!(heap.earliest_timeout(25), 0);
        assert!(heap.cancel(b).is_some());
        assert_eq!(heap.earliest_timeout(0), -1);
        assert_eq!(heap.stats().cancelled, 2);
    }

    #[test]
    fn test_restart_ignores_negative() {
        let mut heap = TimerHeap::new();
        let a = heap.add_at(10, 0, noop());
        assert!(!heap.restart(0, a, -1, 0));
        assert!(!heap.restart(0, a, 5, -1));
        assert_eq!(heap.deadline(a), Some(10));
        assert!(heap.restart(100, a, 5, 7));
        assert_eq!(heap.deadline(a), Some(105));
        assert_eq!(heap.interval(a), Some(7));
        assert_eq!(heap.earliest_deadline(), Some(105));
        assert!(heap.add(0, -1, 0, noop()).is_none());
    }

    /// Cancels a sibling timer when dropped.
    struct CancelOnDrop(TimerHandle);

    impl Drop for CancelOnDrop {
        fn drop(&mut self) {
            self.0.cancel();
        }
    }

    #[test]
    fn test_fired_one_shot_releases_callback_after_borrow() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let sibling = lp.run_after(10_000, 0, |_| {}).unwrap();
        let guard = CancelOnDrop(sibling.clone());
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        lp.run_after(0, 0, move |_| {
            let _keep = &guard;
            f.set(true);
        })
        .unwrap();

        lp.wait_and_process(0, None);
        assert!(fired.get());
        assert!(!sibling.is_pending());
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn test_cancel_releases_callback_after_borrow() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let sibling = lp.run_after(10_000, 0, |_| {}).unwrap();
        let guard = CancelOnDrop(sibling.clone());
        let timer = lp
            .run_after(10_000, 0, move |_| {
                let _keep = &guard;
            })
            .unwrap();

        assert!(timer.cancel());
        assert!(!sibling.is_pending());
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn test_self_cancel_releases_callback_after_borrow() {
        let lp = EventLoop::new(LoopConfig::new()).unwrap();
        let sibling = lp.run_after(10_000, 0, |_| {}).unwrap();
        let guard = CancelOnDrop(sibling.clone());
        let slot: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
        let s = Rc::clone(&slot);
        let timer = lp
            .run_after(0, 5, move |_| {
                let _keep = &guard;
                if let Some(me) = s.borrow().as_ref() {
                    assert!(me.cancel());
                }
            })
            .unwrap();
        *slot.borrow_mut() = Some(timer);

        lp.wait_and_process(0, None);
        assert!(!sibling.is_pending());
        assert_eq!(lp.timer_count(), 0);
    }
}
