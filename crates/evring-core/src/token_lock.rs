//! Accept-token lock
//!
//! The lock-based load-balance strategy needs a mutex that one worker takes
//! with a non-blocking try, keeps across many loop iterations while it owns
//! the listening sockets, and releases later from the same thread. A guard
//! type cannot live that long inside the worker, so this is a bare flag with
//! explicit `try_lock` / `unlock`. Nobody ever spins or blocks on it: losers
//! simply retry on their next loop iteration.

use core::sync::atomic::{AtomicBool, Ordering};

/// Non-blocking, guard-less mutual exclusion flag.
#[derive(Debug, Default)]
pub struct TokenLock {
    locked: AtomicBool,
}

impl TokenLock {
    #[inline]
    pub const fn new() -> Self {
        TokenLock { locked: AtomicBool::new(false) }
    }

    /// Try to take the lock. Returns `true` on success.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock. Must only be called by the current holder.
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Check if locked (for debugging)
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
