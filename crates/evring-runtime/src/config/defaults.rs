//! Library defaults for the runtime configuration
//!
//! Every value here can be overridden through `LoopConfig` /
//! `WorkerGroupConfig` builders or the matching `EVR_*` variable.

use evring_core::LoadBalanceStrategy;

/// Number of worker threads in a group
pub const WORKERS: usize = 4;

/// Upper bound accepted by `validate()`
pub const MAX_WORKERS: usize = 256;

/// Loop time resolution in ms; 0 refreshes the clock after every wait
pub const TIME_RESOLUTION_MS: i64 = 0;

/// Largest accepted time resolution
pub const MAX_TIME_RESOLUTION_MS: i64 = 1000;

/// Delay between token retries for workers on the lock strategy
pub const LOCK_RETRY_DELAY_MS: i64 = 10;

/// Strategy used when nothing is configured
pub const LOAD_BALANCE: LoadBalanceStrategy = LoadBalanceStrategy::Lock;

/// Slots on the lazily created idle-timer wheel
pub const IDLE_WHEEL_SLOTS: usize = 512;

/// Tick of the idle-timer wheel
pub const IDLE_WHEEL_TICK_MS: i64 = 1000;

/// Accepts per readiness callback before an acceptor honours `SuggestStop`
pub const MIN_ACCEPTS_PER_CALL: usize = 1;

/// Hard cap on accepts per readiness callback
pub const MAX_ACCEPTS_PER_CALL: usize = 64;

/// Initial epoll event buffer size
pub const POLLER_INITIAL_EVENTS: usize = 32;

/// How often `WorkerGroup::stop` polls for exited workers
pub const STOP_POLL_INTERVAL_MS: u64 = 5;
