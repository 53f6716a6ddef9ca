//! # evring - event-driven I/O core
//!
//! One epoll reactor per thread, timers on a heap or a slotted wheel, and a
//! ring of worker threads passing a single accept token.
//!
//! ## Quick Start
//!
//! ```ignore
//! use evring::{EventLoop, LoopConfig};
//!
//! fn main() -> evring::NetResult<()> {
//!     evring::init_logging();
//!     let lp = EventLoop::new(LoopConfig::from_env())?;
//!
//!     lp.run_after(1000, 1000, |_| println!("tick"));
//!     let handle = lp.handle();
//!     std::thread::spawn(move || {
//!         std::thread::sleep(std::time::Duration::from_secs(5));
//!         handle.quit();
//!     });
//!     lp.run();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerGroup                           │
//! │     N threads, one accept token, lock / ring / metric       │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ EventLoop │      │ EventLoop │      │ EventLoop │
//!    │ Acceptor  │      │ Acceptor  │      │ Acceptor  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │  Poller (epoll)  Channels  TimerHeap  TimeWheels        │
//!    │  WakeupFd (eventfd)  Ticker (timerfd)  SignalService    │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use evring_core::{
    AcceptDecision,
    Interest,
    last_errno,
    LoadBalanceStrategy,
    NetError,
    NetResult,
    ParseStrategyError,
    PollOp,
    Readiness,
    TokenLock,
    POLLER_NAME,
};

// Re-export kprint macros for debug logging
pub use evring_core::{kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use evring_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use evring_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use evring_runtime::{
    current_worker_id,
    local_port,
    tcp_listener,
    wall_clock_ms,
    Acceptor,
    Channel,
    ConfigError,
    EventLoop,
    LoopConfig,
    LoopHandle,
    SignalHandler,
    SignalService,
    TimeWheel,
    TimerHandle,
    TimerStats,
    WorkerContext,
    WorkerGroup,
    WorkerGroupConfig,
    WorkerRef,
};

pub use evring_runtime::config::defaults;
