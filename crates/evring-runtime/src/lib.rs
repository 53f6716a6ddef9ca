//! # evring-runtime
//!
//! Linux implementation of the evring reactor.
//!
//! This crate provides:
//! - Epoll multiplexer and fd channels with edge/level triggering
//! - Single-threaded event loop with a cross-thread wakeup queue
//! - Timer heap and slotted time wheels driven by the loop
//! - Signal delivery onto loops through a dedicated signal thread
//! - Accept bursts and an accept-token ring of worker threads

pub mod acceptor;
pub mod channel;
pub mod config;
pub mod event_loop;
pub mod notifier;
pub mod poller;
pub mod signal;
pub mod ticker;
pub mod timer;
pub mod worker;
pub mod worker_group;

// Re-exports
pub use acceptor::{local_port, tcp_listener, Acceptor, NewConnection};
pub use channel::{Channel, ChannelCore, Handler, WeakChannel};
pub use config::{ConfigError, LoopConfig, WorkerGroupConfig};
pub use event_loop::{wall_clock_ms, EventLoop, Functor, LoopHandle};
pub use signal::{check_signal, signal_name, SignalCallback, SignalHandler, SignalService};
pub use timer::{
    time_to_ticks, Released, TimeWheel, TimerCallback, TimerContainer, TimerHandle, TimerHeap,
    TimerStats,
};
pub use worker::{current_worker_id, LoadMetric, WorkerContext, WorkerRef};
pub use worker_group::WorkerGroup;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("evring-runtime requires Linux (epoll, eventfd, timerfd)");
    }
}
