//! # evring-core
//!
//! Core types for the evring reactor.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The epoll reactor, timers and worker ring live in `evring-runtime`.
//!
//! ## Modules
//!
//! - `event` - Interest and readiness bit sets
//! - `policy` - Accept decision and load-balance strategy enums
//! - `token_lock` - Guard-less try-lock used as the accept token
//! - `error` - Error types
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod error;
pub mod event;
pub mod policy;
pub mod token_lock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use error::{last_errno, NetError, NetResult, PollOp};
pub use event::{Interest, Readiness};
pub use policy::{AcceptDecision, LoadBalanceStrategy, ParseStrategyError};
pub use token_lock::TokenLock;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Multiplexer backend name reported in startup logs
        pub const POLLER_NAME: &str = "epoll";
    } else {
        /// Multiplexer backend name reported in startup logs
        pub const POLLER_NAME: &str = "unsupported";
    }
}
