//! Runtime configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls made by the application
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use evring_runtime::config::{LoopConfig, WorkerGroupConfig};
//! use evring_core::LoadBalanceStrategy;
//!
//! let config = WorkerGroupConfig::from_env()
//!     .workers(8)
//!     .strategy(LoadBalanceStrategy::MetricSmaller)
//!     .loop_config(LoopConfig::new().time_resolution_ms(10));
//! config.validate()?;
//! ```

pub mod defaults;

use evring_core::env::{env_get, env_get_opt, env_get_str};
use evring_core::{kwarn, LoadBalanceStrategy};

/// Per-loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Clock refresh period in ms; 0 disables the ticker
    pub time_resolution_ms: i64,
    /// Slots on the idle-timer wheel
    pub idle_wheel_slots: usize,
    /// Tick of the idle-timer wheel in ms
    pub idle_wheel_tick_ms: i64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopConfig {
    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            time_resolution_ms: defaults::TIME_RESOLUTION_MS,
            idle_wheel_slots: defaults::IDLE_WHEEL_SLOTS,
            idle_wheel_tick_ms: defaults::IDLE_WHEEL_TICK_MS,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// - `EVR_TIME_RESOLUTION_MS` - clock refresh period (0 = off)
    /// - `EVR_WHEEL_SLOTS` - idle wheel slot count
    /// - `EVR_WHEEL_TICK_MS` - idle wheel tick
    pub fn from_env() -> Self {
        Self {
            time_resolution_ms: env_get("EVR_TIME_RESOLUTION_MS", defaults::TIME_RESOLUTION_MS),
            idle_wheel_slots: env_get("EVR_WHEEL_SLOTS", defaults::IDLE_WHEEL_SLOTS),
            idle_wheel_tick_ms: env_get("EVR_WHEEL_TICK_MS", defaults::IDLE_WHEEL_TICK_MS),
        }
    }

    // Builder methods

    pub fn time_resolution_ms(mut self, ms: i64) -> Self {
        self.time_resolution_ms = ms;
        self
    }

    pub fn idle_wheel_slots(mut self, slots: usize) -> Self {
        self.idle_wheel_slots = slots;
        self
    }

    pub fn idle_wheel_tick_ms(mut self, ms: i64) -> Self {
        self.idle_wheel_tick_ms = ms;
        self
    }

    /// Resolution actually applied by the loop: negative becomes 0 and
    /// anything above the maximum is capped.
    pub fn effective_time_resolution(&self) -> i64 {
        self.time_resolution_ms.clamp(0, defaults::MAX_TIME_RESOLUTION_MS)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_resolution_ms < 0 {
            return Err(ConfigError::InvalidValue("time_resolution_ms must be >= 0"));
        }
        if self.time_resolution_ms > defaults::MAX_TIME_RESOLUTION_MS {
            return Err(ConfigError::InvalidValue("time_resolution_ms must be <= 1000"));
        }
        if self.idle_wheel_slots == 0 {
            return Err(ConfigError::InvalidValue("idle_wheel_slots must be > 0"));
        }
        if self.idle_wheel_tick_ms <= 0 {
            return Err(ConfigError::InvalidValue("idle_wheel_tick_ms must be > 0"));
        }
        Ok(())
    }
}

/// Settings for a ring of workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerGroupConfig {
    /// Number of worker threads
    pub workers: usize,
    /// How the accept token moves
    pub strategy: LoadBalanceStrategy,
    /// Retry delay for token-less workers on the lock strategy
    pub lock_retry_delay_ms: i64,
    /// Settings applied to every worker's loop
    pub loop_config: LoopConfig,
}

impl Default for WorkerGroupConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerGroupConfig {
    pub fn new() -> Self {
        Self {
            workers: defaults::WORKERS,
            strategy: defaults::LOAD_BALANCE,
            lock_retry_delay_ms: defaults::LOCK_RETRY_DELAY_MS,
            loop_config: LoopConfig::new(),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// - `EVR_WORKERS` - number of workers
    /// - `EVR_LOAD_BALANCE` - `lock`, `round-robin`, `smaller`, `larger`
    /// - `EVR_LOCK_RETRY_DELAY_MS` - lock strategy retry delay
    /// - plus everything `LoopConfig::from_env()` reads
    pub fn from_env() -> Self {
        let strategy = match env_get_opt::<LoadBalanceStrategy>("EVR_LOAD_BALANCE") {
            Some(s) => s,
            None => {
                let raw = env_get_str("EVR_LOAD_BALANCE", "");
                if !raw.is_empty() {
                    kwarn!("ignoring EVR_LOAD_BALANCE={:?}, using {}", raw, defaults::LOAD_BALANCE);
                }
                defaults::LOAD_BALANCE
            }
        };
        Self {
            workers: env_get("EVR_WORKERS", defaults::WORKERS),
            strategy,
            lock_retry_delay_ms: env_get("EVR_LOCK_RETRY_DELAY_MS", defaults::LOCK_RETRY_DELAY_MS),
            loop_config: LoopConfig::from_env(),
        }
    }

    // Builder methods

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn lock_retry_delay_ms(mut self, ms: i64) -> Self {
        self.lock_retry_delay_ms = ms;
        self
    }

    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue("workers must be > 0"));
        }
        if self.workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("workers must be <= 256"));
        }
        if self.lock_retry_delay_ms <= 0 {
            return Err(ConfigError::InvalidValue("lock_retry_delay_ms must be > 0"));
        }
        self.loop_config.validate()
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("evring configuration:");
        eprintln!("  workers:              {}", self.workers);
        eprintln!("  strategy:             {}", self.strategy);
        eprintln!("  lock_retry_delay_ms:  {}", self.lock_retry_delay_ms);
        eprintln!("  time_resolution_ms:   {}", self.loop_config.time_resolution_ms);
        eprintln!("  idle_wheel_slots:     {}", self.loop_config.idle_wheel_slots);
        eprintln!("  idle_wheel_tick_ms:   {}", self.loop_config.idle_wheel_tick_ms);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
