//! Environment variable utilities
//!
//! Typed lookups with defaults, used by the runtime config layer for the
//! `EVR_*` variables.
//!
//! # Usage
//!
//! ```ignore
//! use evring_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("EVR_WORKERS", 4);
//! let resolution: i64 = env_get("EVR_TIME_RESOLUTION_MS", 0);
//! let flush = env_get_bool("EVR_FLUSH_EPRINT", false);
//! ```
//!
//! A variable that is set but does not parse falls back to the default and
//! emits a warning, so a typo in a deployment script is visible in the log.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                crate::kwarn!("ignoring {}={:?}: not a valid value", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
///
/// `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__EVR_TEST_UNSET_VAR__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_trims_whitespace() {
        std::env::set_var("__EVR_TEST_TRIM__", " 17 ");
        let val: i64 = env_get("__EVR_TEST_TRIM__", 0);
        assert_eq!(val, 17);
        std::env::remove_var("__EVR_TEST_TRIM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__EVR_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__EVR_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__EVR_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__EVR_TEST_BOOL__", "ON");
        assert!(env_get_bool("__EVR_TEST_BOOL__", false));

        std::env::set_var("__EVR_TEST_BOOL__", "0");
        assert!(!env_get_bool("__EVR_TEST_BOOL__", true));

        std::env::set_var("__EVR_TEST_BOOL__", "garbage");
        assert!(!env_get_bool("__EVR_TEST_BOOL__", true));

        std::env::remove_var("__EVR_TEST_BOOL__");
        assert!(env_get_bool("__EVR_TEST_BOOL__", true));
    }

    #[test]
    fn test_env_get_opt_and_str() {
        let val: Option<u16> = env_get_opt("__EVR_TEST_UNSET_VAR__");
        assert!(val.is_none());
        assert_eq!(env_get_str("__EVR_TEST_UNSET_VAR__", "lock"), "lock");
        assert!(!env_is_set("__EVR_TEST_UNSET_VAR__"));
        assert!(env_is_set("PATH"));
    }
}
