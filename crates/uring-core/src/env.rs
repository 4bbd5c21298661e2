//! Environment variable helpers for configuration overrides.
//!
//! ```ignore
//! use uring_core::env::{env_get, env_get_bool, env_get_opt};
//!
//! let sq: u32 = env_get("URING_SQ_ENTRIES", 256);
//! let register: bool = env_get_bool("URING_REGISTER_BUFFERS", true);
//! let cq: Option<u32> = env_get_opt("URING_CQ_ENTRIES");
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag. Accepts "1", "true", "yes", "on" as true and
/// "0", "false", "no", "off" as false (case-insensitive); anything else
/// (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
