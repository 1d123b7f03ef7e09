//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return the default.
///
/// Works with any type that implements `FromStr`.
///
/// # Examples
///
/// ```ignore
/// let cap: usize = env_get("VCONN_MAX_CONNECTIONS", 0);
/// let delay: u64 = env_get("VCONN_RETRY_MS", 10);
/// ```
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: u64 = env_get("VCONN_TEST_UNSET_VARIABLE", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_env_get_parsed() {
        std::env::set_var("VCONN_TEST_PARSED", "17");
        let v: u64 = env_get("VCONN_TEST_PARSED", 0);
        assert_eq!(v, 17);
        std::env::remove_var("VCONN_TEST_PARSED");
    }
}
