//! Reactor configuration

use vconn_core::env::env_get;

/// Tunables for one reactor thread.
///
/// Defaults come from the environment so deployments can adjust without a
/// rebuild:
///
/// - `VCONN_POLL_TIMEOUT_MS` - poll wait bound (default 10)
/// - `VCONN_COP_INTERVAL_MS` - inactivity-cop scan period (default 1000)
/// - `VCONN_RETRY_MS` - lock-miss retry delay (default 10)
/// - `VCONN_MAX_CONNECTIONS` - connection throttle, 0 = unlimited
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Max events fetched per poll call.
    pub max_poll_events: usize,
    /// Upper bound on one poll wait, in milliseconds.
    pub poll_timeout_ms: i32,
    /// How often the inactivity cop scans the open list.
    pub cop_interval_ms: u64,
    /// Delay before retrying work deferred by a failed try-lock.
    pub net_retry_delay_ms: u64,
    /// How many freed connections the slab keeps for reuse.
    pub slab_capacity: usize,
    /// Process-wide connection cap enforced by the connect gate. 0 disables.
    pub max_connections: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_poll_events: 256,
            poll_timeout_ms: env_get("VCONN_POLL_TIMEOUT_MS", 10),
            cop_interval_ms: env_get("VCONN_COP_INTERVAL_MS", 1000),
            net_retry_delay_ms: env_get("VCONN_RETRY_MS", 10),
            slab_capacity: 256,
            max_connections: env_get("VCONN_MAX_CONNECTIONS", 0),
        }
    }
}

impl ReactorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_poll_events == 0 {
            return Err("max_poll_events must be positive".into());
        }
        if self.poll_timeout_ms < 0 {
            return Err("poll_timeout_ms must be non-negative".into());
        }
        if self.net_retry_delay_ms == 0 {
            return Err("net_retry_delay_ms must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(ReactorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_retry() {
        let cfg = ReactorConfig {
            net_retry_delay_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
