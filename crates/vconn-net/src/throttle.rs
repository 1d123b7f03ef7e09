//! Connection throttle gate
//!
//! A process-wide cap on simultaneously open connections, checked before
//! every outbound connect. Refused connects surface to the user as
//! `OPEN_FAILED` with `-ENET_THROTTLING`.

use crate::stats::NET_STATS;
use std::sync::atomic::{AtomicI64, Ordering};
use vconn_core::kwarn;

/// Minimum gap between throttle warnings, in nanoseconds.
const WARN_INTERVAL_NS: i64 = 5_000_000_000;

static LAST_WARN_AT: AtomicI64 = AtomicI64::new(0);

/// Returns true when a new connection must be refused.
#[inline]
pub fn check_net_throttle(max_connections: usize) -> bool {
    max_connections != 0 && NET_STATS.connections_open() >= max_connections as i64
}

/// Log the refusal, rate-limited so a connect storm cannot flood stderr.
pub fn check_throttle_warning(now_ns: i64) {
    let last = LAST_WARN_AT.load(Ordering::Relaxed);
    if now_ns - last < WARN_INTERVAL_NS {
        return;
    }
    if LAST_WARN_AT
        .compare_exchange(last, now_ns, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        kwarn!(
            "net connections throttled, currently open: {}",
            NET_STATS.connections_open()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_cap_never_throttles() {
        assert!(!check_net_throttle(0));
    }

    #[test]
    fn test_cap_enforced() {
        NET_STATS.connection_opened();
        // A cap of 1 with at least one open connection must refuse.
        assert!(check_net_throttle(1));
        // A cap far above the current count must admit.
        let open = NET_STATS.connections_open();
        assert!(!check_net_throttle((open + 1000) as usize));
        NET_STATS.connection_closed();
    }
}
