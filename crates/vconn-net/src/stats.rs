//! Additive global counters
//!
//! Purely observational, except that `connections_open` also feeds the
//! connect throttle gate and must stay balanced across thread migration.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct NetStats {
    pub read_bytes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub calls_to_read: AtomicU64,
    pub calls_to_read_nodata: AtomicU64,
    pub calls_to_write: AtomicU64,
    pub calls_to_write_nodata: AtomicU64,
    connections_open: AtomicI64,
}

pub static NET_STATS: NetStats = NetStats::new();

impl NetStats {
    const fn new() -> NetStats {
        NetStats {
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            calls_to_read: AtomicU64::new(0),
            calls_to_read_nodata: AtomicU64::new(0),
            calls_to_write: AtomicU64::new(0),
            calls_to_write_nodata: AtomicU64::new(0),
            connections_open: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: i64) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn connections_open(&self) -> i64 {
        self.connections_open.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_count_balance() {
        let before = NET_STATS.connections_open();
        NET_STATS.connection_opened();
        NET_STATS.connection_opened();
        NET_STATS.connection_closed();
        assert_eq!(NET_STATS.connections_open(), before + 1);
        NET_STATS.connection_closed();
        assert_eq!(NET_STATS.connections_open(), before);
    }
}
