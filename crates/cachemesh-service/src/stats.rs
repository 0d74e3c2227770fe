use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($vis:vis struct $name:ident / $snap:ident { $($field:ident),* $(,)? }) => {
        /// Process-lifetime counters. Increments are relaxed atomics;
        /// reads are unsynchronized snapshots.
        #[derive(Debug)]
        $vis struct $name {
            $(pub $field: AtomicU64,)*
        }

        #[derive(Clone, Copy, Debug, Serialize)]
        $vis struct $snap {
            $(pub $field: u64,)*
        }

        impl $name {
            pub const fn new() -> Self {
                $name { $($field: AtomicU64::new(0),)* }
            }

            pub fn snapshot(&self) -> $snap {
                $snap { $($field: self.$field.load(Ordering::Relaxed),)* }
            }
        }
    };
}

counters! {
    pub struct DistribStats / DistribStatsSnapshot {
        presents_sent,
        presents_recvd,
        presents_checked,
        absents_sent,
        absents_recvd,
        self_absents_recvd,
        discourages_sent,
        discourages_recvd,
        self_discourages_recvd,
        peer_errors,
        delayed_packets,
        auth_failures,
        recv_errors,
        server_refreshes,
        server_refresh_not_modified,
        server_refresh_bytes,
    }
}

counters! {
    pub struct CacheStats / CacheStatsSnapshot {
        accesses,
        memory_hits,
        file_hits,
        computations,
        stale_served,
        stale_if_error_served,
        refreshes_spawned,
        lazy_limit_hit,
    }
}

pub static DISTRIB_STATS: DistribStats = DistribStats::new();
pub static CACHE_STATS: CacheStats = CacheStats::new();

#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatsSnapshot {
    pub distrib: DistribStatsSnapshot,
    pub cache: CacheStatsSnapshot,
}

/// One read-only snapshot of every counter in the process.
pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        distrib: DISTRIB_STATS.snapshot(),
        cache: CACHE_STATS.snapshot(),
    }
}

/// Relaxed increment, the only write path for statistics.
#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Relaxed add for byte counters.
#[inline]
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let before = DISTRIB_STATS.snapshot().presents_sent;
        bump(&DISTRIB_STATS.presents_sent);
        bump(&DISTRIB_STATS.presents_sent);
        assert!(DISTRIB_STATS.snapshot().presents_sent >= before + 2);
    }
}
