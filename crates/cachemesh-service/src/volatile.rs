use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Parse an environment variable, falling back to `default` when unset or
/// unparseable. An unparseable value is operator error worth a log line,
/// but never worth refusing to start.
pub fn envto<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(name, value = %raw, "unparseable environment variable, using default");
                default
            }
        },
        Err(_) => default,
    }
}

pub fn envto_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Process-wide tunables that may be updated while the node runs.
///
/// Each field is individually atomic: loads and stores never tear, but no
/// multi-field atomicity is promised. Constructed once after environment
/// parsing and never torn down.
#[derive(Debug)]
pub struct Volatiles {
    connect_timeout: AtomicU64,
    transfer_timeout: AtomicU64,
    peer_connect_timeout: AtomicU64,
    peer_transfer_timeout: AtomicU64,
    http_max_redirects: AtomicU32,
    maintenance_interval: AtomicU64,
    multicast_timestamp_skew: AtomicU64,
    stale_if_error: AtomicU64,
    // Cleanup high-water marks. Float-valued fractions are stored as bits.
    evict_lwm: AtomicU32,
    evict_target_fraction: AtomicU32,
    dc_maxmbytes: AtomicU64,
    dc_maxfiles: AtomicU64,
}

impl Volatiles {
    /// Read the initial values from the environment.
    pub fn from_env() -> Self {
        let connect = envto("Fs123ConnectTimeout", 20u64);
        let transfer = envto("Fs123TransferTimeout", 40u64);
        let maxmbytes = envto("Fs123CacheMaxMBytes", 100u64);
        Volatiles {
            connect_timeout: AtomicU64::new(connect),
            transfer_timeout: AtomicU64::new(transfer),
            // Peer timeouts default to the origin values; production
            // deployments usually tighten them well below.
            peer_connect_timeout: AtomicU64::new(envto("Fs123PeerConnectTimeout", connect)),
            peer_transfer_timeout: AtomicU64::new(envto("Fs123PeerTransferTimeout", transfer)),
            http_max_redirects: AtomicU32::new(envto("Fs123HttpMaxRedirects", 2u32)),
            maintenance_interval: AtomicU64::new(envto("Fs123MaintenanceInterval", 60u64)),
            multicast_timestamp_skew: AtomicU64::new(envto("Fs123MulticastTimestampSkew", 10u64)),
            stale_if_error: AtomicU64::new(envto("Fs123StaleIfError", 0u64)),
            evict_lwm: AtomicU32::new(envto("Fs123EvictLwm", 0.7f32).to_bits()),
            evict_target_fraction: AtomicU32::new(envto("Fs123EvictTargetFraction", 0.8f32).to_bits()),
            dc_maxmbytes: AtomicU64::new(maxmbytes),
            dc_maxfiles: AtomicU64::new(envto("Fs123CacheMaxFiles", maxmbytes * 1_000_000 / 16384)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.load(Ordering::Relaxed))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout.load(Ordering::Relaxed))
    }

    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout.load(Ordering::Relaxed))
    }

    pub fn peer_transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_transfer_timeout.load(Ordering::Relaxed))
    }

    pub fn http_max_redirects(&self) -> usize {
        self.http_max_redirects.load(Ordering::Relaxed) as usize
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval.load(Ordering::Relaxed).max(1))
    }

    /// Accepted control-message timestamp skew, in whole seconds.
    pub fn multicast_timestamp_skew(&self) -> u64 {
        self.multicast_timestamp_skew.load(Ordering::Relaxed)
    }

    pub fn stale_if_error(&self) -> u64 {
        self.stale_if_error.load(Ordering::Relaxed)
    }

    pub fn evict_lwm(&self) -> f32 {
        f32::from_bits(self.evict_lwm.load(Ordering::Relaxed))
    }

    pub fn evict_target_fraction(&self) -> f32 {
        f32::from_bits(self.evict_target_fraction.load(Ordering::Relaxed))
    }

    pub fn dc_maxbytes(&self) -> u64 {
        self.dc_maxmbytes.load(Ordering::Relaxed) * 1_000_000
    }

    pub fn dc_maxfiles(&self) -> u64 {
        self.dc_maxfiles.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envto_falls_back_on_unset() {
        assert_eq!(envto("CachemeshDefinitelyUnsetVariable", 7u64), 7);
    }

    #[test]
    fn peer_timeouts_default_to_origin_values() {
        let vols = Volatiles::from_env();
        assert_eq!(vols.peer_connect_timeout(), vols.connect_timeout());
        assert_eq!(vols.peer_transfer_timeout(), vols.transfer_timeout());
    }
}
