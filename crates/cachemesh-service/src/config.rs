use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the node.
    pub level: String,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: "info".into(),
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Fine-tuning for the reply cache.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheTuning {
    /// Entry budget for the in-memory coalescing cache.
    pub in_memory_capacity: u64,

    /// How long a failed refresh is remembered before a retry. Keeps one
    /// flapping origin from being hammered by coalesced waiters.
    #[serde(with = "humantime_serde")]
    pub retry_errors_after: Duration,

    /// Maximum number of concurrent deduplicated background refreshes
    /// spawned by stale-while-revalidate handling.
    pub max_lazy_refreshes: isize,
}

impl Default for CacheTuning {
    fn default() -> Self {
        CacheTuning {
            in_memory_capacity: 100_000,
            retry_errors_after: Duration::from_secs(5),
            max_lazy_refreshes: 50,
        }
    }
}

/// Node configuration, loaded from a YAML file.
///
/// The volatile runtime tunables (timeouts, skew windows, eviction marks)
/// deliberately live in [`crate::volatile::Volatiles`] and come from the
/// environment instead; they predate this file and are part of the
/// operational surface.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port the embedded peer server binds to. Port 0 picks an
    /// ephemeral port, which is reported in the logs and used in our
    /// Present broadcasts.
    pub bind: String,

    /// Base URL of the origin export server.
    pub origin_url: String,

    /// Which directory to use for the reply cache. Default is not to
    /// persist replies.
    pub cache_dir: Option<PathBuf>,

    /// Deployment scope string. Control messages from a different scope
    /// are ignored, which partitions otherwise-overlapping multicast
    /// deployments.
    pub scope: String,

    /// `host:port` of the multicast group or unicast repeater carrying
    /// peer-discovery traffic. Unset means single-node operation.
    ///
    /// Defaults from the `Fs123DistribCacheReflector` environment
    /// variable.
    pub reflector: Option<String>,

    /// Enable `IP_MULTICAST_LOOP` so several peers on one host hear each
    /// other. Off in production; the loopback chatter is pure noise there.
    ///
    /// Defaults from `Fs123DistribCacheMulticastLoop`.
    pub multicast_loop: bool,

    /// Path to the shared-key file for control-message authentication.
    /// Without it, control messages go out unauthenticated with an
    /// all-zero tag.
    pub secret_file: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Fine-tune reply cache behavior.
    pub cache: CacheTuning,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:0".to_owned(),
            origin_url: String::new(),
            cache_dir: None,
            scope: "default".to_owned(),
            reflector: std::env::var("Fs123DistribCacheReflector").ok(),
            multicast_loop: crate::volatile::envto_bool("Fs123DistribCacheMulticastLoop", false),
            secret_file: None,
            logging: Logging::default(),
            cache: CacheTuning::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_tuning() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache.retry_errors_after, Duration::from_secs(5));

        let yaml = r#"
            cache:
              retry_errors_after: 1m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.retry_errors_after, Duration::from_secs(60));
        assert_eq!(cfg.cache.max_lazy_refreshes, 50);
    }

    #[test]
    fn test_scope_and_origin() {
        let yaml = r#"
            origin_url: http://origin.example:8080
            scope: blue
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.origin_url, "http://origin.example:8080");
        assert_eq!(cfg.scope, "blue");
        assert_eq!(cfg.bind, "127.0.0.1:0");
    }

    #[test]
    fn test_unknown_fields() {
        let yaml = r#"
            not_a_real_section:
              x: 1
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_ok());
    }

    #[test]
    fn test_empty_file() {
        assert!(Config::from_reader("".as_bytes()).is_err());
    }
}
