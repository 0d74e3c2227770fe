use std::env;

use tracing_subscriber::fmt::Layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cachemesh_service::config::{Config, LogFormat};

fn get_rust_log(level: &str) -> String {
    format!("{level},hyper=warn,reqwest=warn")
}

/// Initializes logging for the node.
///
/// This considers the `RUST_LOG` environment variable and defaults it to
/// the level specified in the configuration. Additionally, this toggles
/// `RUST_BACKTRACE` based on the `enable_backtraces` config value.
pub fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "1");
    }

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", get_rust_log(&config.logging.level));
    }

    let filter = EnvFilter::from_default_env();
    let subscriber = FmtSubscriber::new().with(filter);
    let format = Layer::new();
    match (config.logging.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => {
            tracing::subscriber::set_global_default(subscriber.with(format.pretty()))
        }
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            tracing::subscriber::set_global_default(subscriber.with(format.compact()))
        }
        (LogFormat::Json, _) => {
            tracing::subscriber::set_global_default(subscriber.with(format.json()))
        }
    }
    .expect("setting global default subscriber");
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= tracing::level_filters::LevelFilter::current()
    {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
