//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use structopt::StructOpt;

use cachemesh_service::config::Config;

use crate::healthcheck;
use crate::logging;
use crate::server;

fn get_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Cachemesh commands.
#[derive(StructOpt)]
#[structopt(bin_name = "cachemesh")]
enum Command {
    /// Run the cache node.
    #[structopt(name = "run")]
    Run,

    /// Check whether a running node answers on its peer server.
    #[structopt(name = "healthcheck")]
    Healthcheck {
        /// Address to check instead of the configured bind address.
        #[structopt(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[structopt(long, default_value = "30")]
        timeout: u64,
    },

    /// Remove expired records from the local reply cache and trim it to
    /// its configured size caps.
    #[structopt(name = "cleanup")]
    Cleanup,
}

/// Command line interface parser.
#[derive(StructOpt)]
#[structopt(version = get_crate_version())]
struct Cli {
    /// Path to your configuration file.
    #[structopt(long = "config", short = "c", global(true), value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

impl Cli {
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::from_args();
    let config = Config::get(cli.config()).context("failed loading config")?;

    logging::init_logging(&config);

    match cli.command {
        Command::Run => server::run(config),
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout),
        Command::Cleanup => server::cleanup(config),
    }
}
