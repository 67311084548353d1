use std::{io::IsTerminal, path::PathBuf};

use anyhow::{Error, Result};
use clap::{arg, Parser, Subcommand};
use coffer_renter::RenterConfig;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "coffer")]
#[command(bin_name = "coffer")]
pub struct Cli {
    #[arg(long, env)]
    pub no_ui: bool,

    /// Where the renter, its wallet, the local hosts and the local chain
    /// keep their state.
    #[arg(long, env = "COFFER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Download rate limit in bytes per second, 0 for unlimited.
    #[arg(long, env = "COFFER_RATE_LIMIT_DOWN", default_value = "0")]
    pub rate_limit_down: u64,

    /// Upload rate limit in bytes per second, 0 for unlimited.
    #[arg(long, env = "COFFER_RATE_LIMIT_UP", default_value = "0")]
    pub rate_limit_up: u64,

    /// Chunks kept by the stream cache.
    #[arg(long, env = "COFFER_CACHE_SIZE")]
    pub cache_size: Option<usize>,

    /// Contracts to keep formed.
    #[arg(long, env = "COFFER_ALLOWANCE_HOSTS")]
    pub allowance_hosts: Option<usize>,

    #[command(subcommand)]
    pub commands: Commands,
}

impl Cli {
    pub fn no_ui(&self) -> bool {
        self.no_ui || !std::io::stdout().is_terminal()
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.to_owned());
        }
        let data_dir = dirs::state_dir()
            .or(dirs::data_local_dir())
            .ok_or(Error::msg("cannot resolve state dir"))?;
        let state_dir = data_dir.join("coffer");
        debug!(state_dir = %state_dir.display());
        Ok(state_dir)
    }

    pub fn renter_config(&self) -> RenterConfig {
        let mut config = RenterConfig::default();
        if let Some(cache_size) = self.cache_size {
            config.stream_cache_size = cache_size;
        }
        if let Some(hosts) = self.allowance_hosts {
            config.allowance.hosts = hosts;
        }
        config
    }

    pub fn version(&self) -> bool {
        matches!(self.commands, Commands::Version)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the hosts running in this process.
    Hosts {
        #[command(subcommand)]
        command: HostsCommand,
    },
    /// Mine blocks on the local chain and maintain contracts.
    Mine {
        #[arg(default_value = "1")]
        blocks: usize,
    },
    Upload {
        path: PathBuf,

        #[arg(long = "data-pieces", short = 'd', default_value = "10")]
        data_pieces: usize,

        #[arg(long = "parity-pieces", short = 'p', default_value = "20")]
        parity_pieces: usize,
    },
    Download {
        /// File id or uploaded path.
        file: String,

        #[arg(long = "output-path", short = 'o')]
        output_path: PathBuf,
    },
    /// Write a byte range of a file to stdout.
    Stream {
        file: String,

        #[arg(long, default_value = "0")]
        from: u64,

        #[arg(long)]
        to: Option<u64>,
    },
    Info {
        file: String,
    },
    Ls,
    Rm {
        file: String,
    },
    Contracts,
    Repair,
    Version,
}

#[derive(Subcommand, Debug)]
pub enum HostsCommand {
    /// Start and announce new hosts.
    Add {
        #[arg(default_value = "1")]
        count: usize,
    },
    Ls,
    /// Take a host offline, or bring it back.
    Offline {
        key: String,

        #[arg(long)]
        online: bool,
    },
    /// Remove a host and everything it stores.
    Remove {
        key: String,
    },
}
