pub mod claim;
pub mod init;
pub mod schema;
pub mod status;
pub mod watch;
pub mod whoami;

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::clock::Clock;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::ExitError;
use crate::store::FileStore;

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Config file (default: ./handshake.toml, then the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Ownership record to use instead of store.path
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,
}

impl GlobalArgs {
    pub fn load_config(&self) -> anyhow::Result<Config> {
        Config::discover(self.config.as_deref())
    }
}

/// Output format for read-only reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

pub type FileCoordinator = Coordinator<FileStore, Box<dyn Clock>>;

/// Coordinator over the configured file store, with an optional
/// `--timeout-minutes` override.
pub fn file_coordinator(
    config: &Config,
    global: &GlobalArgs,
    timeout_minutes: Option<u64>,
) -> anyhow::Result<FileCoordinator> {
    let timeout = match timeout_minutes {
        Some(0) => {
            return Err(ExitError::Config("--timeout-minutes must be at least 1".into()).into());
        }
        Some(minutes) => Duration::from_secs(minutes.saturating_mul(60)),
        None => config.lease.timeout(),
    };
    let store = config.file_store(global.state_file.as_deref());
    let clock = config.clock(store.path());
    Ok(Coordinator::new(store, clock, timeout))
}
