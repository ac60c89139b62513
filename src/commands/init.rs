use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{self, Config, WatchConfig};
use crate::error::ExitError;
use crate::record::NodeId;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Where to write the config (default: ./handshake.toml)
    #[arg(long)]
    pub path: Option<PathBuf>,
    /// Pin this host's identity in the generated config
    #[arg(long, value_enum)]
    pub node: Option<NodeId>,
    /// Shared ownership record path to put in the config
    #[arg(long)]
    pub store_path: Option<PathBuf>,
    /// Lease timeout in minutes to put in the config
    #[arg(long)]
    pub timeout_minutes: Option<u64>,
    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn execute(&self) -> Result<()> {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE));
        if path.exists() && !self.force {
            return Err(ExitError::Other(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            ))
            .into());
        }

        let rendered = self.build_config()?.to_toml()?;
        // Reparse so we never write something `load` would reject.
        Config::parse_toml(&rendered)?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
        Ok(())
    }

    fn build_config(&self) -> Result<Config> {
        let mut config = Config::default();
        config.identity.node = self.node;
        if let Some(store_path) = &self.store_path {
            config.store.path.clone_from(store_path);
        }
        match self.timeout_minutes {
            Some(0) => {
                return Err(ExitError::Config("--timeout-minutes must be at least 1".into()).into());
            }
            Some(minutes) => {
                config.lease.timeout_minutes = minutes;
                config.watch = WatchConfig::for_lease(config.lease.timeout().as_secs());
            }
            None => {}
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(path: PathBuf) -> InitArgs {
        InitArgs {
            path: Some(path),
            node: Some(NodeId::Remote),
            store_path: Some(PathBuf::from("/mnt/shared/state.json")),
            timeout_minutes: Some(15),
            force: false,
        }
    }

    #[test]
    fn writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/handshake.toml");

        args(path.clone()).execute().unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.identity.node, Some(NodeId::Remote));
        assert_eq!(config.store.path, PathBuf::from("/mnt/shared/state.json"));
        assert_eq!(config.lease.timeout_minutes, 15);
        assert_eq!(config.watch, WatchConfig::for_lease(900));
    }

    #[test]
    fn short_lease_gets_a_watch_loop_that_fits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handshake.toml");
        let mut short = args(path.clone());
        short.timeout_minutes = Some(2);

        short.execute().unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.watch.renewal_gap_secs(config.watch.interval_secs, true) < 120);
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handshake.toml");
        fs::write(&path, "# mine\n").unwrap();

        let err = args(path.clone()).execute().unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "# mine\n");

        let mut forced = args(path.clone());
        forced.force = true;
        forced.execute().unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("[lease]"));
    }
}
