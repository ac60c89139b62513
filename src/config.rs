use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, StorageClock, SystemClock};
use crate::error::ExitError;
use crate::record::NodeId;
use crate::store::FileStore;

/// Config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "handshake.toml";
/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HANDSHAKE_CONFIG";

/// Find the config file to use.
///
/// Priority order (highest first):
/// 1. `--config` on the command line
/// 2. `$HANDSHAKE_CONFIG`
/// 3. `./handshake.toml`
/// 4. `<config dir>/handshake/config.toml`
///
/// An explicit path is returned even if it does not exist, so that loading
/// it reports the problem instead of silently using defaults.
pub fn find_config(explicit: Option<&Path>, env: Option<PathBuf>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env.filter(|p| !p.as_os_str().is_empty()) {
        return Some(path);
    }
    let local = cwd.join(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("handshake").join("config.toml"))
        .filter(|p| p.exists())
}

/// Top-level handshake.toml.
///
/// Every section is optional; both nodes should share the same `[lease]`
/// values, since mismatched timeouts make ownership oscillate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Shared ownership record. Relative paths resolve against the working directory.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    #[default]
    System,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LeaseConfig {
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub clock: ClockKind,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            clock: ClockKind::default(),
        }
    }
}

impl LeaseConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IdentityConfig {
    /// Fixed identity for this host. Overrides marker detection.
    #[serde(default)]
    pub node: Option<NodeId>,
    /// Paths whose presence marks this host as the remote node.
    #[serde(default = "default_remote_markers")]
    pub remote_markers: Vec<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node: None,
            remote_markers: default_remote_markers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WatchConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            jitter_secs: default_jitter_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl WatchConfig {
    /// Settings whose longest renewal gap stays inside a `lease_secs` lease.
    /// For the default 600s lease this gives the serde defaults.
    pub const fn for_lease(lease_secs: u64) -> Self {
        Self {
            interval_secs: lease_secs / 2,
            jitter_secs: lease_secs / 40,
            command_timeout_secs: lease_secs / 5 * 2,
        }
    }

    /// Longest time a watching owner goes without renewing: the guarded
    /// command, then the pause before the next claim.
    pub const fn renewal_gap_secs(&self, interval_secs: u64, runs_command: bool) -> u64 {
        let command = if runs_command { self.command_timeout_secs } else { 0 };
        command
            .saturating_add(interval_secs)
            .saturating_add(self.jitter_secs)
    }

    /// The owner must renew before its lease expires, or the peer takes over
    /// while the command is still running.
    pub fn check_renewal_gap(
        &self,
        interval_secs: u64,
        lease_secs: u64,
        runs_command: bool,
    ) -> Result<(), ExitError> {
        let gap = self.renewal_gap_secs(interval_secs, runs_command);
        if gap < lease_secs {
            return Ok(());
        }
        let command = if runs_command {
            format!("command_timeout_secs {} + ", self.command_timeout_secs)
        } else {
            String::new()
        };
        Err(ExitError::Config(format!(
            "watch can go {gap}s without renewing ({command}interval_secs {interval_secs} + jitter_secs {}), \
             which must stay under the {lease_secs}s lease",
            self.jitter_secs
        )))
    }
}

// Default value functions for serde
fn default_store_path() -> PathBuf { PathBuf::from("knowledge/system/sync_state.json") }
fn default_lock_timeout_ms() -> u64 { 5000 }
fn default_stale_lock_secs() -> u64 { 30 }
fn default_timeout_minutes() -> u64 { 10 }
fn default_remote_markers() -> Vec<PathBuf> { vec![PathBuf::from("/etc/google_compute_engine")] }
fn default_interval_secs() -> u64 { 300 }
fn default_jitter_secs() -> u64 { 15 }
fn default_command_timeout_secs() -> u64 { 240 }

impl Config {
    /// Load the config file found by [`find_config`], or defaults when there is none.
    pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("determining working directory")?;
        let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match find_config(explicit, env, &cwd) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let invalid = |e: toml::de::Error| ExitError::Config(format!("invalid {CONFIG_FILE}: {e}"));
        let table: toml::Table = toml::from_str(toml_str).map_err(invalid)?;
        let has_watch = table.contains_key("watch");
        let mut config: Self = toml::Value::Table(table).try_into().map_err(invalid)?;
        // Without a [watch] section, size the loop to whatever lease is configured.
        if !has_watch {
            config.watch = WatchConfig::for_lease(config.lease.timeout().as_secs());
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ExitError> {
        if self.lease.timeout_minutes == 0 {
            return Err(ExitError::Config(
                "lease.timeout_minutes must be at least 1".into(),
            ));
        }
        if self.watch.interval_secs == 0 {
            return Err(ExitError::Config(
                "watch.interval_secs must be at least 1".into(),
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(ExitError::Config("store.path must not be empty".into()));
        }
        self.watch
            .check_renewal_gap(self.watch.interval_secs, self.lease.timeout().as_secs(), true)
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# handshake configuration\n# Share the [lease] section between both nodes.\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(toml_edit::Item::as_table_mut) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "store", "# Shared ownership record, reachable from both nodes\n");
        set_table_comment(
            &mut doc,
            "lease",
            "\n# Heartbeat lease. clock = \"storage\" uses the shared filesystem's timestamps\n",
        );
        set_table_comment(
            &mut doc,
            "identity",
            "\n# Which node this host is. Set `node` to pin it; otherwise any existing\n# remote marker makes this host `remote`\n",
        );
        set_table_comment(&mut doc, "watch", "\n# Guarded task loop (`handshake watch`)\n");

        Ok(doc.to_string())
    }

    /// File store for the configured record, or `override_path` when given.
    pub fn file_store(&self, override_path: Option<&Path>) -> FileStore {
        let path = override_path.unwrap_or(&self.store.path);
        FileStore::new(path).with_lock_settings(
            Duration::from_millis(self.store.lock_timeout_ms),
            Duration::from_secs(self.store.stale_lock_secs),
        )
    }

    pub fn clock(&self, record_path: &Path) -> Box<dyn Clock> {
        match self.lease.clock {
            ClockKind::System => Box::new(SystemClock),
            ClockKind::Storage => Box::new(StorageClock::beside(record_path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_toml_config() {
        let toml_str = r#"
[store]
path = "/mnt/shared/sync_state.json"
lock_timeout_ms = 2000
stale_lock_secs = 10

[lease]
timeout_minutes = 15
clock = "storage"

[identity]
node = "remote"
remote_markers = ["/etc/cloud-vm"]

[watch]
interval_secs = 60
jitter_secs = 5
command_timeout_secs = 120
"#;

        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/mnt/shared/sync_state.json"));
        assert_eq!(config.store.lock_timeout_ms, 2000);
        assert_eq!(config.lease.timeout(), Duration::from_secs(900));
        assert_eq!(config.lease.clock, ClockKind::Storage);
        assert_eq!(config.identity.node, Some(NodeId::Remote));
        assert_eq!(config.identity.remote_markers, vec![PathBuf::from("/etc/cloud-vm")]);
        assert_eq!(config.watch.interval_secs, 60);
        assert_eq!(config.watch.command_timeout_secs, 120);
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.lease.timeout(), Duration::from_secs(600));
        assert_eq!(config.lease.clock, ClockKind::System);
        assert_eq!(config.identity.node, None);
        assert_eq!(
            config.identity.remote_markers,
            vec![PathBuf::from("/etc/google_compute_engine")]
        );
        assert_eq!(config.watch.interval_secs, 300);
    }

    #[test]
    fn default_watch_renews_inside_the_lease() {
        let config = Config::default();
        let lease = config.lease.timeout().as_secs();
        assert!(config.watch.command_timeout_secs < lease);
        assert!(config.watch.renewal_gap_secs(config.watch.interval_secs, true) < lease);
        assert_eq!(WatchConfig::for_lease(lease), config.watch);
    }

    #[test]
    fn rejects_watch_cycle_longer_than_lease() {
        let toml_str = "[lease]\ntimeout_minutes = 10\n\n[watch]\ncommand_timeout_secs = 900\n";
        let err = Config::parse_toml(toml_str).unwrap_err();
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::Config(_))));
        assert!(err.to_string().contains("1215s"), "got: {err}");

        let err = Config::parse_toml("[watch]\ninterval_secs = 600\ncommand_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("600s lease"), "got: {err}");
    }

    #[test]
    fn watch_defaults_follow_a_shorter_lease() {
        let config = Config::parse_toml("[lease]\ntimeout_minutes = 3\n").unwrap();
        assert_eq!(config.watch, WatchConfig::for_lease(180));
        assert!(config.watch.renewal_gap_secs(config.watch.interval_secs, true) < 180);
    }

    #[test]
    fn renewal_gap_without_command_ignores_command_timeout() {
        let watch = WatchConfig {
            interval_secs: 300,
            jitter_secs: 15,
            command_timeout_secs: 900,
        };
        assert_eq!(watch.renewal_gap_secs(300, false), 315);
        assert!(watch.check_renewal_gap(300, 600, false).is_ok());
        assert!(watch.check_renewal_gap(300, 600, true).is_err());
    }

    #[test]
    fn identity_accepts_legacy_node_names() {
        let config = Config::parse_toml("[identity]\nnode = \"gcp_vm\"\n").unwrap();
        assert_eq!(config.identity.node, Some(NodeId::Remote));
    }

    #[test]
    fn parse_partial_section_fills_defaults() {
        let config = Config::parse_toml("[lease]\ntimeout_minutes = 3\n").unwrap();
        assert_eq!(config.lease.timeout_minutes, 3);
        assert_eq!(config.lease.clock, ClockKind::System);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("invalid handshake.toml"));
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = Config::parse_toml("[lease]\ntimeout_minutes = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_minutes"));
    }

    #[test]
    fn rejects_unknown_clock() {
        assert!(Config::parse_toml("[lease]\nclock = \"atomic\"\n").is_err());
    }

    #[test]
    fn roundtrip_toml() {
        let mut config = Config::default();
        config.identity.node = Some(NodeId::Local);
        config.lease.timeout_minutes = 20;

        let output = config.to_toml().unwrap();
        let config2 = Config::parse_toml(&output).unwrap();
        assert_eq!(config, config2);
    }

    #[test]
    fn to_toml_includes_comments() {
        let output = Config::default().to_toml().unwrap();
        assert!(output.contains("# handshake configuration"));
        assert!(output.contains("# Heartbeat lease"));
        assert!(output.contains("# Guarded task loop"));
    }

    #[test]
    fn find_config_prefers_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let explicit = dir.path().join("other.toml");

        let found = find_config(Some(&explicit), Some(dir.path().join("env.toml")), dir.path());
        assert_eq!(found, Some(explicit));
    }

    #[test]
    fn find_config_env_beats_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let env = dir.path().join("env.toml");

        let found = find_config(None, Some(env.clone()), dir.path());
        assert_eq!(found, Some(env));
    }

    #[test]
    fn find_config_falls_back_to_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();

        let found = find_config(None, None, dir.path()).unwrap();
        assert!(found.ends_with(CONFIG_FILE));
    }

    #[test]
    fn file_store_honours_override() {
        let config = Config::default();
        let store = config.file_store(Some(Path::new("/tmp/elsewhere.json")));
        assert_eq!(store.path(), Path::new("/tmp/elsewhere.json"));
        assert_eq!(
            config.file_store(None).path(),
            Path::new("knowledge/system/sync_state.json")
        );
    }
}
