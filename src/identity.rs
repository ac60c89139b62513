use std::fmt;
use std::path::PathBuf;

use crate::config::IdentityConfig;
use crate::error::ExitError;
use crate::record::NodeId;

/// Environment variable that pins this process's node identity.
pub const NODE_ENV: &str = "HANDSHAKE_NODE";

/// Where a resolved identity came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    Flag,
    Environment,
    Config,
    Marker(PathBuf),
    Default,
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag => f.write_str("--node"),
            Self::Environment => f.write_str(NODE_ENV),
            Self::Config => f.write_str("identity.node"),
            Self::Marker(path) => write!(f, "marker {}", path.display()),
            Self::Default => f.write_str("default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub node: NodeId,
    pub source: IdentitySource,
}

/// Decides which node the current process is.
///
/// Resolution order: `--node`, `$HANDSHAKE_NODE`, `identity.node`, then the
/// first existing remote marker file; anything else is `local`. The answer
/// depends only on those inputs, so it is stable for a host across calls.
#[derive(Debug, Clone)]
pub struct IdentityResolver<'a> {
    flag: Option<NodeId>,
    env: Option<String>,
    config: &'a IdentityConfig,
}

impl<'a> IdentityResolver<'a> {
    pub const fn new(flag: Option<NodeId>, env: Option<String>, config: &'a IdentityConfig) -> Self {
        Self { flag, env, config }
    }

    /// Resolver reading `$HANDSHAKE_NODE` from the process environment.
    pub fn from_process_env(flag: Option<NodeId>, config: &'a IdentityConfig) -> Self {
        Self::new(flag, std::env::var(NODE_ENV).ok(), config)
    }

    pub fn resolve(&self) -> Result<Identity, ExitError> {
        if let Some(node) = self.flag {
            return Ok(Identity {
                node,
                source: IdentitySource::Flag,
            });
        }

        if let Some(raw) = self.env.as_deref().filter(|v| !v.trim().is_empty()) {
            let node = raw
                .parse::<NodeId>()
                .map_err(|e| ExitError::Config(format!("{NODE_ENV}: {e}")))?;
            return Ok(Identity {
                node,
                source: IdentitySource::Environment,
            });
        }

        if let Some(node) = self.config.node {
            return Ok(Identity {
                node,
                source: IdentitySource::Config,
            });
        }

        if let Some(marker) = self.config.remote_markers.iter().find(|p| p.exists()) {
            return Ok(Identity {
                node: NodeId::Remote,
                source: IdentitySource::Marker(marker.clone()),
            });
        }

        Ok(Identity {
            node: NodeId::Local,
            source: IdentitySource::Default,
        })
    }
}

/// Identity of the current process, honouring an explicit override.
pub fn get_node_identity(flag: Option<NodeId>, config: &IdentityConfig) -> Result<NodeId, ExitError> {
    let identity = IdentityResolver::from_process_env(flag, config).resolve()?;
    tracing::debug!(node = %identity.node, source = %identity.source, "resolved node identity");
    Ok(identity.node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_markers(markers: Vec<PathBuf>) -> IdentityConfig {
        IdentityConfig {
            node: None,
            remote_markers: markers,
        }
    }

    #[test]
    fn defaults_to_local_without_markers() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_markers(vec![dir.path().join("absent")]);

        let identity = IdentityResolver::new(None, None, &config).resolve().unwrap();
        assert_eq!(identity.node, NodeId::Local);
        assert_eq!(identity.source, IdentitySource::Default);
    }

    #[test]
    fn marker_file_means_remote() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("google_compute_engine");
        std::fs::write(&marker, "").unwrap();
        let config = config_with_markers(vec![dir.path().join("absent"), marker.clone()]);

        let identity = IdentityResolver::new(None, None, &config).resolve().unwrap();
        assert_eq!(identity.node, NodeId::Remote);
        assert_eq!(identity.source, IdentitySource::Marker(marker));
    }

    #[test]
    fn config_beats_markers() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        std::fs::write(&marker, "").unwrap();
        let config = IdentityConfig {
            node: Some(NodeId::Local),
            remote_markers: vec![marker],
        };

        let identity = IdentityResolver::new(None, None, &config).resolve().unwrap();
        assert_eq!(identity.node, NodeId::Local);
        assert_eq!(identity.source, IdentitySource::Config);
    }

    #[test]
    fn environment_beats_config() {
        let config = IdentityConfig {
            node: Some(NodeId::Local),
            remote_markers: vec![],
        };

        let identity = IdentityResolver::new(None, Some("gcp_vm".into()), &config)
            .resolve()
            .unwrap();
        assert_eq!(identity.node, NodeId::Remote);
        assert_eq!(identity.source, IdentitySource::Environment);
    }

    #[test]
    fn flag_beats_everything() {
        let config = IdentityConfig {
            node: Some(NodeId::Remote),
            remote_markers: vec![],
        };

        let identity = IdentityResolver::new(Some(NodeId::Local), Some("remote".into()), &config)
            .resolve()
            .unwrap();
        assert_eq!(identity.node, NodeId::Local);
        assert_eq!(identity.source, IdentitySource::Flag);
    }

    #[test]
    fn invalid_environment_value_is_a_config_error() {
        let config = config_with_markers(vec![]);
        let err = IdentityResolver::new(None, Some("laptop".into()), &config)
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ExitError::Config(_)));
        assert!(err.to_string().contains(NODE_ENV));
    }

    #[test]
    fn blank_environment_value_is_ignored() {
        let config = config_with_markers(vec![]);
        let identity = IdentityResolver::new(None, Some("  ".into()), &config)
            .resolve()
            .unwrap();
        assert_eq!(identity.source, IdentitySource::Default);
    }

    #[test]
    fn resolution_is_stable_across_calls() {
        let config = IdentityConfig::default();
        let resolver = IdentityResolver::new(None, None, &config);
        assert_eq!(resolver.resolve().unwrap(), resolver.resolve().unwrap());
    }
}
