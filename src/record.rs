use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reason written into history entries for lease takeovers.
pub const REASON_TIMEOUT: &str = "timeout";

/// One of the two cooperating nodes.
///
/// Older records spell these `macbook` and `gcp_vm`; both spellings are read,
/// only `local` and `remote` are written.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeId {
    #[serde(alias = "macbook")]
    #[value(alias = "macbook")]
    Local,
    #[serde(alias = "gcp_vm")]
    #[value(alias = "gcp_vm")]
    Remote,
}

impl NodeId {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    /// The other node.
    pub const fn peer(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown node {0:?} (expected local or remote)")]
pub struct UnknownNode(pub String);

impl FromStr for NodeId {
    type Err = UnknownNode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "macbook" => Ok(Self::Local),
            "remote" | "gcp_vm" => Ok(Self::Remote),
            _ => Err(UnknownNode(s.to_string())),
        }
    }
}

/// Last-known liveness of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl Health {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

/// Per-node health, keyed by node name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HealthMap {
    #[serde(default, alias = "macbook")]
    pub local: Health,
    #[serde(default, alias = "gcp_vm")]
    pub remote: Health,
}

impl HealthMap {
    pub const fn get(&self, node: NodeId) -> Health {
        match node {
            NodeId::Local => self.local,
            NodeId::Remote => self.remote,
        }
    }

    pub const fn set(&mut self, node: NodeId, health: Health) {
        match node {
            NodeId::Local => self.local = health,
            NodeId::Remote => self.remote = health,
        }
    }
}

/// Audit entry appended whenever `active_node` changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransferRecord {
    #[serde(rename = "from")]
    pub from_node: NodeId,
    #[serde(rename = "to")]
    pub to_node: NodeId,
    #[serde(with = "timestamp")]
    #[schemars(with = "String")]
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// The shared ownership record both nodes read before doing guarded work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OwnershipRecord {
    pub active_node: NodeId,
    #[serde(with = "timestamp")]
    #[schemars(with = "String")]
    pub last_heartbeat: DateTime<Utc>,
    /// Reserved for cooperative handover. Round-tripped, never consulted.
    #[serde(default)]
    pub pending_handover: bool,
    #[serde(default)]
    pub node_history: Vec<TransferRecord>,
    #[serde(default)]
    pub health: HealthMap,
    /// Lease timeout the current owner was configured with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_threshold_seconds: Option<u64>,
    /// Fields written by other tools sharing this file.
    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed ownership record: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid ownership record: {0}")]
    Invalid(String),
}

impl OwnershipRecord {
    /// Default record for a deployment that has never claimed: `local` owns,
    /// nobody has been seen yet.
    ///
    /// The heartbeat is a provisional lease, not proof that `local` is alive;
    /// `health.local` stays `unknown` until `local` itself claims. When
    /// `remote` writes this record it simply starts the clock on a takeover.
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            active_node: NodeId::Local,
            last_heartbeat: now,
            pending_handover: false,
            node_history: Vec::new(),
            health: HealthMap::default(),
            failover_threshold_seconds: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Parse and validate stored bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_slice(bytes)?;
        record.validate()?;
        Ok(record)
    }

    /// Serialize the way it is stored: pretty JSON with a trailing newline.
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        for (i, entry) in self.node_history.iter().enumerate() {
            if entry.from_node == entry.to_node {
                return Err(RecordError::Invalid(format!(
                    "node_history[{i}] transfers {} to itself",
                    entry.from_node
                )));
            }
            if entry.reason.trim().is_empty() {
                return Err(RecordError::Invalid(format!(
                    "node_history[{i}] has an empty reason"
                )));
            }
        }
        Ok(())
    }

    /// Time since the last heartbeat. Negative when the writer's clock ran ahead.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_heartbeat)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.heartbeat_age(now) > timeout
    }

    /// Refresh the owner's heartbeat. Never moves the heartbeat backwards.
    pub fn renew(&mut self, node: NodeId, now: DateTime<Utc>) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
        self.health.set(node, Health::Online);
    }

    /// Hand the lease to `to` and log the transfer.
    pub fn transfer_to(&mut self, to: NodeId, now: DateTime<Utc>, reason: &str) {
        let from = self.active_node;
        self.active_node = to;
        self.last_heartbeat = now;
        self.health.set(from, Health::Offline);
        self.health.set(to, Health::Online);
        self.node_history.push(TransferRecord {
            from_node: from,
            to_node: to,
            timestamp: now,
            reason: reason.to_string(),
        });
    }
}

/// RFC 3339 on write; RFC 3339 or offset-less ISO-8601 (taken as UTC) on read.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {raw:?}")))
    }
}
