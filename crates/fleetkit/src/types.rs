//! Core types: inventory, desired configuration, observed state.

use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    27017
}

/// Role a node plays in the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Holds data; eligible to become primary
    #[default]
    Data,
    /// Votes in elections, holds no data
    Arbiter,
}

impl NodeRole {
    /// Whether the node stores data (and can be dumped or restored).
    pub fn holds_data(&self) -> bool {
        matches!(self, Self::Data)
    }
}

/// A single database-fleet member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier within the environment
    pub id: String,
    /// Host name or address used for SSH and replica-set membership
    pub host: String,
    /// Database port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user, when it differs from the local default
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Credential reference for the SSH connection (resolved at use)
    #[serde(default)]
    pub credentials: Option<String>,
    /// Role tag
    #[serde(default)]
    pub role: NodeRole,
    /// Replica-set election priority
    #[serde(default)]
    pub priority: Option<u32>,
}

impl Node {
    /// Construct a data node listening on the default port.
    pub fn data(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: default_port(),
            ssh_user: None,
            credentials: None,
            role: NodeRole::Data,
            priority: None,
        }
    }

    /// Construct an arbiter listening on the default port.
    pub fn arbiter(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            role: NodeRole::Arbiter,
            ..Self::data(id, host)
        }
    }

    /// `host:port` as used in replica-set member lists.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A named, ordered, non-empty set of nodes plus their declared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    /// Environment name (also the artifact file-name prefix)
    pub name: String,
    /// Nodes in inventory order; the order drives primary selection
    pub nodes: Vec<Node>,
    /// Declared desired state shared by every node
    pub desired: DesiredConfig,
}

impl Environment {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Data-bearing nodes in inventory order.
    pub fn data_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.role.holds_data())
    }

    /// The node that bootstraps the replica set: the first data node.
    pub fn primary(&self) -> Option<&Node> {
        self.data_nodes().next()
    }

    /// Whether `node` is the bootstrap primary.
    pub fn is_primary(&self, node: &Node) -> bool {
        self.primary().is_some_and(|p| p.id == node.id)
    }
}

fn default_image() -> String {
    "mongo".to_string()
}

fn default_container_name() -> String {
    "mongodb".to_string()
}

fn default_config_path() -> String {
    "/etc/mongod/mongod.conf".to_string()
}

fn default_data_path() -> String {
    "/var/lib/mongodb".to_string()
}

/// Declared target configuration for a fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredConfig {
    /// Database version (also the image tag)
    pub version: String,
    /// Container image repository
    #[serde(default = "default_image")]
    pub image: String,
    /// Container name on every node
    #[serde(default = "default_container_name")]
    pub container_name: String,
    /// Where the rendered config file lives on the node
    #[serde(default = "default_config_path")]
    pub config_path: String,
    /// Host directory mounted as the data directory
    #[serde(default = "default_data_path")]
    pub data_path: String,
    /// Authentication policy
    #[serde(default)]
    pub auth: AuthPolicy,
    /// Storage engine parameters
    #[serde(default)]
    pub storage: StorageParams,
    /// Replica-set membership, if the fleet runs as a replica set
    #[serde(default)]
    pub replica_set: Option<ReplicaSetSpec>,
    /// Backup policy
    #[serde(default)]
    pub backup: BackupPolicy,
}

impl DesiredConfig {
    /// Minimal desired config for `version` with every other field defaulted.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            image: default_image(),
            container_name: default_container_name(),
            config_path: default_config_path(),
            data_path: default_data_path(),
            auth: AuthPolicy::default(),
            storage: StorageParams::default(),
            replica_set: None,
            backup: BackupPolicy::default(),
        }
    }

    /// Full image reference, e.g. `mongo:7.0.5`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

fn default_root_user() -> String {
    "admin".to_string()
}

/// Authentication policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPolicy {
    /// Whether authorization is enforced
    #[serde(default)]
    pub enabled: bool,
    /// Name of the root user to bootstrap
    #[serde(default = "default_root_user")]
    pub root_user: String,
    /// Secret reference for the root password
    #[serde(default)]
    pub root_password_ref: Option<String>,
    /// Path of the replica-set keyfile on the node
    #[serde(default)]
    pub keyfile_path: Option<String>,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            root_user: default_root_user(),
            root_password_ref: None,
            keyfile_path: None,
        }
    }
}

fn default_engine() -> String {
    "wiredTiger".to_string()
}

/// Storage engine parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageParams {
    /// Storage engine name
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Engine cache size in MiB
    #[serde(default)]
    pub cache_size_mb: Option<u64>,
    /// Oplog size in MiB
    #[serde(default)]
    pub oplog_size_mb: Option<u64>,
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            cache_size_mb: None,
            oplog_size_mb: None,
        }
    }
}

/// Replica-set membership declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    /// Replica-set name
    pub name: String,
}

fn default_schedule() -> String {
    "0 2 * * *".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_true() -> bool {
    true
}

/// Backup policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPolicy {
    /// Cron-style schedule descriptor, consumed by whatever triggers backups
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Artifacts older than this many days are rotated out
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Gzip the archive before transfer
    #[serde(default = "default_true")]
    pub compression: bool,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            retention_days: default_retention_days(),
            compression: true,
        }
    }
}

// ============================================================================
// Observed state
// ============================================================================

/// Health as reported by a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Responding to commands
    Healthy,
    /// Reachable but not serving
    Unhealthy,
}

/// Member role within a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    /// Accepts writes
    Primary,
    /// Replicates from the primary
    Secondary,
    /// Votes only
    Arbiter,
    /// Still syncing or electing
    Startup,
    /// Anything else the database reports (recovering, rollback, ...)
    Other,
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Arbiter => "arbiter",
            Self::Startup => "startup",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Replica-set view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Name of the set the node belongs to
    pub set_name: String,
    /// This node's role
    pub role: ReplicaRole,
    /// Replication lag behind the primary, in seconds
    pub lag_secs: Option<u64>,
}

/// Container view of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Container exists (running or not)
    pub exists: bool,
    /// Container is running
    pub running: bool,
    /// Image reference the container was created from
    pub image: Option<String>,
    /// Result of the container's own health check, if it defines one
    pub healthy: Option<bool>,
}

impl ContainerState {
    /// Version part of the image reference (`mongo:7.0.5` → `7.0.5`).
    pub fn version(&self) -> Option<&str> {
        self.image
            .as_deref()
            .and_then(|image| image.rsplit_once(':'))
            .map(|(_, tag)| tag)
    }
}

/// Point-in-time snapshot of a node. Produced fresh by every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Container state
    pub container: ContainerState,
    /// Current contents of the config file, if present
    pub config: Option<String>,
    /// Whether the root user exists; `None` when auth was not probed
    pub root_user_present: Option<bool>,
    /// Replica-set membership; `None` when not a member
    pub replica: Option<ReplicaStatus>,
}

impl ObservedState {
    /// Whether the node is a member of the set named `set_name`.
    pub fn is_member_of(&self, set_name: &str) -> bool {
        self.replica.as_ref().is_some_and(|r| r.set_name == set_name)
    }
}
