//! Collaborator traits.
//!
//! The orchestrator never talks to a node directly. Remote execution, the
//! database client, the container runtime, and secret storage are injected
//! through these traits so the crate can run against real infrastructure
//! (see the `dbfleet` binary's adapters) or against an in-memory fleet in
//! tests.

use crate::error::Result;
use crate::types::{ContainerState, Health, Node, ReplicaSetSpec, ReplicaStatus};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// SSH-like remote execution.
///
/// Implementations report transport failures (connect errors, timeouts) as
/// [`Error::Unreachable`](crate::Error::Unreachable) and rejected
/// credentials as [`Error::AuthFailed`](crate::Error::AuthFailed). A remote
/// command that runs and exits non-zero is *not* an error at this layer;
/// its exit code is returned in [`CommandOutput`].
pub trait RemoteExec: Send + Sync {
    /// Run a shell command on the node.
    fn exec(&self, node: &Node, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Run a shell command with `input` on its standard input. Secrets are
    /// passed this way so they never appear in a process argument list.
    fn exec_with_input(
        &self,
        node: &Node,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Write `contents` to `remote` on the node, replacing any existing file.
    fn write_file(&self, node: &Node, contents: &[u8], remote: &str, timeout: Duration)
    -> Result<()>;

    /// Copy a local file to the node.
    fn push_file(&self, node: &Node, local: &Path, remote: &str, timeout: Duration) -> Result<()>;

    /// Copy a file from the node to `local`, returning the bytes copied.
    fn pull_file(&self, node: &Node, remote: &str, local: &Path, timeout: Duration)
    -> Result<u64>;
}

/// Which databases a dump or restore covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpScope {
    /// The whole instance
    Full,
    /// A single database
    Database(String),
}

impl fmt::Display for DumpScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("all databases"),
            Self::Database(db) => write!(f, "database {db}"),
        }
    }
}

/// A plaintext secret. Never printed.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plaintext at the moment of use.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// User name plus resolved password.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: Secret,
}

/// Connection parameters for one database call.
#[derive(Debug, Clone, Copy)]
pub struct DbConn<'a> {
    /// Node to talk to
    pub node: &'a Node,
    /// Container the database runs in
    pub container: &'a str,
    /// Credentials, when authorization is enabled
    pub credentials: Option<&'a Credentials>,
    /// Per-call timeout
    pub timeout: Duration,
}

/// Database client primitives.
pub trait DatabaseClient: Send + Sync {
    /// Liveness check.
    fn ping(&self, conn: &DbConn<'_>) -> Result<Health>;

    /// Replica-set view of the node, `None` when it is not a member.
    fn replica_status(&self, conn: &DbConn<'_>) -> Result<Option<ReplicaStatus>>;

    /// Whether `user` exists in the admin database.
    ///
    /// An instance that enforces authorization refuses the check to an
    /// unauthenticated caller with [`Error::AuthFailed`](crate::Error::AuthFailed).
    fn user_exists(&self, conn: &DbConn<'_>, user: &str) -> Result<bool>;

    /// Create a user with the given built-in role.
    fn create_user(&self, conn: &DbConn<'_>, user: &str, password: &Secret, role: &str)
    -> Result<()>;

    /// Initiate a replica set with `conn.node` as its only member.
    fn initiate_replica_set(&self, conn: &DbConn<'_>, spec: &ReplicaSetSpec) -> Result<()>;

    /// Add `member` to the set; `conn` must point at the primary.
    fn add_replica_member(&self, conn: &DbConn<'_>, member: &Node) -> Result<()>;

    /// Consistent, non-blocking dump into a single archive file on the node.
    /// Returns the names of the databases captured.
    fn dump(&self, conn: &DbConn<'_>, scope: &DumpScope, archive: &str) -> Result<Vec<String>>;

    /// Restore from an archive file on the node.
    fn restore(
        &self,
        conn: &DbConn<'_>,
        scope: &DumpScope,
        archive: &str,
        compressed: bool,
        drop_existing: bool,
    ) -> Result<()>;

    /// Drop a database.
    fn drop_database(&self, conn: &DbConn<'_>, database: &str) -> Result<()>;

    /// Names of the databases on the node.
    fn list_databases(&self, conn: &DbConn<'_>) -> Result<Vec<String>>;

    /// Total documents across all collections of `database`.
    fn count_documents(&self, conn: &DbConn<'_>, database: &str) -> Result<u64>;
}

/// What a node's database container should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub config_path: String,
    pub data_path: String,
    pub port: u16,
}

/// Container lifecycle primitives.
pub trait ContainerRuntime: Send + Sync {
    /// Inspect the named container.
    fn inspect(&self, node: &Node, name: &str, timeout: Duration) -> Result<ContainerState>;

    /// Make sure a container matching `spec` is running. Returns whether
    /// anything had to change.
    fn ensure_running(&self, node: &Node, spec: &ContainerSpec, timeout: Duration)
    -> Result<bool>;

    /// Restart the named container.
    fn restart(&self, node: &Node, name: &str, timeout: Duration) -> Result<()>;

    /// Stop the named container. Stopping a stopped container is a no-op.
    fn stop(&self, node: &Node, name: &str, timeout: Duration) -> Result<()>;
}

/// Resolves credential references to plaintext.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<Secret>;
}

/// The full set of collaborators an engine needs.
#[derive(Clone)]
pub struct Backends {
    pub remote: Arc<dyn RemoteExec>,
    pub database: Arc<dyn DatabaseClient>,
    pub containers: Arc<dyn ContainerRuntime>,
    pub secrets: Arc<dyn SecretResolver>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
