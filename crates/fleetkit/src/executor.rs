//! Node executor - runs units of work against a single node.
//!
//! Every mutating call goes through [`NodeExecutor::execute`], which is the
//! one place that honors dry-run mode and applies the per-call retry
//! policy. Read-only probes have their own methods and always run, dry run
//! or not.

use crate::backend::{Backends, ContainerSpec, Credentials, DbConn, DumpScope, shell_quote};
use crate::error::{Error, Result};
use crate::retry::{LogCallback, RetryConfig, with_retry};
use crate::types::{
    AuthPolicy, ContainerState, DesiredConfig, Health, Node, ObservedState, ReplicaSetSpec,
    ReplicaStatus,
};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

static DF_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("valid regex"));

/// Per-call timeout and retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CallPolicy {
    /// Upper bound for one attempt; overrunning it counts as unreachable
    pub timeout: Duration,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }
}

impl CallPolicy {
    /// Same timeout, single attempt.
    pub fn once(&self) -> Self {
        Self {
            timeout: self.timeout,
            retry: RetryConfig::no_retry(),
        }
    }
}

/// A mutating unit of work.
#[derive(Debug, Clone)]
pub enum UnitOfWork {
    /// Shell command
    Command { command: String },
    /// Write a rendered file
    WriteFile { path: String, contents: Vec<u8> },
    /// Copy a local file to the node
    PushFile { local: PathBuf, remote: String },
    /// Copy a file from the node
    PullFile { remote: String, local: PathBuf },
    /// Install or upgrade the database container
    EnsureContainer(ContainerSpec),
    /// Restart the database container
    RestartContainer { name: String },
    /// Stop the database container
    StopContainer { name: String },
    /// Create a user; the password reference is resolved at use
    CreateUser {
        user: String,
        password_ref: String,
        role: String,
    },
    /// Initiate a replica set on this node
    InitiateReplicaSet(ReplicaSetSpec),
    /// Add a member; executed against the primary
    AddReplicaMember(Node),
    /// Consistent dump to an archive file on the node
    Dump { scope: DumpScope, archive: String },
    /// Restore from an archive file on the node
    Restore {
        scope: DumpScope,
        archive: String,
        compressed: bool,
        drop_existing: bool,
    },
    /// Drop one database
    DropDatabase { database: String },
}

impl UnitOfWork {
    /// Human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Self::Command { command } => format!("run `{command}`"),
            Self::WriteFile { path, .. } => format!("write {path}"),
            Self::PushFile { local, remote } => {
                format!("push {} to {remote}", local.display())
            }
            Self::PullFile { remote, local } => {
                format!("pull {remote} to {}", local.display())
            }
            Self::EnsureContainer(spec) => {
                format!("ensure container {} runs {}", spec.name, spec.image)
            }
            Self::RestartContainer { name } => format!("restart container {name}"),
            Self::StopContainer { name } => format!("stop container {name}"),
            Self::CreateUser { user, role, .. } => format!("create user {user} ({role})"),
            Self::InitiateReplicaSet(spec) => format!("initiate replica set {}", spec.name),
            Self::AddReplicaMember(member) => {
                format!("add {} ({}) to replica set", member.id, member.address())
            }
            Self::Dump { scope, archive } => format!("dump {scope} to {archive}"),
            Self::Restore { scope, archive, .. } => format!("restore {scope} from {archive}"),
            Self::DropDatabase { database } => format!("drop database {database}"),
        }
    }
}

/// Payload returned by a unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecOutput {
    #[default]
    None,
    /// Command stdout
    Text(String),
    /// Databases captured by a dump
    Databases(Vec<String>),
    /// Bytes transferred
    Bytes(u64),
}

/// Result of executing a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// What was (or would have been) done
    pub description: String,
    /// Whether the node was actually changed
    pub changed: bool,
    /// Dry run only: whether the work would change the node
    pub would_change: bool,
    /// Payload
    pub output: ExecOutput,
}

impl ExecResult {
    fn applied(description: String, changed: bool, output: ExecOutput) -> Self {
        Self {
            description,
            changed,
            would_change: false,
            output,
        }
    }

    fn planned(description: String) -> Self {
        Self {
            description,
            changed: false,
            would_change: true,
            output: ExecOutput::None,
        }
    }
}

/// Executes work against nodes through the injected backends.
pub struct NodeExecutor {
    backends: Backends,
    container: String,
    auth: AuthPolicy,
    dry_run: bool,
}

impl NodeExecutor {
    pub fn new(backends: Backends, desired: &DesiredConfig) -> Self {
        Self {
            backends,
            container: desired.container_name.clone(),
            auth: desired.auth.clone(),
            dry_run: false,
        }
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Execute a mutating unit of work.
    ///
    /// In dry-run mode nothing reaches the node; the result describes the
    /// work and is tagged `would_change`.
    pub fn execute(
        &self,
        node: &Node,
        work: &UnitOfWork,
        policy: &CallPolicy,
    ) -> Result<ExecResult> {
        let description = work.describe();
        if self.dry_run {
            log::info!("{}: would {}", node.id, description);
            return Ok(ExecResult::planned(description));
        }

        log::debug!("{}: {}", node.id, description);
        let label = format!("{}: {}", node.id, description);
        let callback = LogCallback { label: &label };
        let (changed, output) = with_retry(&policy.retry, Some(&callback), || {
            self.dispatch(node, work, policy.timeout)
        })?;

        Ok(ExecResult::applied(description, changed, output))
    }

    fn dispatch(
        &self,
        node: &Node,
        work: &UnitOfWork,
        timeout: Duration,
    ) -> Result<(bool, ExecOutput)> {
        let backends = &self.backends;
        match work {
            UnitOfWork::Command { command } => {
                let output = backends.remote.exec(node, command, timeout)?;
                if !output.success() {
                    return Err(remote_error(node, output.code, &output.stderr));
                }
                Ok((true, ExecOutput::Text(output.stdout)))
            }
            UnitOfWork::WriteFile { path, contents } => {
                backends.remote.write_file(node, contents, path, timeout)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::PushFile { local, remote } => {
                backends.remote.push_file(node, local, remote, timeout)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::PullFile { remote, local } => {
                let bytes = backends.remote.pull_file(node, remote, local, timeout)?;
                Ok((false, ExecOutput::Bytes(bytes)))
            }
            UnitOfWork::EnsureContainer(spec) => {
                let changed = backends.containers.ensure_running(node, spec, timeout)?;
                Ok((changed, ExecOutput::None))
            }
            UnitOfWork::RestartContainer { name } => {
                backends.containers.restart(node, name, timeout)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::StopContainer { name } => {
                backends.containers.stop(node, name, timeout)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::CreateUser {
                user,
                password_ref,
                role,
            } => {
                let password = backends.secrets.resolve(password_ref)?;
                // First user: no credentials exist yet
                let conn = self.conn(node, None, timeout);
                backends.database.create_user(&conn, user, &password, role)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::InitiateReplicaSet(spec) => {
                // Runs before the root user exists
                let conn = self.conn(node, None, timeout);
                backends.database.initiate_replica_set(&conn, spec)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::AddReplicaMember(member) => {
                let creds = self.credentials()?;
                let conn = self.conn(node, creds.as_ref(), timeout);
                backends.database.add_replica_member(&conn, member)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::Dump { scope, archive } => {
                let creds = self.credentials()?;
                let conn = self.conn(node, creds.as_ref(), timeout);
                let databases = backends.database.dump(&conn, scope, archive)?;
                Ok((false, ExecOutput::Databases(databases)))
            }
            UnitOfWork::Restore {
                scope,
                archive,
                compressed,
                drop_existing,
            } => {
                let creds = self.credentials()?;
                let conn = self.conn(node, creds.as_ref(), timeout);
                backends
                    .database
                    .restore(&conn, scope, archive, *compressed, *drop_existing)?;
                Ok((true, ExecOutput::None))
            }
            UnitOfWork::DropDatabase { database } => {
                let creds = self.credentials()?;
                let conn = self.conn(node, creds.as_ref(), timeout);
                backends.database.drop_database(&conn, database)?;
                Ok((true, ExecOutput::None))
            }
        }
    }

    // ------------------------------------------------------------------
    // Read-only probes
    // ------------------------------------------------------------------

    /// Run a read-only command and return its stdout.
    pub fn read(&self, node: &Node, command: &str, policy: &CallPolicy) -> Result<String> {
        self.probe_with_retry(node, "read", policy, |timeout| {
            let output = self.backends.remote.exec(node, command, timeout)?;
            if output.success() {
                Ok(output.stdout)
            } else {
                Err(remote_error(node, output.code, &output.stderr))
            }
        })
    }

    /// Check that the node answers a trivial command.
    pub fn reachable(&self, node: &Node, policy: &CallPolicy) -> Result<()> {
        self.read(node, "true", policy).map(|_| ())
    }

    /// Inspect the database container.
    pub fn container_state(&self, node: &Node, policy: &CallPolicy) -> Result<ContainerState> {
        self.probe_with_retry(node, "inspect container", policy, |timeout| {
            self.backends.containers.inspect(node, &self.container, timeout)
        })
    }

    /// Ping the database.
    pub fn ping(&self, node: &Node, policy: &CallPolicy) -> Result<Health> {
        self.query_with_auth_fallback(node, "ping", policy, |conn| {
            self.backends.database.ping(conn)
        })
    }

    /// Set name and role of the node. Answers before any user exists; the
    /// lag is only known to an authenticated caller.
    pub fn replica_membership(
        &self,
        node: &Node,
        policy: &CallPolicy,
    ) -> Result<Option<ReplicaStatus>> {
        self.query_with_auth_fallback(node, "replica membership", policy, |conn| {
            self.backends.database.replica_status(conn)
        })
    }

    /// Whether the root user exists.
    pub fn root_user_present(&self, node: &Node, policy: &CallPolicy) -> Result<bool> {
        let user = &self.auth.root_user;
        let found = self.query_with_auth_fallback(node, "check root user", policy, |conn| {
            self.backends.database.user_exists(conn, user)
        });
        match found {
            // Neither anonymous nor root access: the root user does not exist yet
            Err(Error::AuthFailed { .. }) => Ok(false),
            other => other,
        }
    }

    /// Replica-set view of the node, including lag.
    pub fn replica_status(
        &self,
        node: &Node,
        policy: &CallPolicy,
    ) -> Result<Option<ReplicaStatus>> {
        self.probe_with_retry(node, "replica status", policy, |timeout| {
            let creds = self.credentials()?;
            self.backends
                .database
                .replica_status(&self.conn(node, creds.as_ref(), timeout))
        })
    }

    /// Databases present on the node.
    pub fn list_databases(&self, node: &Node, policy: &CallPolicy) -> Result<Vec<String>> {
        self.probe_with_retry(node, "list databases", policy, |timeout| {
            let creds = self.credentials()?;
            self.backends
                .database
                .list_databases(&self.conn(node, creds.as_ref(), timeout))
        })
    }

    /// Document count of one database.
    pub fn count_documents(
        &self,
        node: &Node,
        database: &str,
        policy: &CallPolicy,
    ) -> Result<u64> {
        self.probe_with_retry(node, "count documents", policy, |timeout| {
            let creds = self.credentials()?;
            self.backends
                .database
                .count_documents(&self.conn(node, creds.as_ref(), timeout), database)
        })
    }

    /// Disk usage of the filesystem holding `path`, in percent.
    pub fn disk_usage(&self, node: &Node, path: &str, policy: &CallPolicy) -> Result<u8> {
        let stdout = self.read(node, &format!("df -P {}", shell_quote(path)), policy)?;
        parse_df_percent(&stdout).ok_or_else(|| Error::RemoteError {
            node: node.id.clone(),
            code: 0,
            stderr: format!("unexpected df output: {}", stdout.trim()),
        })
    }

    /// Probe the full observed state used by convergence.
    pub fn observe(
        &self,
        node: &Node,
        desired: &DesiredConfig,
        policy: &CallPolicy,
    ) -> Result<ObservedState> {
        let container = self.container_state(node, policy)?;
        let config = self.read_optional_file(node, &desired.config_path, policy)?;

        let mut observed = ObservedState {
            container,
            config,
            root_user_present: None,
            replica: None,
        };

        if !observed.container.running {
            return Ok(observed);
        }

        if desired.auth.enabled {
            observed.root_user_present = Some(self.root_user_present(node, policy)?);
        }

        if desired.replica_set.is_some() {
            observed.replica = self.replica_membership(node, policy)?;
        }

        Ok(observed)
    }

    fn read_optional_file(
        &self,
        node: &Node,
        path: &str,
        policy: &CallPolicy,
    ) -> Result<Option<String>> {
        let quoted = shell_quote(path);
        let command = format!("test -f {quoted} || exit 3; cat {quoted}");
        self.probe_with_retry(node, "read file", policy, |timeout| {
            let output = self.backends.remote.exec(node, &command, timeout)?;
            match output.code {
                0 => Ok(Some(output.stdout)),
                3 => Ok(None),
                code => Err(remote_error(node, code, &output.stderr)),
            }
        })
    }

    fn probe_with_retry<T>(
        &self,
        node: &Node,
        what: &str,
        policy: &CallPolicy,
        mut probe: impl FnMut(Duration) -> Result<T>,
    ) -> Result<T> {
        let label = format!("{}: {}", node.id, what);
        let callback = LogCallback { label: &label };
        with_retry(&policy.retry, Some(&callback), || probe(policy.timeout))
    }

    /// Query anonymously first; on an authorization error, retry the same
    /// attempt with root credentials.
    fn query_with_auth_fallback<T>(
        &self,
        node: &Node,
        what: &str,
        policy: &CallPolicy,
        query: impl Fn(&DbConn<'_>) -> Result<T>,
    ) -> Result<T> {
        self.probe_with_retry(node, what, policy, |timeout| {
            match query(&self.conn(node, None, timeout)) {
                Err(Error::AuthFailed { .. }) if self.auth.enabled => {
                    let creds = self.credentials()?;
                    query(&self.conn(node, creds.as_ref(), timeout))
                }
                other => other,
            }
        })
    }

    /// Resolve root credentials at the moment of use.
    fn credentials(&self) -> Result<Option<Credentials>> {
        if !self.auth.enabled {
            return Ok(None);
        }
        let reference = self.auth.root_password_ref.as_deref().ok_or_else(|| {
            Error::precondition("authorization is enabled but no root_password_ref is set")
        })?;
        let password = self.backends.secrets.resolve(reference)?;
        Ok(Some(Credentials {
            user: self.auth.root_user.clone(),
            password,
        }))
    }

    fn conn<'a>(
        &'a self,
        node: &'a Node,
        credentials: Option<&'a Credentials>,
        timeout: Duration,
    ) -> DbConn<'a> {
        DbConn {
            node,
            container: &self.container,
            credentials,
            timeout,
        }
    }
}

fn remote_error(node: &Node, code: i32, stderr: &str) -> Error {
    Error::RemoteError {
        node: node.id.clone(),
        code,
        stderr: stderr.trim().to_string(),
    }
}

/// Extract the use% column from POSIX `df -P` output.
pub fn parse_df_percent(stdout: &str) -> Option<u8> {
    let line = stdout.lines().nth(1)?;
    let caps = DF_PERCENT.captures(line)?;
    caps[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFleet;
    use crate::types::Node;

    fn fast_policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(1),
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(2),
            },
        }
    }

    #[test]
    fn test_parse_df_percent() {
        let out = "Filesystem     1024-blocks     Used Available Capacity Mounted on\n\
                   /dev/sda1        102400000 43008000  59392000      42% /var/lib\n";
        assert_eq!(parse_df_percent(out), Some(42));
        assert_eq!(parse_df_percent("garbage"), None);
    }

    #[test]
    fn test_dry_run_never_reaches_node() {
        let fleet = FakeFleet::new(&["db1"]);
        let desired = DesiredConfig::new("7.0.5");
        let executor = NodeExecutor::new(fleet.backends(), &desired).with_dry_run(true);
        let node = Node::data("db1", "db1");

        let result = executor
            .execute(
                &node,
                &UnitOfWork::RestartContainer {
                    name: "mongodb".into(),
                },
                &fast_policy(),
            )
            .unwrap();

        assert!(result.would_change);
        assert!(!result.changed);
        assert!(fleet.mutations().is_empty());
    }

    #[test]
    fn test_unreachable_is_retried_then_surfaces() {
        let fleet = FakeFleet::new(&["db1"]);
        fleet.set_reachable("db1", false);
        let desired = DesiredConfig::new("7.0.5");
        let executor = NodeExecutor::new(fleet.backends(), &desired);
        let node = Node::data("db1", "db1");

        let err = executor
            .execute(
                &node,
                &UnitOfWork::Command {
                    command: "true".into(),
                },
                &fast_policy(),
            )
            .unwrap_err();

        assert!(matches!(err, Error::Unreachable { .. }));
        assert_eq!(fleet.attempts("db1"), 3);
    }

    #[test]
    fn test_remote_error_not_retried() {
        let fleet = FakeFleet::new(&["db1"]);
        let desired = DesiredConfig::new("7.0.5");
        let executor = NodeExecutor::new(fleet.backends(), &desired);
        let node = Node::data("db1", "db1");

        let err = executor
            .execute(
                &node,
                &UnitOfWork::Command {
                    command: "false".into(),
                },
                &fast_policy(),
            )
            .unwrap_err();

        assert!(matches!(err, Error::RemoteError { code: 1, .. }));
        assert_eq!(fleet.attempts("db1"), 1);
    }

    #[test]
    fn test_observe_fresh_node() {
        let fleet = FakeFleet::new(&["db1"]);
        let desired = DesiredConfig::new("7.0.5");
        let executor = NodeExecutor::new(fleet.backends(), &desired);

        let observed = executor
            .observe(&Node::data("db1", "db1"), &desired, &fast_policy())
            .unwrap();

        assert!(!observed.container.running);
        assert!(observed.config.is_none());
        assert!(observed.replica.is_none());
    }

    #[test]
    fn test_missing_password_ref_is_precondition() {
        let fleet = FakeFleet::new(&["db1"]);
        let mut desired = DesiredConfig::new("7.0.5");
        desired.auth.enabled = true;
        let executor = NodeExecutor::new(fleet.backends(), &desired);

        let err = executor
            .list_databases(&Node::data("db1", "db1"), &fast_policy())
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    fn secured_node(fleet: &FakeFleet, users: &[&str]) {
        fleet.start("db1", &[]);
        fleet.with_node("db1", |n| {
            n.auth_enforced = true;
            n.users = users.iter().map(|u| (*u).to_string()).collect();
        });
    }

    fn secured_config() -> DesiredConfig {
        let mut desired = DesiredConfig::new("7.0.5");
        desired.auth.enabled = true;
        desired.auth.root_password_ref = Some("env:ROOT_PW".into());
        desired
    }

    #[test]
    fn test_observe_falls_back_to_root_credentials() {
        let fleet = FakeFleet::new(&["db1"]);
        secured_node(&fleet, &["admin"]);
        let desired = secured_config();
        let executor = NodeExecutor::new(fleet.backends(), &desired);

        let observed = executor
            .observe(&Node::data("db1", "db1"), &desired, &fast_policy())
            .unwrap();

        assert_eq!(observed.root_user_present, Some(true));
        let checks = fleet.calls().iter().filter(|c| c.op == "user_exists").count();
        assert_eq!(checks, 2);
    }

    #[test]
    fn test_root_user_absent_under_localhost_exception() {
        let fleet = FakeFleet::new(&["db1"]);
        secured_node(&fleet, &[]);
        let desired = secured_config();
        let executor = NodeExecutor::new(fleet.backends(), &desired);

        let present = executor
            .root_user_present(&Node::data("db1", "db1"), &fast_policy())
            .unwrap();

        assert!(!present);
    }

    #[test]
    fn test_ping_needs_no_credentials() {
        let fleet = FakeFleet::new(&["db1"]);
        fleet.start("db1", &[]);
        let mut desired = DesiredConfig::new("7.0.5");
        desired.auth.enabled = true;
        let executor = NodeExecutor::new(fleet.backends(), &desired);

        let health = executor.ping(&Node::data("db1", "db1"), &fast_policy()).unwrap();
        assert_eq!(health, Health::Healthy);
    }
}
