//! In-memory fleet used by the unit tests.
//!
//! One `FakeFleet` implements every collaborator trait over a shared map of
//! simulated nodes, records each call, and can inject failures.

use crate::backend::{
    Backends, CommandOutput, ContainerRuntime, ContainerSpec, DatabaseClient, DbConn, DumpScope,
    RemoteExec, Secret, SecretResolver,
};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::types::{
    ContainerState, Environment, Health, Node, NodeRole, ReplicaRole, ReplicaSetSpec,
    ReplicaStatus,
};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeNode {
    pub reachable: bool,
    pub container: ContainerState,
    pub files: BTreeMap<String, Vec<u8>>,
    pub users: BTreeSet<String>,
    pub replica: Option<ReplicaStatus>,
    pub databases: BTreeMap<String, u64>,
    pub disk_percent: u8,
    pub restarts: u32,
    /// Pings answer `Unhealthy` this many more times
    pub unhealthy_pings: u32,
    /// Config file the running container bind-mounts
    pub mounted_config: Option<String>,
    /// Whether the mounted config turns authorization on
    pub auth_enforced: bool,
    /// Directories created on the host by a bind mount of a missing file
    pub dirs: BTreeSet<String>,
    /// Status polls left before a freshly initiated member is elected
    pub election_polls: u32,
}

impl Default for FakeNode {
    fn default() -> Self {
        Self {
            reachable: true,
            container: ContainerState::default(),
            files: BTreeMap::new(),
            users: BTreeSet::new(),
            replica: None,
            databases: BTreeMap::new(),
            disk_percent: 40,
            restarts: 0,
            unhealthy_pings: 0,
            mounted_config: None,
            auth_enforced: false,
            dirs: BTreeSet::new(),
            election_polls: 0,
        }
    }
}

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Unreachable,
    Auth,
    Remote(i32),
}

#[derive(Debug)]
struct Injected {
    node: String,
    op: String,
    fault: Fault,
    remaining: Option<u32>,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub node: String,
    pub op: String,
    pub mutating: bool,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, FakeNode>,
    calls: Vec<Call>,
    faults: Vec<Injected>,
    cancel_on: Option<(String, CancellationToken)>,
}

#[derive(Clone, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<State>>,
}

impl FakeFleet {
    pub fn new(ids: &[&str]) -> Self {
        let fleet = Self::default();
        {
            let mut state = fleet.lock();
            for id in ids {
                state.nodes.insert((*id).to_string(), FakeNode::default());
            }
        }
        fleet
    }

    pub fn backends(&self) -> Backends {
        Backends {
            remote: Arc::new(self.clone()),
            database: Arc::new(self.clone()),
            containers: Arc::new(self.clone()),
            secrets: Arc::new(self.clone()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node(&self, id: &str) -> FakeNode {
        self.lock().nodes.get(id).cloned().unwrap_or_default()
    }

    pub fn with_node(&self, id: &str, f: impl FnOnce(&mut FakeNode)) {
        let mut state = self.lock();
        f(state.nodes.entry(id.to_string()).or_default());
    }

    /// Put a running database with the given contents on `id`.
    pub fn start(&self, id: &str, databases: &[(&str, u64)]) {
        self.with_node(id, |n| {
            n.container = ContainerState {
                exists: true,
                running: true,
                image: Some("mongo:7.0.5".into()),
                healthy: Some(true),
            };
            n.databases = databases.iter().map(|(k, v)| ((*k).to_string(), *v)).collect();
        });
    }

    pub fn set_reachable(&self, id: &str, reachable: bool) {
        self.with_node(id, |n| n.reachable = reachable);
    }

    /// Make `op` on `node` fail, `times` times or forever.
    pub fn inject(&self, node: &str, op: &str, fault: Fault, times: Option<u32>) {
        self.lock().faults.push(Injected {
            node: node.to_string(),
            op: op.to_string(),
            fault,
            remaining: times,
        });
    }

    /// Cancel `token` as soon as any node receives `op`.
    pub fn cancel_on(&self, op: &str, token: CancellationToken) {
        self.lock().cancel_on = Some((op.to_string(), token));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Mutating calls as `node:op`.
    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.mutating)
            .map(|c| format!("{}:{}", c.node, c.op))
            .collect()
    }

    /// Number of calls (of any kind) that reached `node`.
    pub fn attempts(&self, node: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.node == node).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Record the call, then apply reachability and injected faults.
    fn enter(&self, node: &str, op: &str, mutating: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call {
            node: node.to_string(),
            op: op.to_string(),
            mutating,
        });
        if let Some((trigger, token)) = &state.cancel_on
            && trigger == op
        {
            token.cancel();
        }

        let reachable = state.nodes.get(node).is_some_and(|n| n.reachable);
        if !reachable {
            return Err(Error::unreachable(node, "connection timed out"));
        }

        let fault = state.faults.iter_mut().find(|f| {
            f.node == node && f.op == op && f.remaining.is_none_or(|r| r > 0)
        });
        if let Some(injected) = fault {
            if let Some(remaining) = injected.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(match injected.fault {
                Fault::Unreachable => Error::unreachable(node, "connection reset"),
                Fault::Auth => Error::AuthFailed {
                    node: node.to_string(),
                    message: "Authentication failed".into(),
                },
                Fault::Remote(code) => Error::RemoteError {
                    node: node.to_string(),
                    code,
                    stderr: format!("{op} failed"),
                },
            });
        }
        Ok(())
    }

    /// Like `enter`, plus a running container and mongod's access rules:
    /// with authorization on, anonymous clients may only ping, read the
    /// replica view, and (while no user exists) initiate and create users.
    fn db_enter(&self, conn: &DbConn<'_>, op: &str, mutating: bool) -> Result<()> {
        let node = conn.node.id.as_str();
        self.enter(node, op, mutating)?;
        let fake = self.node(node);
        if !fake.container.running {
            return Err(Error::unreachable(node, "connection refused"));
        }
        if fake.auth_enforced && !matches!(op, "ping" | "replica_status") {
            let allowed = match conn.credentials {
                Some(creds) => fake.users.contains(&creds.user),
                None => fake.users.is_empty() && matches!(op, "create_user" | "initiate"),
            };
            if !allowed {
                return Err(Error::AuthFailed {
                    node: node.to_string(),
                    message: format!("{op} requires authentication"),
                });
            }
        }
        Ok(())
    }
}

fn first_quoted(command: &str) -> Option<String> {
    let start = command.find('\'')? + 1;
    let end = command[start..].find('\'')? + start;
    Some(command[start..end].to_string())
}

fn enforces_auth(node: &FakeNode) -> bool {
    node.mounted_config
        .as_ref()
        .and_then(|path| node.files.get(path))
        .is_some_and(|bytes| String::from_utf8_lossy(bytes).contains("authorization: enabled"))
}

fn remote(node: &str, code: i32, stderr: &str) -> Error {
    Error::RemoteError {
        node: node.to_string(),
        code,
        stderr: stderr.to_string(),
    }
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("gzip in memory");
    encoder.finish().expect("gzip in memory")
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

impl RemoteExec for FakeFleet {
    fn exec(&self, node: &Node, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        let mutating = ["gzip", "rm", "mkdir"]
            .iter()
            .any(|c| command.starts_with(c));
        self.enter(&node.id, "exec", mutating)?;

        let mut state = self.lock();
        let fake = state.nodes.entry(node.id.clone()).or_default();
        let path = first_quoted(command).unwrap_or_default();
        let ok = |stdout: String| CommandOutput {
            stdout,
            stderr: String::new(),
            code: 0,
        };
        let fail = |code: i32, stderr: &str| CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            code,
        };

        let output = if command == "true" || command.starts_with("mkdir -p") {
            ok(String::new())
        } else if command == "false" {
            fail(1, "false")
        } else if command.starts_with("test -f") {
            match fake.files.get(&path) {
                Some(bytes) => ok(String::from_utf8_lossy(bytes).to_string()),
                None => fail(3, ""),
            }
        } else if command.starts_with("gzip") {
            match fake.files.remove(&path) {
                Some(bytes) => {
                    fake.files.insert(format!("{path}.gz"), gzip(&bytes));
                    ok(String::new())
                }
                None => fail(1, "gzip: No such file or directory"),
            }
        } else if command.starts_with("rm -f") {
            fake.files.remove(&path);
            ok(String::new())
        } else if command.starts_with("df -P") {
            ok(format!(
                "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                 /dev/sda1 100 {p} {r} {p}% {path}\n",
                p = fake.disk_percent,
                r = 100 - u32::from(fake.disk_percent),
            ))
        } else {
            fail(127, "command not found")
        };
        Ok(output)
    }

    fn write_file(
        &self,
        node: &Node,
        contents: &[u8],
        remote: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.enter(&node.id, "write_file", true)?;
        if self.node(&node.id).dirs.contains(remote) {
            return Err(self::remote(&node.id, 1, "Is a directory"));
        }
        self.with_node(&node.id, |n| {
            n.files.insert(remote.to_string(), contents.to_vec());
        });
        Ok(())
    }

    fn exec_with_input(
        &self,
        node: &Node,
        command: &str,
        _input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.exec(node, command, timeout)
    }

    fn push_file(&self, node: &Node, local: &Path, remote: &str, _timeout: Duration) -> Result<()> {
        self.enter(&node.id, "push_file", true)?;
        let bytes = std::fs::read(local)?;
        self.with_node(&node.id, |n| {
            n.files.insert(remote.to_string(), bytes);
        });
        Ok(())
    }

    fn pull_file(
        &self,
        node: &Node,
        remote_path: &str,
        local: &Path,
        _timeout: Duration,
    ) -> Result<u64> {
        self.enter(&node.id, "pull_file", false)?;
        let bytes = self
            .node(&node.id)
            .files
            .get(remote_path)
            .cloned()
            .ok_or_else(|| remote(&node.id, 1, "No such file or directory"))?;
        std::fs::write(local, &bytes)?;
        Ok(bytes.len() as u64)
    }
}

impl ContainerRuntime for FakeFleet {
    fn inspect(&self, node: &Node, _name: &str, _timeout: Duration) -> Result<ContainerState> {
        self.enter(&node.id, "inspect", false)?;
        Ok(self.node(&node.id).container)
    }

    fn ensure_running(
        &self,
        node: &Node,
        spec: &ContainerSpec,
        _timeout: Duration,
    ) -> Result<bool> {
        self.enter(&node.id, "ensure_running", true)?;
        let mut changed = false;
        self.with_node(&node.id, |n| {
            let current = n.container.image.as_deref() == Some(spec.image.as_str());
            if !(n.container.running && current) {
                // A bind mount of a missing file leaves a directory in its place
                if !n.files.contains_key(&spec.config_path) {
                    n.dirs.insert(spec.config_path.clone());
                }
                n.container = ContainerState {
                    exists: true,
                    running: true,
                    image: Some(spec.image.clone()),
                    healthy: Some(true),
                };
                n.mounted_config = Some(spec.config_path.clone());
                n.auth_enforced = enforces_auth(n);
                changed = true;
            }
        });
        Ok(changed)
    }

    fn restart(&self, node: &Node, _name: &str, _timeout: Duration) -> Result<()> {
        self.enter(&node.id, "restart", true)?;
        if !self.node(&node.id).container.exists {
            return Err(remote(&node.id, 1, "No such container"));
        }
        self.with_node(&node.id, |n| {
            n.restarts += 1;
            n.container.running = true;
            n.auth_enforced = enforces_auth(n);
        });
        Ok(())
    }

    fn stop(&self, node: &Node, _name: &str, _timeout: Duration) -> Result<()> {
        self.enter(&node.id, "stop", true)?;
        self.with_node(&node.id, |n| n.container.running = false);
        Ok(())
    }
}

impl DatabaseClient for FakeFleet {
    fn ping(&self, conn: &DbConn<'_>) -> Result<Health> {
        self.db_enter(conn, "ping", false)?;
        let mut health = Health::Healthy;
        self.with_node(&conn.node.id, |n| {
            if n.unhealthy_pings > 0 {
                n.unhealthy_pings -= 1;
                health = Health::Unhealthy;
            }
        });
        Ok(health)
    }

    fn replica_status(&self, conn: &DbConn<'_>) -> Result<Option<ReplicaStatus>> {
        self.db_enter(conn, "replica_status", false)?;
        let mut status = None;
        self.with_node(&conn.node.id, |n| {
            status = n.replica.clone();
            if n.election_polls > 0 {
                n.election_polls -= 1;
                if n.election_polls == 0
                    && let Some(replica) = n.replica.as_mut()
                {
                    replica.role = ReplicaRole::Primary;
                }
            }
        });
        Ok(status)
    }

    fn user_exists(&self, conn: &DbConn<'_>, user: &str) -> Result<bool> {
        self.db_enter(conn, "user_exists", false)?;
        Ok(self.node(&conn.node.id).users.contains(user))
    }

    fn create_user(
        &self,
        conn: &DbConn<'_>,
        user: &str,
        _password: &Secret,
        _role: &str,
    ) -> Result<()> {
        self.db_enter(conn, "create_user", true)?;
        let fake = self.node(&conn.node.id);
        if fake.users.contains(user) {
            return Err(remote(&conn.node.id, 51003, "user already exists"));
        }
        if fake.replica.is_some_and(|r| r.role != ReplicaRole::Primary) {
            return Err(remote(&conn.node.id, 10107, "NotWritablePrimary"));
        }
        self.with_node(&conn.node.id, |n| {
            n.users.insert(user.to_string());
        });
        Ok(())
    }

    fn initiate_replica_set(&self, conn: &DbConn<'_>, spec: &ReplicaSetSpec) -> Result<()> {
        self.db_enter(conn, "initiate", true)?;
        if self.node(&conn.node.id).replica.is_some() {
            return Err(remote(&conn.node.id, 23, "already initialized"));
        }
        self.with_node(&conn.node.id, |n| {
            n.replica = Some(ReplicaStatus {
                set_name: spec.name.clone(),
                role: ReplicaRole::Secondary,
                lag_secs: Some(0),
            });
            n.election_polls = 1;
        });
        Ok(())
    }

    fn add_replica_member(&self, conn: &DbConn<'_>, member: &Node) -> Result<()> {
        self.db_enter(conn, "add_member", true)?;
        let source = self.node(&conn.node.id);
        let primary = source
            .replica
            .filter(|r| r.role == ReplicaRole::Primary)
            .ok_or_else(|| remote(&conn.node.id, 10107, "not primary"))?;
        let role = match member.role {
            NodeRole::Arbiter => ReplicaRole::Arbiter,
            NodeRole::Data => ReplicaRole::Secondary,
        };
        self.with_node(&member.id, |n| {
            n.replica = Some(ReplicaStatus {
                set_name: primary.set_name.clone(),
                role,
                lag_secs: (role == ReplicaRole::Secondary).then_some(1),
            });
            n.users.extend(source.users.iter().cloned());
        });
        Ok(())
    }

    fn dump(&self, conn: &DbConn<'_>, scope: &DumpScope, archive: &str) -> Result<Vec<String>> {
        self.db_enter(conn, "dump", true)?;
        let databases: BTreeMap<String, u64> = self
            .node(&conn.node.id)
            .databases
            .into_iter()
            .filter(|(name, _)| match scope {
                DumpScope::Full => true,
                DumpScope::Database(db) => name == db,
            })
            .collect();
        let bytes = serde_json::to_vec(&databases)?;
        self.with_node(&conn.node.id, |n| {
            n.files.insert(archive.to_string(), bytes);
        });
        Ok(databases.into_keys().collect())
    }

    fn restore(
        &self,
        conn: &DbConn<'_>,
        scope: &DumpScope,
        archive: &str,
        compressed: bool,
        drop_existing: bool,
    ) -> Result<()> {
        self.db_enter(conn, "restore", true)?;
        let raw = self
            .node(&conn.node.id)
            .files
            .get(archive)
            .cloned()
            .ok_or_else(|| remote(&conn.node.id, 1, "archive not found"))?;
        let bytes = if compressed { gunzip(&raw)? } else { raw };
        let contents: BTreeMap<String, u64> = serde_json::from_slice(&bytes)?;

        let selected: BTreeMap<String, u64> = match scope {
            DumpScope::Full => contents,
            DumpScope::Database(db) => {
                let docs = contents
                    .get(db)
                    .copied()
                    .ok_or_else(|| remote(&conn.node.id, 1, "database not in archive"))?;
                BTreeMap::from([(db.clone(), docs)])
            }
        };
        self.with_node(&conn.node.id, |n| {
            if drop_existing {
                n.databases.retain(|name, _| !selected.contains_key(name));
            }
            n.databases.extend(selected);
        });
        Ok(())
    }

    fn drop_database(&self, conn: &DbConn<'_>, database: &str) -> Result<()> {
        self.db_enter(conn, "drop_database", true)?;
        self.with_node(&conn.node.id, |n| {
            n.databases.remove(database);
        });
        Ok(())
    }

    fn list_databases(&self, conn: &DbConn<'_>) -> Result<Vec<String>> {
        self.db_enter(conn, "list_databases", false)?;
        Ok(self.node(&conn.node.id).databases.into_keys().collect())
    }

    fn count_documents(&self, conn: &DbConn<'_>, database: &str) -> Result<u64> {
        self.db_enter(conn, "count_documents", false)?;
        self.node(&conn.node.id)
            .databases
            .get(database)
            .copied()
            .ok_or_else(|| remote(&conn.node.id, 26, "ns not found"))
    }
}

impl SecretResolver for FakeFleet {
    fn resolve(&self, reference: &str) -> Result<Secret> {
        if reference.starts_with("env:") {
            Ok(Secret::new("s3cret"))
        } else {
            Err(Error::not_found(format!("secret {reference}")))
        }
    }
}

/// Environment over nodes whose host equals their id.
pub fn environment(
    name: &str,
    nodes: Vec<Node>,
    desired: crate::types::DesiredConfig,
) -> Environment {
    Environment {
        name: name.to_string(),
        nodes,
        desired,
    }
}
