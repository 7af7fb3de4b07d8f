//! Database primitives via `mongosh`, `mongodump`, and `mongorestore`
//! executed inside the node's container.

use fleetkit::{
    CommandOutput, DatabaseClient, DbConn, DumpScope, Error, Health, Node, NodeRole, RemoteExec,
    ReplicaRole, ReplicaSetSpec, ReplicaStatus, Result, Secret, shell_quote,
};
use serde::Deserialize;
use std::sync::Arc;

/// Databases the server manages itself; never dumped or reported.
const SYSTEM_DATABASES: &[&str] = &["admin", "config", "local"];

/// Exit code the login prelude uses when authentication is rejected.
const AUTH_EXIT: i32 = 18;

/// Set name, state, and lag of this member. Without the privileges for
/// `rs.status()` (no user exists yet) it falls back to `hello`, which
/// anyone may run but which carries no lag.
const REPLICA_STATUS_JS: &str = r"
try {
  const s = rs.status();
  const me = s.members.find(m => m.self);
  const primary = s.members.find(m => m.stateStr === 'PRIMARY');
  const lag = primary && me.optimeDate && primary.optimeDate
    ? Math.max(0, Math.round((primary.optimeDate - me.optimeDate) / 1000))
    : null;
  print(JSON.stringify({ set: s.set, state: me.stateStr, lag: lag }));
} catch (e) {
  if (e.code === 94 || e.code === 76) {
    print('null');
  } else if (e.code === 13) {
    const h = db.hello();
    const state = h.isWritablePrimary ? 'PRIMARY'
      : h.arbiterOnly ? 'ARBITER'
      : h.secondary ? 'SECONDARY' : 'OTHER';
    print(h.setName === undefined
      ? 'null'
      : JSON.stringify({ set: h.setName, state: state, lag: null }));
  } else {
    throw e;
  }
}";

/// [`DatabaseClient`] over a [`RemoteExec`] and `docker exec`.
pub struct MongoClient {
    remote: Arc<dyn RemoteExec>,
}

#[derive(Debug, Deserialize)]
struct RsStatus {
    set: String,
    state: String,
    lag: Option<u64>,
}

impl MongoClient {
    pub fn new(remote: Arc<dyn RemoteExec>) -> Self {
        Self { remote }
    }

    /// Feed `script` to `mongosh` on stdin, logging in first when the
    /// connection carries credentials.
    fn mongosh(&self, conn: &DbConn<'_>, script: &str) -> Result<CommandOutput> {
        let command = format!(
            "docker exec -i {} mongosh --quiet --port {}",
            shell_quote(conn.container),
            conn.node.port
        );
        let input = mongosh_input(conn, script);
        let output =
            self.remote
                .exec_with_input(conn.node, &command, input.as_bytes(), conn.timeout)?;
        if output.code == AUTH_EXIT || is_auth_failure(&output.stderr) {
            return Err(auth_failed(conn.node, &output));
        }
        Ok(output)
    }

    fn eval(&self, conn: &DbConn<'_>, script: &str) -> Result<String> {
        let output = self.mongosh(conn, script)?;
        check(conn.node, &output)?;
        Ok(last_line(&output.stdout).to_string())
    }

    /// Run `mongodump` or `mongorestore` inside the container. The password
    /// goes into a private config file written from stdin and removed once
    /// the tool exits.
    fn tool(
        &self,
        conn: &DbConn<'_>,
        tool: &str,
        args: &str,
        redirect: &str,
    ) -> Result<CommandOutput> {
        let container = shell_quote(conn.container);
        let mut command = format!("docker exec -i {container} {tool} --port {}", conn.node.port);

        let config = match conn.credentials {
            Some(creds) => {
                let path = format!("/tmp/.dbfleet-{tool}-{}.yaml", conn.node.port);
                let write = format!(
                    "docker exec -i {container} sh -c {}",
                    shell_quote(&format!("umask 077 && cat > {path}"))
                );
                let yaml = format!("password: {}\n", js_string(creds.password.expose()));
                let output =
                    self.remote
                        .exec_with_input(conn.node, &write, yaml.as_bytes(), conn.timeout)?;
                check(conn.node, &output)?;
                command.push_str(&format!(
                    " --username {} --authenticationDatabase admin --config {path}",
                    shell_quote(&creds.user)
                ));
                Some(path)
            }
            None => None,
        };
        command.push_str(&format!(" {args}{redirect}"));

        let output = self.remote.exec(conn.node, &command, conn.timeout);
        if let Some(path) = config {
            let cleanup = format!("docker exec {container} rm -f {path}");
            if let Err(e) = self.remote.exec(conn.node, &cleanup, conn.timeout) {
                log::warn!("{}: failed to remove {}: {}", conn.node.id, path, e);
            }
        }
        output
    }

    /// Whether the node is a replica-set member (oplog available).
    fn in_replica_set(&self, conn: &DbConn<'_>) -> Result<bool> {
        Ok(self.replica_status(conn)?.is_some())
    }
}

impl DatabaseClient for MongoClient {
    fn ping(&self, conn: &DbConn<'_>) -> Result<Health> {
        let output = self.mongosh(conn, "print(db.adminCommand({ ping: 1 }).ok)")?;
        Ok(if output.success() && last_line(&output.stdout) == "1" {
            Health::Healthy
        } else {
            Health::Unhealthy
        })
    }

    fn replica_status(&self, conn: &DbConn<'_>) -> Result<Option<ReplicaStatus>> {
        let out = self.eval(conn, REPLICA_STATUS_JS)?;
        parse_replica_status(&out).map_err(|e| Error::RemoteError {
            node: conn.node.id.clone(),
            code: 0,
            stderr: format!("unexpected replica status output: {e}"),
        })
    }

    fn user_exists(&self, conn: &DbConn<'_>, user: &str) -> Result<bool> {
        let script = format!(
            "print(db.getSiblingDB('admin').getUser({}) !== null)",
            js_string(user)
        );
        Ok(self.eval(conn, &script)? == "true")
    }

    fn create_user(
        &self,
        conn: &DbConn<'_>,
        user: &str,
        password: &Secret,
        role: &str,
    ) -> Result<()> {
        let script = format!(
            "db.getSiblingDB('admin').createUser({{ user: {}, pwd: {}, roles: [{{ role: {}, db: 'admin' }}] }})",
            js_string(user),
            js_string(password.expose()),
            js_string(role)
        );
        self.eval(conn, &script).map(|_| ())
    }

    fn initiate_replica_set(&self, conn: &DbConn<'_>, spec: &ReplicaSetSpec) -> Result<()> {
        let script = format!(
            "rs.initiate({{ _id: {}, members: [{{ _id: 0, host: {} }}] }})",
            js_string(&spec.name),
            js_string(&conn.node.address())
        );
        self.eval(conn, &script).map(|_| ())
    }

    fn add_replica_member(&self, conn: &DbConn<'_>, member: &Node) -> Result<()> {
        self.eval(conn, &add_member_js(member)).map(|_| ())
    }

    fn dump(&self, conn: &DbConn<'_>, scope: &DumpScope, archive: &str) -> Result<Vec<String>> {
        let (args, databases) = match scope {
            DumpScope::Full => {
                let databases = self.list_databases(conn)?;
                let oplog = if self.in_replica_set(conn)? { " --oplog" } else { "" };
                (format!("--archive{oplog}"), databases)
            }
            DumpScope::Database(db) => {
                (format!("--archive --db {}", shell_quote(db)), vec![db.clone()])
            }
        };
        let redirect = format!(" > {}", shell_quote(archive));
        let output = self.tool(conn, "mongodump", &args, &redirect)?;
        check(conn.node, &output)?;
        Ok(databases)
    }

    fn restore(
        &self,
        conn: &DbConn<'_>,
        scope: &DumpScope,
        archive: &str,
        compressed: bool,
        drop_existing: bool,
    ) -> Result<()> {
        let mut args = String::from("--archive");
        if compressed {
            args.push_str(" --gzip");
        }
        if drop_existing {
            args.push_str(" --drop");
        }
        match scope {
            DumpScope::Full => {
                if self.in_replica_set(conn)? {
                    args.push_str(" --oplogReplay");
                }
            }
            DumpScope::Database(db) => {
                args.push_str(&format!(" --nsInclude {}", shell_quote(&format!("{db}.*"))));
            }
        }
        let redirect = format!(" < {}", shell_quote(archive));
        let output = self.tool(conn, "mongorestore", &args, &redirect)?;
        check(conn.node, &output)
    }

    fn drop_database(&self, conn: &DbConn<'_>, database: &str) -> Result<()> {
        let script = format!("db.getSiblingDB({}).dropDatabase()", js_string(database));
        self.eval(conn, &script).map(|_| ())
    }

    fn list_databases(&self, conn: &DbConn<'_>) -> Result<Vec<String>> {
        let out = self.eval(
            conn,
            "print(JSON.stringify(db.adminCommand({ listDatabases: 1, nameOnly: true }).databases.map(d => d.name)))",
        )?;
        let names: Vec<String> = serde_json::from_str(&out)?;
        Ok(names
            .into_iter()
            .filter(|n| !SYSTEM_DATABASES.contains(&n.as_str()))
            .collect())
    }

    fn count_documents(&self, conn: &DbConn<'_>, database: &str) -> Result<u64> {
        let script = format!(
            "const d = db.getSiblingDB({}); let n = 0; \
             d.getCollectionNames().forEach(c => {{ \
             n += d.getCollection(c).countDocuments({{}}); }}); print(n)",
            js_string(database)
        );
        let out = self.eval(conn, &script)?;
        out.parse().map_err(|_| Error::RemoteError {
            node: conn.node.id.clone(),
            code: 0,
            stderr: format!("unexpected document count: {out}"),
        })
    }
}

/// Script text for `mongosh`: an optional login followed by `script`, with
/// any uncaught error turned into a non-zero exit.
fn mongosh_input(conn: &DbConn<'_>, script: &str) -> String {
    let mut input = String::new();
    if let Some(creds) = conn.credentials {
        input.push_str(&format!(
            "try {{ db.getSiblingDB('admin').auth({}, {}); }} catch (e) {{ \
             console.error('Authentication failed: ' + e.message); quit({AUTH_EXIT}); }}\n",
            js_string(&creds.user),
            js_string(creds.password.expose())
        ));
    }
    input.push_str(&format!(
        "try {{\n{script}\n}} catch (e) {{ console.error(String(e)); quit(1); }}\n"
    ));
    input
}

/// A JavaScript string literal (JSON strings are valid JS).
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn add_member_js(member: &Node) -> String {
    let host = js_string(&member.address());
    match (member.role, member.priority) {
        (NodeRole::Arbiter, _) => format!("rs.addArb({host})"),
        (NodeRole::Data, Some(priority)) => {
            format!("rs.add({{ host: {host}, priority: {priority} }})")
        }
        (NodeRole::Data, None) => format!("rs.add({{ host: {host} }})"),
    }
}

fn last_line(stdout: &str) -> &str {
    stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

fn is_auth_failure(stderr: &str) -> bool {
    ["Authentication failed", "requires authentication", "not authorized"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

fn auth_failed(node: &Node, output: &CommandOutput) -> Error {
    Error::AuthFailed {
        node: node.id.clone(),
        message: output.stderr.trim().to_string(),
    }
}

fn check(node: &Node, output: &CommandOutput) -> Result<()> {
    if output.success() {
        Ok(())
    } else if is_auth_failure(&output.stderr) {
        Err(auth_failed(node, output))
    } else {
        Err(Error::RemoteError {
            node: node.id.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

fn parse_replica_status(
    out: &str,
) -> std::result::Result<Option<ReplicaStatus>, serde_json::Error> {
    let Some(status) = serde_json::from_str::<Option<RsStatus>>(out)? else {
        return Ok(None);
    };
    let role = match status.state.as_str() {
        "PRIMARY" => ReplicaRole::Primary,
        "SECONDARY" => ReplicaRole::Secondary,
        "ARBITER" => ReplicaRole::Arbiter,
        "STARTUP" | "STARTUP2" => ReplicaRole::Startup,
        _ => ReplicaRole::Other,
    };
    Ok(Some(ReplicaStatus {
        set_name: status.set,
        role,
        lag_secs: if role == ReplicaRole::Secondary {
            status.lag
        } else {
            None
        },
    }))
}
