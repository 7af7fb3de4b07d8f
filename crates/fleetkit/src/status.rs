//! Maintenance/status engine - read-only probe battery.
//!
//! Every probe runs on its own; a failing probe marks that check and the
//! node `failed` but never hides the results of the others.

use crate::backend::Backends;
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::executor::{CallPolicy, NodeExecutor};
use crate::outcome::{Check, CheckStatus, NodeOutcome, NodeStatus, OperationName, OperationResult};
use crate::pool::{DEFAULT_MAX_CONCURRENCY, map_bounded};
use crate::store::{ArtifactStore, BackupArtifact, EnvLocks};
use crate::types::{Environment, Health, Node, ReplicaRole};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Knobs for a status run.
#[derive(Debug, Clone)]
pub struct StatusOptions {
    pub max_concurrency: usize,
    pub policy: CallPolicy,
    /// Disk usage at or above this percentage is a warning
    pub disk_warn_percent: u8,
    /// Replication lag above this many seconds is a warning
    pub lag_warn_secs: u64,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            policy: CallPolicy::default(),
            disk_warn_percent: 85,
            lag_warn_secs: 10,
        }
    }
}

/// Produces status reports.
pub struct StatusEngine {
    backends: Backends,
    store: Arc<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<EnvLocks>,
    options: StatusOptions,
    cancel: CancellationToken,
}

impl StatusEngine {
    pub fn new(
        backends: Backends,
        store: Arc<dyn ArtifactStore>,
        clock: Arc<dyn Clock>,
        locks: Arc<EnvLocks>,
        options: StatusOptions,
    ) -> Self {
        Self {
            backends,
            store,
            clock,
            locks,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Probe every node of `env`.
    pub fn status_report(&self, env: &Environment) -> OperationResult {
        let executor = NodeExecutor::new(self.backends.clone(), &env.desired);
        let backups = self
            .locks
            .with_lock(&env.name, || self.store.list(&env.name))
            .map_err(|e| e.to_string());
        let now = self.clock.now();

        let nodes = map_bounded(&env.nodes, self.options.max_concurrency, |node| {
            if self.cancel.is_cancelled() {
                return NodeOutcome::skipped(&node.id, "cancelled before probing");
            }
            let checks = self.probe(&executor, env, node, &backups, now);
            summarize(node, checks)
        });

        OperationResult::new(OperationName::Maintenance, &env.name, nodes)
    }

    fn probe(
        &self,
        executor: &NodeExecutor,
        env: &Environment,
        node: &Node,
        backups: &Result<Vec<BackupArtifact>, String>,
        now: DateTime<Utc>,
    ) -> Vec<Check> {
        let policy = &self.options.policy;
        let mut checks = Vec::new();

        checks.push(match executor.reachable(node, policy) {
            Ok(()) => Check::pass("reachable", "yes"),
            Err(e) => Check::fail("reachable", e.to_string()),
        });

        checks.push(match executor.container_state(node, policy) {
            Ok(state) if !state.exists => Check::fail("container", "absent"),
            Ok(state) if !state.running => Check::fail("container", "stopped"),
            Ok(state) => {
                let image = state.image.clone().unwrap_or_else(|| "unknown image".into());
                match state.healthy {
                    Some(false) => {
                        Check::warn("container", format!("{image}, health check failing"))
                    }
                    _ => Check::pass("container", image),
                }
            }
            Err(e) => Check::fail("container", e.to_string()),
        });

        checks.push(match executor.ping(node, policy) {
            Ok(Health::Healthy) => Check::pass("ping", "healthy"),
            Ok(Health::Unhealthy) => Check::fail("ping", "unhealthy"),
            Err(e) => Check::fail("ping", e.to_string()),
        });

        checks.push(match executor.disk_usage(node, &env.desired.data_path, policy) {
            Ok(pct) if pct >= self.options.disk_warn_percent => {
                Check::warn("disk", format!("{pct}%"))
            }
            Ok(pct) => Check::pass("disk", format!("{pct}%")),
            Err(e) => Check::fail("disk", e.to_string()),
        });

        if let Some(replica) = &env.desired.replica_set {
            checks.push(match executor.replica_status(node, policy) {
                Ok(Some(status)) if status.set_name != replica.name => Check::warn(
                    "replica",
                    format!("member of {} instead of {}", status.set_name, replica.name),
                ),
                Ok(Some(status)) => match (status.role, status.lag_secs) {
                    (ReplicaRole::Secondary, Some(lag)) if lag > self.options.lag_warn_secs => {
                        Check::warn("replica", format!("secondary, lag {lag}s"))
                    }
                    (ReplicaRole::Secondary, Some(lag)) => {
                        Check::pass("replica", format!("secondary, lag {lag}s"))
                    }
                    (ReplicaRole::Startup | ReplicaRole::Other, _) => {
                        Check::warn("replica", status.role.to_string())
                    }
                    (role, _) => Check::pass("replica", role.to_string()),
                },
                Ok(None) => Check::warn("replica", format!("not a member of {}", replica.name)),
                Err(e) => Check::fail("replica", e.to_string()),
            });
        }

        if node.role.holds_data() {
            checks.push(match backups {
                Ok(all) => backup_check(all, node, env.desired.replica_set.is_some(), now),
                Err(e) => Check::fail("backups", e.clone()),
            });
        }

        checks
    }
}

/// Backups restorable onto `node`. Every member of a replica set holds the
/// same data, so a dump from any member counts for all of them.
fn backup_check(
    all: &[BackupArtifact],
    node: &Node,
    replicated: bool,
    now: DateTime<Utc>,
) -> Check {
    let covering: Vec<_> = all
        .iter()
        .filter(|a| replicated || a.covers(&node.id))
        .collect();
    match covering.last() {
        None => Check::warn("backups", "none"),
        Some(newest) => Check::pass(
            "backups",
            format!(
                "{} available, newest {} old",
                covering.len(),
                format_age(newest.age(now))
            ),
        ),
    }
}

/// Compact age such as `3d 4h`, `5h 12m`, or `40m`.
pub fn format_age(age: chrono::Duration) -> String {
    let minutes = age.num_minutes().max(0);
    let (days, hours, mins) = (minutes / 1440, (minutes % 1440) / 60, minutes % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}

fn summarize(node: &Node, checks: Vec<Check>) -> NodeOutcome {
    let failed: Vec<&str> = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Fail)
        .map(|c| c.name.as_str())
        .collect();
    let warnings = checks.iter().filter(|c| c.status == CheckStatus::Warn).count();

    let (status, message) = if !failed.is_empty() {
        (NodeStatus::Failed, format!("failed: {}", failed.join(", ")))
    } else if warnings > 0 {
        (NodeStatus::Ok, format!("{warnings} warning(s)"))
    } else {
        (NodeStatus::Ok, "all checks passed".to_string())
    };

    let mut outcome = NodeOutcome::new(&node.id, status, message);
    outcome.checks = checks;
    outcome
}
