//! Backup engine.
//!
//! One backup walks `Idle → Dumping → Compressing → Transferring →
//! RotatingRetention → Done`; any phase can end in `Failed`. Compression is
//! passed through when the policy disables it. Retention only runs after a
//! successful transfer.

use crate::backend::{Backends, DumpScope, shell_quote};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::executor::{CallPolicy, ExecOutput, NodeExecutor, UnitOfWork};
use crate::outcome::{NodeOutcome, NodeStatus, OperationName, OperationResult};
use crate::retention::rotate;
use crate::store::{ArtifactStore, BackupArtifact, EnvLocks, NewArtifact};
use crate::types::{BackupPolicy, Environment, Health, Node};
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::fmt;
use std::sync::Arc;

/// Where the backup state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Idle,
    Dumping,
    Compressing,
    Transferring,
    RotatingRetention,
    Done,
    Failed,
}

impl BackupPhase {
    /// The phase that follows on success.
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::Dumping,
            Self::Dumping => Self::Compressing,
            Self::Compressing => Self::Transferring,
            Self::Transferring => Self::RotatingRetention,
            Self::RotatingRetention | Self::Done => Self::Done,
            Self::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Dumping => "dumping",
            Self::Compressing => "compressing",
            Self::Transferring => "transferring",
            Self::RotatingRetention => "rotating retention",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Knobs for a backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Timeout and retry policy for each remote call
    pub policy: CallPolicy,
    /// Directory on the node where the dump is staged before transfer
    pub remote_staging_dir: String,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            policy: CallPolicy::default(),
            remote_staging_dir: "/tmp/dbfleet".to_string(),
        }
    }
}

/// A failure pinned to the phase it happened in.
struct PhaseError {
    phase: BackupPhase,
    error: Error,
}

/// State of one run.
struct BackupRun<'a> {
    environment: &'a str,
    phase: BackupPhase,
}

impl BackupRun<'_> {
    fn advance(&mut self) -> BackupPhase {
        let next = self.phase.next();
        log::debug!("backup {}: {} -> {}", self.environment, self.phase, next);
        self.phase = next;
        next
    }

    fn fail(&mut self, error: Error) -> PhaseError {
        let phase = self.phase;
        log::warn!("backup {} failed while {}: {}", self.environment, phase, error);
        self.phase = BackupPhase::Failed;
        PhaseError { phase, error }
    }
}

/// Takes consistent backups of an environment into an artifact store.
pub struct BackupEngine {
    backends: Backends,
    store: Arc<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<EnvLocks>,
    options: BackupOptions,
    cancel: CancellationToken,
}

impl BackupEngine {
    pub fn new(
        backends: Backends,
        store: Arc<dyn ArtifactStore>,
        clock: Arc<dyn Clock>,
        locks: Arc<EnvLocks>,
        options: BackupOptions,
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

    /// Back up `env` according to `policy`.
    pub fn backup(&self, env: &Environment, policy: &BackupPolicy) -> OperationResult {
        self.locks.with_lock(&env.name, || self.backup_locked(env, policy))
    }

    fn backup_locked(&self, env: &Environment, policy: &BackupPolicy) -> OperationResult {
        let executor = NodeExecutor::new(self.backends.clone(), &env.desired);
        let mut outcomes: Vec<NodeOutcome> = env
            .nodes
            .iter()
            .map(|n| NodeOutcome::skipped(&n.id, "not the dump source"))
            .collect();
        let mut result = OperationResult::new(OperationName::Backup, &env.name, Vec::new());

        if self.cancel.is_cancelled() {
            for outcome in &mut outcomes {
                outcome.message = "cancelled before dump".into();
            }
            result.nodes = outcomes;
            return result;
        }

        let (source_idx, source) = match self.select_source(&executor, env, &mut outcomes) {
            Some(found) => found,
            None => {
                for (outcome, node) in outcomes.iter_mut().zip(&env.nodes) {
                    if node.role.holds_data() {
                        outcome.status = NodeStatus::Failed;
                    }
                }
                result.notes.push("no data node answered; nothing was dumped".into());
                result.nodes = outcomes;
                return result;
            }
        };

        let mut run = BackupRun {
            environment: &env.name,
            phase: BackupPhase::Idle,
        };

        match self.execute(&executor, env, source, policy, &mut run) {
            Ok(artifact) => {
                outcomes[source_idx] = NodeOutcome::changed(
                    &source.id,
                    format!(
                        "backed up {} databases to {}",
                        artifact.databases.len(),
                        artifact.file_name
                    ),
                )
                .with_detail(
                    artifact
                        .checksum
                        .clone()
                        .map(|c| format!("blake3 {c}"))
                        .unwrap_or_default(),
                );

                run.advance();
                result.notes.extend(self.rotate(env, policy, &artifact));
                run.advance();
                result.artifact = Some(artifact);
            }
            Err(PhaseError { phase, error }) => {
                let outcome = NodeOutcome::failed(
                    &source.id,
                    format!("backup failed while {phase}: {error}"),
                );
                outcomes[source_idx] = match &error {
                    Error::RemoteError { stderr, .. } => outcome.with_detail(stderr.clone()),
                    _ => outcome,
                };
            }
        }

        result.nodes = outcomes;
        result
    }

    /// First data node, in inventory order, that answers a ping.
    fn select_source<'e>(
        &self,
        executor: &NodeExecutor,
        env: &'e Environment,
        outcomes: &mut [NodeOutcome],
    ) -> Option<(usize, &'e Node)> {
        for (idx, node) in env.nodes.iter().enumerate() {
            if !node.role.holds_data() {
                outcomes[idx].message = "arbiter holds no data".into();
                continue;
            }
            match executor.ping(node, &self.options.policy) {
                Ok(Health::Healthy) => return Some((idx, node)),
                Ok(Health::Unhealthy) => {
                    outcomes[idx].message = "unhealthy; not used as dump source".into();
                }
                Err(e) => {
                    outcomes[idx] = NodeOutcome::skipped(&node.id, "not used as dump source")
                        .with_detail(e.to_string());
                }
            }
        }
        None
    }

    fn execute(
        &self,
        executor: &NodeExecutor,
        env: &Environment,
        source: &Node,
        policy: &BackupPolicy,
        run: &mut BackupRun<'_>,
    ) -> std::result::Result<BackupArtifact, PhaseError> {
        let call = &self.options.policy;
        let timestamp = self.next_timestamp(&env.name).map_err(|e| run.fail(e))?;
        let file_name = crate::store::artifact_name(&env.name, timestamp, policy.compression);
        let dump_path = format!(
            "{}/{}",
            self.options.remote_staging_dir.trim_end_matches('/'),
            crate::store::artifact_name(&env.name, timestamp, false)
        );

        // Dumping
        run.advance();
        let databases = self
            .dump(executor, source, &dump_path)
            .map_err(|e| self.abort(executor, source, &dump_path, run, e))?;

        // Compressing
        run.advance();
        self.check_cancelled().map_err(|e| self.abort(executor, source, &dump_path, run, e))?;
        let remote_path = if policy.compression {
            executor
                .execute(
                    source,
                    &UnitOfWork::Command {
                        command: format!("gzip -f {}", shell_quote(&dump_path)),
                    },
                    call,
                )
                .map_err(|e| self.abort(executor, source, &dump_path, run, e))?;
            format!("{dump_path}.gz")
        } else {
            dump_path.clone()
        };

        // Transferring
        run.advance();
        self.check_cancelled().map_err(|e| self.abort(executor, source, &remote_path, run, e))?;
        let partial = self
            .store
            .partial_path(&env.name, &file_name)
            .map_err(|e| self.abort(executor, source, &remote_path, run, e))?;
        let committed = executor
            .execute(
                source,
                &UnitOfWork::PullFile {
                    remote: remote_path.clone(),
                    local: partial.clone(),
                },
                call,
            )
            .and_then(|_| {
                self.store.commit(
                    &partial,
                    &NewArtifact {
                        environment: env.name.clone(),
                        timestamp,
                        nodes: vec![source.id.clone()],
                        compressed: policy.compression,
                        databases,
                    },
                )
            });
        let artifact = match committed {
            Ok(artifact) => artifact,
            Err(e) => {
                self.store.discard(&partial);
                return Err(self.abort(executor, source, &remote_path, run, e));
            }
        };

        remove_remote(executor, source, &remote_path, call);
        Ok(artifact)
    }

    fn dump(&self, executor: &NodeExecutor, source: &Node, dump_path: &str) -> Result<Vec<String>> {
        let call = &self.options.policy;
        executor.execute(
            source,
            &UnitOfWork::Command {
                command: format!("mkdir -p {}", shell_quote(&self.options.remote_staging_dir)),
            },
            call,
        )?;
        let dumped = executor.execute(
            source,
            &UnitOfWork::Dump {
                scope: DumpScope::Full,
                archive: dump_path.to_string(),
            },
            call,
        )?;
        match dumped.output {
            ExecOutput::Databases(databases) => Ok(databases),
            _ => Ok(Vec::new()),
        }
    }

    /// Fail the run and clean up the staged file on the node.
    fn abort(
        &self,
        executor: &NodeExecutor,
        source: &Node,
        remote_path: &str,
        run: &mut BackupRun<'_>,
        error: Error,
    ) -> PhaseError {
        remove_remote(executor, source, remote_path, &self.options.policy.once());
        run.fail(error)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Dump start time, strictly after the newest existing artifact.
    fn next_timestamp(&self, environment: &str) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let now = now.duration_trunc(Duration::seconds(1)).unwrap_or(now);
        let latest = self.store.list(environment)?.last().map(|a| a.timestamp);
        Ok(match latest {
            Some(latest) if now <= latest => latest + Duration::seconds(1),
            _ => now,
        })
    }

    fn rotate(
        &self,
        env: &Environment,
        policy: &BackupPolicy,
        artifact: &BackupArtifact,
    ) -> Vec<String> {
        match rotate(
            self.store.as_ref(),
            &env.name,
            policy.retention_days,
            self.clock.now(),
            Some(&artifact.file_name),
        ) {
            Ok(report) => report.notes(),
            Err(e) => {
                log::warn!("Retention for {} skipped: {}", env.name, e);
                vec![format!("retention skipped: {e}")]
            }
        }
    }
}

fn remove_remote(executor: &NodeExecutor, node: &Node, path: &str, policy: &CallPolicy) {
    let work = UnitOfWork::Command {
        command: format!("rm -f {}", shell_quote(path)),
    };
    if let Err(e) = executor.execute(node, &work, policy) {
        log::warn!("{}: failed to remove staged dump {}: {}", node.id, path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::retry::RetryConfig;
    use crate::store::LocalStore;
    use crate::testing::{FakeFleet, Fault, environment};
    use crate::types::DesiredConfig;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    struct Harness {
        fleet: FakeFleet,
        store: Arc<LocalStore>,
        clock: Arc<FixedClock>,
        engine: BackupEngine,
        env: Environment,
        _tmp: TempDir,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let fleet = FakeFleet::new(&["db1", "db2"]);
        fleet.start("db1", &[("appdb", 120), ("audit", 7)]);
        fleet.start("db2", &[("appdb", 120), ("audit", 7)]);
        let store = Arc::new(LocalStore::new(tmp.path()));
        let clock = Arc::new(FixedClock::new(t0()));
        let options = BackupOptions {
            policy: CallPolicy {
                timeout: StdDuration::from_secs(1),
                retry: RetryConfig {
                    max_attempts: 2,
                    base_delay: StdDuration::from_millis(1),
                    backoff_factor: 1.0,
                    max_delay: StdDuration::from_millis(1),
                },
            },
            remote_staging_dir: "/tmp/dbfleet".into(),
        };
        let engine = BackupEngine::new(
            fleet.backends(),
            store.clone(),
            clock.clone(),
            Arc::new(EnvLocks::new()),
            options,
        );
        let env = environment(
            "staging",
            vec![Node::data("db1", "db1"), Node::data("db2", "db2")],
            DesiredConfig::new("7.0.5"),
        );
        Harness {
            fleet,
            store,
            clock,
            engine,
            env,
            _tmp: tmp,
        }
    }

    #[test]
    fn test_backup_produces_named_artifact() {
        let h = harness();
        let result = h.engine.backup(&h.env, &BackupPolicy::default());

        assert!(result.is_success(), "{result:?}");
        let artifact = result.artifact.as_ref().unwrap();
        assert_eq!(artifact.file_name, "staging_2024-01-01T02:00:00Z.archive.gz");
        assert!(artifact.checksum.is_some());
        assert_eq!(artifact.databases, vec!["appdb".to_string(), "audit".to_string()]);
        assert_eq!(result.node("db1").unwrap().status, NodeStatus::Changed);
        assert_eq!(result.node("db2").unwrap().status, NodeStatus::Skipped);
        assert!(crate::store::verify_artifact(artifact).is_ok());
        // staged dump removed from the node
        assert!(h.fleet.node("db1").files.is_empty());
    }

    #[test]
    fn test_uncompressed_backup() {
        let h = harness();
        let policy = BackupPolicy {
            compression: false,
            ..BackupPolicy::default()
        };
        let artifact = h.engine.backup(&h.env, &policy).artifact.unwrap();
        assert_eq!(artifact.file_name, "staging_2024-01-01T02:00:00Z.archive");
        assert!(!artifact.compressed);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let h = harness();
        let first = h.engine.backup(&h.env, &BackupPolicy::default()).artifact.unwrap();
        let second = h.engine.backup(&h.env, &BackupPolicy::default()).artifact.unwrap();
        assert!(second.timestamp > first.timestamp);
        assert_eq!(h.store.list("staging").unwrap().len(), 2);
    }

    #[test]
    fn test_unreadable_sidecar_does_not_block_next_backup() {
        let h = harness();
        let first = h.engine.backup(&h.env, &BackupPolicy::default()).artifact.unwrap();
        let mut sidecar = first.path.clone().into_os_string();
        sidecar.push(".json");
        std::fs::write(&sidecar, b"not json").unwrap();

        let result = h.engine.backup(&h.env, &BackupPolicy::default());

        assert!(result.is_success(), "{result:?}");
        assert!(result.artifact.unwrap().timestamp > first.timestamp);
        assert_eq!(h.store.list("staging").unwrap().len(), 2);
    }

    #[test]
    fn test_retention_after_backup() {
        let h = harness();
        for days in [10, 8, 6] {
            h.clock.set(t0() - Duration::days(days));
            assert!(h.engine.backup(&h.env, &BackupPolicy::default()).is_success());
        }
        h.clock.set(t0());

        let result = h.engine.backup(&h.env, &BackupPolicy::default());

        let remaining: Vec<_> = h
            .store
            .list("staging")
            .unwrap()
            .into_iter()
            .map(|a| a.file_name)
            .collect();
        assert_eq!(
            remaining,
            vec![
                "staging_2023-12-26T02:00:00Z.archive.gz".to_string(),
                "staging_2024-01-01T02:00:00Z.archive.gz".to_string(),
            ]
        );
        assert!(result.notes[0].contains("staging_2023-12-22T02:00:00Z.archive.gz"));
        assert!(result.notes[0].contains("staging_2023-12-24T02:00:00Z.archive.gz"));
    }

    #[test]
    fn test_transfer_failure_leaves_nothing_and_skips_retention() {
        let h = harness();
        h.clock.set(t0() - Duration::days(30));
        assert!(h.engine.backup(&h.env, &BackupPolicy::default()).is_success());
        h.clock.set(t0());
        h.fleet.inject("db1", "pull_file", Fault::Unreachable, None);

        let result = h.engine.backup(&h.env, &BackupPolicy::default());

        let outcome = result.node("db1").unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.message.contains("while transferring"), "{}", outcome.message);
        assert!(result.artifact.is_none());
        // only the old artifact remains; no partial file left behind
        assert_eq!(h.store.list("staging").unwrap().len(), 1);
        let files: Vec<_> = std::fs::read_dir(h.store.root().join("staging"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(files.iter().all(|f| !f.starts_with(".partial-")), "{files:?}");
        assert!(h.fleet.node("db1").files.is_empty());
    }

    #[test]
    fn test_dump_failure_reports_phase() {
        let h = harness();
        h.fleet.inject("db1", "dump", Fault::Remote(2), None);

        let result = h.engine.backup(&h.env, &BackupPolicy::default());

        let outcome = result.node("db1").unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.message.contains("while dumping"));
        assert!(h.store.list("staging").unwrap().is_empty());
    }

    #[test]
    fn test_unreachable_first_node_falls_back_to_next() {
        let h = harness();
        h.fleet.set_reachable("db1", false);

        let result = h.engine.backup(&h.env, &BackupPolicy::default());

        assert!(result.is_success());
        assert_eq!(result.node("db2").unwrap().status, NodeStatus::Changed);
        assert_eq!(result.artifact.unwrap().nodes, vec!["db2".to_string()]);
    }

    #[test]
    fn test_phase_order() {
        let mut phase = BackupPhase::Idle;
        let mut seen = vec![phase];
        while phase != BackupPhase::Done {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                BackupPhase::Idle,
                BackupPhase::Dumping,
                BackupPhase::Compressing,
                BackupPhase::Transferring,
                BackupPhase::RotatingRetention,
                BackupPhase::Done,
            ]
        );
    }
}
