//! Restore engine.
//!
//! Preconditions are checked before anything touches a node: the
//! confirmation gate for destructive restores, target selection, and
//! artifact validation. Only then does the restore move through
//! `Transferring → Dropping → Restoring → Verifying`. A failure in any
//! phase is reported with the phase name; nothing is rolled back.

use crate::backend::{Backends, DumpScope, shell_quote};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::executor::{CallPolicy, NodeExecutor, UnitOfWork};
use crate::outcome::{NodeOutcome, OperationName, OperationResult};
use crate::request::RestoreOptions;
use crate::store::{
    ArtifactStore, BackupArtifact, EnvLocks, reference_environment, verify_artifact,
};
use crate::types::{Environment, Node};
use std::fmt;
use std::sync::Arc;

/// Where a restore is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestorePhase {
    Validating,
    Transferring,
    Dropping,
    Restoring,
    Verifying,
    Done,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "validation",
            Self::Transferring => "transfer",
            Self::Dropping => "drop",
            Self::Restoring => "restore",
            Self::Verifying => "verification",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Knobs for a restore run.
#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// Timeout and retry policy for each remote call
    pub policy: CallPolicy,
    /// Directory on the node where the artifact is staged
    pub remote_staging_dir: String,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            policy: CallPolicy::default(),
            remote_staging_dir: "/tmp/dbfleet".to_string(),
        }
    }
}

/// Carried in every restore result.
pub const NO_ROLLBACK_NOTE: &str = "restore is not transactional: a failure during drop or \
     restore leaves the target partially restored and no rollback is attempted";

/// Everything the preconditions established.
struct Plan<'e> {
    target: &'e Node,
    artifact: BackupArtifact,
    scope: DumpScope,
    /// Databases expected on the target afterwards
    expected: Vec<String>,
}

/// Restores backup artifacts onto an environment.
pub struct RestoreEngine {
    backends: Backends,
    store: Arc<dyn ArtifactStore>,
    locks: Arc<EnvLocks>,
    settings: RestoreSettings,
    cancel: CancellationToken,
}

impl RestoreEngine {
    pub fn new(
        backends: Backends,
        store: Arc<dyn ArtifactStore>,
        locks: Arc<EnvLocks>,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            backends,
            store,
            locks,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Restore `options.artifact` onto `env`.
    ///
    /// Returns `Err` only for violated preconditions, in which case no node
    /// was contacted. Failures after that point are reported in the result.
    pub fn restore(&self, env: &Environment, options: &RestoreOptions) -> Result<OperationResult> {
        if options.drop_existing {
            let confirmed = options
                .confirmation
                .as_ref()
                .is_some_and(|token| token.confirms(&env.name));
            if !confirmed {
                return Err(Error::ConfirmationRequired {
                    message: format!(
                        "--drop-existing destroys data in '{}'; confirm with the environment name",
                        env.name
                    ),
                });
            }
        }

        // The source directory may belong to another environment
        let source = reference_environment(&env.name, &options.artifact);
        self.locks.with_locks(&[env.name.as_str(), source.as_str()], || {
            let plan = self.plan(env, options)?;
            Ok(self.execute(env, options, plan))
        })
    }

    fn plan<'e>(&self, env: &'e Environment, options: &RestoreOptions) -> Result<Plan<'e>> {
        let target = match &options.target {
            Some(id) => env.node(id).ok_or_else(|| {
                Error::not_found(format!("node '{id}' in environment '{}'", env.name))
            })?,
            None => env.primary().ok_or_else(|| {
                Error::precondition(format!("environment '{}' has no data node", env.name))
            })?,
        };
        if !target.role.holds_data() {
            return Err(Error::precondition(format!(
                "node '{}' is an arbiter and cannot be restored",
                target.id
            )));
        }

        let artifact = self.store.resolve(&env.name, &options.artifact)?;
        verify_artifact(&artifact)?;

        let (scope, expected) = match &options.database_filter {
            Some(db) => {
                if !artifact.databases.is_empty() && !artifact.databases.contains(db) {
                    return Err(Error::not_found(format!(
                        "database '{db}' in artifact {}",
                        artifact.file_name
                    )));
                }
                (DumpScope::Database(db.clone()), vec![db.clone()])
            }
            None => (DumpScope::Full, artifact.databases.clone()),
        };

        Ok(Plan {
            target,
            artifact,
            scope,
            expected,
        })
    }

    fn execute(
        &self,
        env: &Environment,
        options: &RestoreOptions,
        plan: Plan<'_>,
    ) -> OperationResult {
        let target = plan.target;
        let executor = NodeExecutor::new(self.backends.clone(), &env.desired);
        let remote = format!(
            "{}/{}",
            self.settings.remote_staging_dir.trim_end_matches('/'),
            plan.artifact.file_name
        );

        log::info!(
            "Restoring {} ({}) onto {}",
            plan.artifact.file_name,
            plan.scope,
            target.id
        );

        let mut phase = RestorePhase::Validating;
        let phases = self.run_phases(&executor, target, &plan, options, &remote, &mut phase);
        let outcome = match phases {
            Ok(verified) => NodeOutcome::changed(
                &target.id,
                format!("restored {} from {}", plan.scope, plan.artifact.file_name),
            )
            .with_detail(verified),
            Err(Error::Cancelled) if phase == RestorePhase::Transferring => {
                NodeOutcome::skipped(&target.id, "cancelled before transfer")
            }
            Err(e) => {
                log::warn!("{}: restore failed during {}: {}", target.id, phase, e);
                let outcome =
                    NodeOutcome::failed(&target.id, format!("restore failed during {phase}: {e}"));
                match e {
                    Error::RemoteError { stderr, .. } => outcome.with_detail(stderr),
                    _ => outcome,
                }
            }
        };

        if phase > RestorePhase::Transferring || outcome.status.is_failure() {
            let cleanup = UnitOfWork::Command {
                command: format!("rm -f {}", shell_quote(&remote)),
            };
            if let Err(e) = executor.execute(target, &cleanup, &self.settings.policy.once()) {
                log::warn!("{}: failed to remove staged artifact: {}", target.id, e);
            }
        }

        let nodes = env
            .nodes
            .iter()
            .map(|n| {
                if n.id == target.id {
                    outcome.clone()
                } else {
                    NodeOutcome::skipped(&n.id, "not the restore target")
                }
            })
            .collect();

        let mut result = OperationResult::new(OperationName::Restore, &env.name, nodes);
        result.notes.push(NO_ROLLBACK_NOTE.to_string());
        if env.desired.replica_set.is_some() {
            result.notes.push(
                "other replica-set members receive the restored data through replication".into(),
            );
        }
        result.artifact = Some(plan.artifact);
        result
    }

    fn run_phases(
        &self,
        executor: &NodeExecutor,
        target: &Node,
        plan: &Plan<'_>,
        options: &RestoreOptions,
        remote: &str,
        phase: &mut RestorePhase,
    ) -> Result<String> {
        let policy = &self.settings.policy;

        *phase = RestorePhase::Transferring;
        self.check_cancelled()?;
        executor.execute(
            target,
            &UnitOfWork::Command {
                command: format!("mkdir -p {}", shell_quote(&self.settings.remote_staging_dir)),
            },
            policy,
        )?;
        executor.execute(
            target,
            &UnitOfWork::PushFile {
                local: plan.artifact.path.clone(),
                remote: remote.to_string(),
            },
            policy,
        )?;

        if options.drop_existing {
            *phase = RestorePhase::Dropping;
            self.check_cancelled()?;
            for database in &plan.expected {
                executor.execute(
                    target,
                    &UnitOfWork::DropDatabase {
                        database: database.clone(),
                    },
                    policy,
                )?;
            }
        }

        *phase = RestorePhase::Restoring;
        self.check_cancelled()?;
        executor.execute(
            target,
            &UnitOfWork::Restore {
                scope: plan.scope.clone(),
                archive: remote.to_string(),
                compressed: plan.artifact.compressed,
                drop_existing: options.drop_existing,
            },
            policy,
        )?;

        *phase = RestorePhase::Verifying;
        let verified = self.verify(executor, target, &plan.expected)?;
        *phase = RestorePhase::Done;
        Ok(verified)
    }

    /// Every expected database is present; report its document count.
    fn verify(
        &self,
        executor: &NodeExecutor,
        target: &Node,
        expected: &[String],
    ) -> Result<String> {
        let policy = &self.settings.policy;
        let present = executor.list_databases(target, policy)?;

        let mut lines = Vec::new();
        for database in expected {
            if !present.contains(database) {
                return Err(Error::RemoteError {
                    node: target.id.clone(),
                    code: 0,
                    stderr: format!("database {database} missing after restore"),
                });
            }
            let count = executor.count_documents(target, database, policy)?;
            lines.push(format!("{database}: {count} documents"));
        }

        if lines.is_empty() {
            lines.push(format!("{} databases present", present.len()));
        }
        Ok(lines.join("\n"))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
