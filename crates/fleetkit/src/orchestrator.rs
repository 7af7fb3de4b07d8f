//! Operation orchestrator: request → inventory → engine → result.

use crate::backend::Backends;
use crate::backup::{BackupEngine, BackupOptions};
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::converge::{ConvergeEngine, ConvergeOptions};
use crate::error::Result;
use crate::executor::CallPolicy;
use crate::inventory::InventoryResolver;
use crate::outcome::OperationResult;
use crate::pool::{DEFAULT_MAX_CONCURRENCY, map_bounded};
use crate::request::{OperationKind, OperationRequest};
use crate::restore::{RestoreEngine, RestoreSettings};
use crate::status::{StatusEngine, StatusOptions};
use crate::store::{ArtifactStore, BackupArtifact, EnvLocks};
use std::sync::Arc;
use std::time::Duration;

/// Run-wide knobs shared by every engine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cap on concurrent per-node workers (and on parallel environments)
    pub max_concurrency: usize,
    /// Timeout and retry policy for each remote call
    pub call_policy: CallPolicy,
    /// How long joins wait for the primary
    pub barrier_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Node-side directory for dumps and restore staging
    pub remote_staging_dir: String,
    pub disk_warn_percent: u8,
}

impl Default for Settings {
    fn default() -> Self {
        let converge = ConvergeOptions::default();
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            call_policy: CallPolicy::default(),
            barrier_timeout: converge.barrier_timeout,
            health_poll_interval: converge.health_poll_interval,
            remote_staging_dir: BackupOptions::default().remote_staging_dir,
            disk_warn_percent: StatusOptions::default().disk_warn_percent,
        }
    }
}

/// Entry point for every fleet operation.
pub struct Orchestrator {
    inventory: InventoryResolver,
    backends: Backends,
    store: Arc<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<EnvLocks>,
    settings: Settings,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        inventory: InventoryResolver,
        backends: Backends,
        store: Arc<dyn ArtifactStore>,
        settings: Settings,
    ) -> Self {
        Self {
            inventory,
            backends,
            store,
            clock: Arc::new(SystemClock),
            locks: Arc::new(EnvLocks::new()),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the wall clock (artifact timestamps, retention, backup ages).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels runs started by this orchestrator.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one request.
    ///
    /// `Err` means the request failed before any node was touched (unknown
    /// environment, restore precondition). Per-node failures live in the
    /// returned result.
    pub fn run(&self, request: &OperationRequest) -> Result<OperationResult> {
        let env = self.inventory.resolve(&request.environment)?;
        log::info!(
            "{} on {} ({} node(s))",
            request.kind.name(),
            env.name,
            env.nodes.len()
        );

        let result = match &request.kind {
            OperationKind::Deploy { dry_run } => ConvergeEngine::new(
                self.backends.clone(),
                ConvergeOptions {
                    max_concurrency: self.settings.max_concurrency,
                    policy: self.settings.call_policy.clone(),
                    barrier_timeout: self.settings.barrier_timeout,
                    health_poll_interval: self.settings.health_poll_interval,
                },
            )
            .with_cancellation(self.cancel.clone())
            .converge(&env, *dry_run),
            OperationKind::Backup => BackupEngine::new(
                self.backends.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                Arc::clone(&self.locks),
                BackupOptions {
                    policy: self.settings.call_policy.clone(),
                    remote_staging_dir: self.settings.remote_staging_dir.clone(),
                },
            )
            .with_cancellation(self.cancel.clone())
            .backup(&env, &env.desired.backup),
            OperationKind::Restore(options) => RestoreEngine::new(
                self.backends.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.locks),
                RestoreSettings {
                    policy: self.settings.call_policy.clone(),
                    remote_staging_dir: self.settings.remote_staging_dir.clone(),
                },
            )
            .with_cancellation(self.cancel.clone())
            .restore(&env, options)?,
            OperationKind::Maintenance => StatusEngine::new(
                self.backends.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                Arc::clone(&self.locks),
                StatusOptions {
                    max_concurrency: self.settings.max_concurrency,
                    policy: self.settings.call_policy.clone(),
                    disk_warn_percent: self.settings.disk_warn_percent,
                    ..StatusOptions::default()
                },
            )
            .with_cancellation(self.cancel.clone())
            .status_report(&env),
        };

        log::info!("{} on {}: {}", result.operation, env.name, result.overall());
        Ok(result)
    }

    /// Run requests for independent environments in parallel.
    ///
    /// Requests for the same environment still serialize on its store lock.
    pub fn run_all(&self, requests: &[OperationRequest]) -> Vec<Result<OperationResult>> {
        map_bounded(requests, self.settings.max_concurrency, |request| self.run(request))
    }

    /// Complete artifacts of `environment`, oldest first.
    pub fn list_backups(&self, environment: &str) -> Result<Vec<BackupArtifact>> {
        let env = self.inventory.resolve(environment)?;
        self.locks.with_lock(&env.name, || self.store.list(&env.name))
    }
}
