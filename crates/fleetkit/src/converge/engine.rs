//! Convergence engine - applies node plans with a replica-set barrier.
//!
//! A run goes through four phases:
//!
//! 1. probe every node and compute its plan (parallel)
//! 2. apply config, container, and restart actions; standalone nodes also
//!    bootstrap auth here (parallel)
//! 3. initiate the replica set on the primary
//! 4. once the primary reports healthy and writable, create the root user on
//!    it and join the secondaries through it

use super::diff::{Action, NodePlan, Stage, plan_node};
use crate::backend::Backends;
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::executor::{CallPolicy, NodeExecutor};
use crate::outcome::{NodeOutcome, OperationName, OperationResult};
use crate::pool::{DEFAULT_MAX_CONCURRENCY, map_bounded};
use crate::types::{Environment, Health, Node, ReplicaRole};
use std::thread;
use std::time::{Duration, Instant};

/// Knobs for a convergence run.
#[derive(Debug, Clone)]
pub struct ConvergeOptions {
    /// Cap on concurrent per-node workers
    pub max_concurrency: usize,
    /// Timeout and retry policy for each remote call
    pub policy: CallPolicy,
    /// How long secondaries wait for the primary to report healthy
    pub barrier_timeout: Duration,
    /// Interval between primary health polls
    pub health_poll_interval: Duration,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            policy: CallPolicy::default(),
            barrier_timeout: Duration::from_secs(120),
            health_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Per-node progress through a run.
#[derive(Debug, Default)]
struct NodeRun {
    plan: NodePlan,
    applied: Vec<String>,
    changed: bool,
    failure: Option<String>,
    cancelled: bool,
    /// Set when the node finished before execution (probe failure, dry run)
    settled: Option<NodeOutcome>,
}

impl NodeRun {
    fn settled(outcome: NodeOutcome) -> Self {
        Self {
            settled: Some(outcome),
            ..Self::default()
        }
    }

    fn active(&self) -> bool {
        self.settled.is_none() && self.failure.is_none() && !self.cancelled
    }

    fn absorb(&mut self, step: Step) {
        self.applied.extend(step.applied);
        self.changed |= step.changed;
        if self.failure.is_none() {
            self.failure = step.failure;
        }
        self.cancelled |= step.cancelled;
    }

    fn outcome(self, node: &Node) -> NodeOutcome {
        if let Some(outcome) = self.settled {
            return outcome;
        }

        let applied = self
            .applied
            .iter()
            .map(|a| format!("  • {a}\n"))
            .collect::<String>();

        if let Some(failure) = self.failure {
            return NodeOutcome::failed(&node.id, failure).with_detail(applied);
        }
        if self.cancelled {
            return if self.applied.is_empty() {
                NodeOutcome::skipped(&node.id, "cancelled before any action ran")
            } else {
                NodeOutcome::failed(
                    &node.id,
                    format!(
                        "cancelled after {} of {} actions",
                        self.applied.len(),
                        self.plan.actions.len()
                    ),
                )
                .with_detail(applied)
            };
        }
        if self.changed {
            NodeOutcome::changed(&node.id, format!("{} actions applied", self.applied.len()))
                .with_detail(applied)
        } else {
            NodeOutcome::ok(&node.id, "already converged")
        }
    }
}

/// Result of applying a slice of a node's plan.
#[derive(Debug, Default)]
struct Step {
    applied: Vec<String>,
    changed: bool,
    failure: Option<String>,
    cancelled: bool,
}

/// Converges an environment onto its desired configuration.
pub struct ConvergeEngine {
    backends: Backends,
    options: ConvergeOptions,
    cancel: CancellationToken,
}

impl ConvergeEngine {
    pub fn new(backends: Backends, options: ConvergeOptions) -> Self {
        Self {
            backends,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the caller.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Converge every node of `env` onto `env.desired`.
    pub fn converge(&self, env: &Environment, dry_run: bool) -> OperationResult {
        let executor =
            NodeExecutor::new(self.backends.clone(), &env.desired).with_dry_run(dry_run);
        let max = self.options.max_concurrency;
        let policy = &self.options.policy;

        log::info!(
            "Converging {} ({} nodes{})",
            env.name,
            env.nodes.len(),
            if dry_run { ", dry run" } else { "" }
        );

        // Phase 1: probe and plan
        let mut runs = map_bounded(&env.nodes, max, |node| {
            self.prepare(&executor, env, node, dry_run)
        });

        if !dry_run {
            // Phase 2: node-local actions
            let local: &[Stage] = if env.desired.replica_set.is_some() {
                &[Stage::Config, Stage::Container, Stage::Restart]
            } else {
                &[Stage::Config, Stage::Container, Stage::Restart, Stage::Auth]
            };
            let pairs: Vec<(&Node, &NodeRun)> = env.nodes.iter().zip(runs.iter()).collect();
            let steps = map_bounded(&pairs, max, |(node, run)| {
                if run.active() {
                    self.apply(&executor, env, node, node, &run.plan.in_stages(local), policy)
                } else {
                    Step::default()
                }
            });
            for (run, step) in runs.iter_mut().zip(steps) {
                run.absorb(step);
            }

            if env.desired.replica_set.is_some() {
                self.bootstrap_replica_set(&executor, env, &mut runs);
            }
        }

        let nodes = env
            .nodes
            .iter()
            .zip(runs)
            .map(|(node, run)| run.outcome(node))
            .collect();
        OperationResult::new(OperationName::Deploy, &env.name, nodes)
    }

    fn prepare(
        &self,
        executor: &NodeExecutor,
        env: &Environment,
        node: &Node,
        dry_run: bool,
    ) -> NodeRun {
        if self.cancel.is_cancelled() {
            return NodeRun::settled(NodeOutcome::skipped(&node.id, "cancelled before probing"));
        }

        let plan = match executor
            .observe(node, &env.desired, &self.options.policy)
            .and_then(|observed| plan_node(env, node, &observed))
        {
            Ok(plan) => plan,
            Err(e) => {
                log::warn!("{}: {}", node.id, e);
                return NodeRun::settled(failed_outcome(node, &e));
            }
        };

        if plan.is_empty() {
            return NodeRun::settled(NodeOutcome::ok(&node.id, "already converged"));
        }
        if dry_run {
            let outcome = match self.preview(executor, env, node, &plan) {
                Ok(planned) => NodeOutcome::skipped(&node.id, format!("{planned} actions planned")),
                Err(e) => {
                    log::warn!("{}: {}", node.id, e);
                    NodeOutcome::failed(&node.id, format!("plan cannot be applied: {e}"))
                }
            };
            return NodeRun::settled(outcome.with_detail(plan.describe()));
        }

        NodeRun {
            plan,
            ..NodeRun::default()
        }
    }

    /// Run every planned action through the dry-run executor; counts the
    /// actions that would change the node.
    fn preview(
        &self,
        executor: &NodeExecutor,
        env: &Environment,
        node: &Node,
        plan: &NodePlan,
    ) -> Result<usize> {
        let mut planned = 0;
        for action in &plan.actions {
            let unit = action.to_unit(&env.desired, node)?;
            if executor.execute(node, &unit, &self.options.policy)?.would_change {
                planned += 1;
            }
        }
        Ok(planned)
    }

    /// Apply `actions` for `node`, dispatching each to `target`.
    fn apply(
        &self,
        executor: &NodeExecutor,
        env: &Environment,
        node: &Node,
        target: &Node,
        actions: &[&Action],
        policy: &CallPolicy,
    ) -> Step {
        let mut step = Step::default();
        for action in actions {
            if self.cancel.is_cancelled() {
                step.cancelled = true;
                break;
            }

            let description = action.describe();
            let result = action
                .to_unit(&env.desired, node)
                .and_then(|unit| executor.execute(target, &unit, policy));
            match result {
                Ok(exec) => {
                    step.changed |= exec.changed;
                    step.applied.push(description);
                }
                Err(e) => {
                    log::warn!("{}: {} failed: {}", node.id, description, e);
                    step.failure = Some(format!("{description} failed: {e}"));
                    break;
                }
            }
        }
        step
    }

    fn bootstrap_replica_set(
        &self,
        executor: &NodeExecutor,
        env: &Environment,
        runs: &mut [NodeRun],
    ) {
        let Some(primary_idx) = env.nodes.iter().position(|n| env.is_primary(n)) else {
            for run in runs.iter_mut().filter(|r| r.active() && r.plan.joins()) {
                run.failure =
                    Some("replica set declared but the environment has no data node".into());
            }
            return;
        };
        let primary = &env.nodes[primary_idx];
        let policy = &self.options.policy;

        // Phase 3: initiate on the primary
        if runs[primary_idx].active() {
            let actions = runs[primary_idx].plan.in_stages(&[Stage::Initiate]);
            let step = self.apply(executor, env, primary, primary, &actions, policy);
            runs[primary_idx].absorb(step);
        }

        let primary_auth = runs[primary_idx].active()
            && !runs[primary_idx].plan.in_stages(&[Stage::Auth]).is_empty();
        let joins = runs
            .iter()
            .enumerate()
            .any(|(idx, run)| idx != primary_idx && run.active() && run.plan.joins());
        if !primary_auth && !joins {
            return;
        }

        // Phase 4: barrier, root user on the primary, then joins in inventory order
        let mut gate = self.primary_gate(executor, primary, &runs[primary_idx]);

        if primary_auth {
            match gate.clone() {
                Ok(()) => {
                    let actions = runs[primary_idx].plan.in_stages(&[Stage::Auth]);
                    let step = self.apply(executor, env, primary, primary, &actions, policy);
                    runs[primary_idx].absorb(step);
                    if !runs[primary_idx].active() {
                        gate = Err(format!(
                            "primary {} did not converge; join not attempted",
                            primary.id
                        ));
                    }
                }
                Err(reason) => runs[primary_idx].failure = Some(reason),
            }
        }

        for (idx, node) in env.nodes.iter().enumerate() {
            let run = &mut runs[idx];
            if idx == primary_idx || !run.active() || !run.plan.joins() {
                continue;
            }
            match &gate {
                Ok(()) => {
                    let actions = run.plan.in_stages(&[Stage::Join]);
                    let step = self.apply(executor, env, node, primary, &actions, policy);
                    run.absorb(step);
                }
                Err(reason) => run.failure = Some(reason.clone()),
            }
        }
    }

    /// Whether work that needs a writable primary may proceed.
    fn primary_gate(
        &self,
        executor: &NodeExecutor,
        primary: &Node,
        run: &NodeRun,
    ) -> std::result::Result<(), String> {
        if run.failure.is_some() || run.cancelled {
            return Err(format!(
                "primary {} did not converge; join not attempted",
                primary.id
            ));
        }
        if let Some(outcome) = &run.settled
            && outcome.status.is_failure()
        {
            return Err(format!(
                "primary {} failed ({}); join not attempted",
                primary.id, outcome.message
            ));
        }
        self.wait_for_primary(executor, primary)
            .map_err(|e| e.to_string())
    }

    /// Poll the primary until it answers as a healthy primary.
    fn wait_for_primary(&self, executor: &NodeExecutor, primary: &Node) -> Result<()> {
        let started = Instant::now();
        let once = self.options.policy.once();

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let healthy = matches!(executor.ping(primary, &once), Ok(Health::Healthy))
                && matches!(
                    executor.replica_membership(primary, &once),
                    Ok(Some(status)) if status.role == ReplicaRole::Primary
                );
            if healthy {
                log::debug!("{}: primary healthy after {:?}", primary.id, started.elapsed());
                return Ok(());
            }

            if started.elapsed() >= self.options.barrier_timeout {
                return Err(Error::Timeout {
                    what: format!("primary {} to report healthy", primary.id),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(self.options.health_poll_interval);
        }
    }
}

fn failed_outcome(node: &Node, error: &Error) -> NodeOutcome {
    let outcome = NodeOutcome::failed(&node.id, error.to_string());
    match error {
        Error::RemoteError { stderr, .. } => outcome.with_detail(stderr.clone()),
        _ => outcome,
    }
}
