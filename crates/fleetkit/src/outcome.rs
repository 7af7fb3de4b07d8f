//! Per-node outcomes and the aggregated operation result.

use crate::store::BackupArtifact;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome status of one node.
///
/// Variants are declared in severity order so that `max()` yields the
/// worst status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Already in the desired state / all checks passed
    Ok,
    /// Work was computed but not applied, or the node was not involved
    Skipped,
    /// At least one change was applied
    Changed,
    /// Something failed
    Failed,
}

impl NodeStatus {
    /// Check if the status represents a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Skipped => "skipped",
            Self::Changed => "changed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Status of a single read-only probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Probe succeeded and the value is within bounds
    Pass,
    /// Probe succeeded but the value deserves attention
    Warn,
    /// Probe failed
    Fail,
}

/// One probe result within a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    /// Probe name (e.g. "disk")
    pub name: String,
    /// Probe status
    pub status: CheckStatus,
    /// Human-readable value or failure reason
    pub value: String,
}

impl Check {
    pub fn pass(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            value: value.into(),
        }
    }

    pub fn warn(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            value: value.into(),
        }
    }

    pub fn fail(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            value: value.into(),
        }
    }
}

/// Outcome of one node within an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    /// Node id
    pub node: String,
    /// Outcome status
    pub status: NodeStatus,
    /// One-line summary
    pub message: String,
    /// Diagnostic detail (planned actions, config diff, remote stderr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Probe results (status reports only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Check>,
}

impl NodeOutcome {
    pub fn new(node: &str, status: NodeStatus, message: impl Into<String>) -> Self {
        Self {
            node: node.to_string(),
            status,
            message: message.into(),
            detail: None,
            checks: Vec::new(),
        }
    }

    pub fn ok(node: &str, message: impl Into<String>) -> Self {
        Self::new(node, NodeStatus::Ok, message)
    }

    pub fn changed(node: &str, message: impl Into<String>) -> Self {
        Self::new(node, NodeStatus::Changed, message)
    }

    pub fn skipped(node: &str, message: impl Into<String>) -> Self {
        Self::new(node, NodeStatus::Skipped, message)
    }

    pub fn failed(node: &str, message: impl Into<String>) -> Self {
        Self::new(node, NodeStatus::Failed, message)
    }

    /// Attach diagnostic detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }
}

/// Kind of operation a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationName {
    Deploy,
    Backup,
    Restore,
    Maintenance,
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deploy => "deploy",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

/// Aggregated result of one operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Operation that produced this result
    pub operation: OperationName,
    /// Environment name
    pub environment: String,
    /// Every node's outcome, in inventory order
    pub nodes: Vec<NodeOutcome>,
    /// Artifact produced (backup) or consumed (restore)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<BackupArtifact>,
    /// Environment-level remarks (retention report, documented risks)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl OperationResult {
    pub fn new(operation: OperationName, environment: &str, nodes: Vec<NodeOutcome>) -> Self {
        Self {
            operation,
            environment: environment.to_string(),
            nodes,
            artifact: None,
            notes: Vec::new(),
        }
    }

    /// Worst status across all nodes. An empty result counts as `Ok`.
    pub fn overall(&self) -> NodeStatus {
        self.nodes
            .iter()
            .map(|n| n.status)
            .max()
            .unwrap_or(NodeStatus::Ok)
    }

    /// Whether no node failed.
    pub fn is_success(&self) -> bool {
        !self.overall().is_failure()
    }

    /// Look up a node's outcome.
    pub fn node(&self, id: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.node == id)
    }

    /// Count outcomes with the given status.
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}
