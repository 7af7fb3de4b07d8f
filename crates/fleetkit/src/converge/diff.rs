//! Desired-versus-observed diffing for one node.

use super::render::{config_diff, render_config};
use crate::backend::ContainerSpec;
use crate::error::{Error, Result};
use crate::executor::UnitOfWork;
use crate::types::{DesiredConfig, Environment, Node, ObservedState};
use semver::Version;
use serde::Serialize;

/// Role used when bootstrapping the root user.
pub const ROOT_ROLE: &str = "root";

/// Position of an action within a node's ordered plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Config,
    Container,
    Restart,
    Initiate,
    Auth,
    Join,
}

/// One reconciling action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Stop the old container before replacing its image
    StopContainer { image: String },
    /// Install, upgrade, or start the database container
    DeployContainer {
        image: String,
        from: Option<String>,
    },
    /// Write the rendered config file
    WriteConfig {
        #[serde(skip)]
        contents: String,
        diff: String,
    },
    /// Restart so the new config or version takes effect
    Restart { reason: String },
    /// Initiate the replica set on the bootstrap primary
    InitiateReplicaSet { name: String },
    /// Create the root user
    BootstrapAuth { user: String },
    /// Join the replica set through the primary
    JoinReplicaSet { name: String },
}

impl Action {
    pub fn stage(&self) -> Stage {
        match self {
            Self::StopContainer { .. } | Self::DeployContainer { .. } => Stage::Container,
            Self::WriteConfig { .. } => Stage::Config,
            Self::Restart { .. } => Stage::Restart,
            Self::InitiateReplicaSet { .. } => Stage::Initiate,
            Self::BootstrapAuth { .. } => Stage::Auth,
            Self::JoinReplicaSet { .. } => Stage::Join,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::StopContainer { image } => format!("stop container running {image}"),
            Self::DeployContainer { image, from: None } => format!("deploy container {image}"),
            Self::DeployContainer {
                image,
                from: Some(from),
            } if from == image => format!("start container {image}"),
            Self::DeployContainer {
                image,
                from: Some(from),
            } => format!("upgrade container {from} -> {image}"),
            Self::WriteConfig { .. } => "write config".to_string(),
            Self::Restart { reason } => format!("restart ({reason})"),
            Self::InitiateReplicaSet { name } => format!("initiate replica set {name}"),
            Self::BootstrapAuth { user } => format!("create root user {user}"),
            Self::JoinReplicaSet { name } => format!("join replica set {name}"),
        }
    }

    /// Unit of work that applies this action. `JoinReplicaSet` is executed
    /// against the primary, so its unit names the joining node.
    pub fn to_unit(&self, desired: &DesiredConfig, node: &Node) -> Result<UnitOfWork> {
        let unit = match self {
            Self::StopContainer { .. } => UnitOfWork::StopContainer {
                name: desired.container_name.clone(),
            },
            Self::DeployContainer { image, .. } => UnitOfWork::EnsureContainer(ContainerSpec {
                name: desired.container_name.clone(),
                image: image.clone(),
                config_path: desired.config_path.clone(),
                data_path: desired.data_path.clone(),
                port: node.port,
            }),
            Self::WriteConfig { contents, .. } => UnitOfWork::WriteFile {
                path: desired.config_path.clone(),
                contents: contents.clone().into_bytes(),
            },
            Self::Restart { .. } => UnitOfWork::RestartContainer {
                name: desired.container_name.clone(),
            },
            Self::InitiateReplicaSet { name } => {
                UnitOfWork::InitiateReplicaSet(crate::types::ReplicaSetSpec { name: name.clone() })
            }
            Self::BootstrapAuth { user } => UnitOfWork::CreateUser {
                user: user.clone(),
                password_ref: password_ref(desired)?.to_string(),
                role: ROOT_ROLE.to_string(),
            },
            Self::JoinReplicaSet { .. } => UnitOfWork::AddReplicaMember(node.clone()),
        };
        Ok(unit)
    }
}

/// Ordered actions for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodePlan {
    pub actions: Vec<Action>,
}

impl NodePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions in the given stages, in plan order.
    pub fn in_stages(&self, stages: &[Stage]) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| stages.contains(&a.stage()))
            .collect()
    }

    /// Whether the plan contains a replica-set join.
    pub fn joins(&self) -> bool {
        self.actions.iter().any(|a| a.stage() == Stage::Join)
    }

    /// Planned actions, one per line, followed by the config diff if any.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for action in &self.actions {
            out.push_str(&format!("  • {}\n", action.describe()));
        }
        for action in &self.actions {
            if let Action::WriteConfig { diff, .. } = action
                && !diff.is_empty()
            {
                out.push_str(diff);
            }
        }
        out
    }
}

fn password_ref(desired: &DesiredConfig) -> Result<&str> {
    desired
        .auth
        .root_password_ref
        .as_deref()
        .ok_or_else(|| {
            Error::precondition("authorization is enabled but no root_password_ref is set")
        })
}

/// Fail when moving from `current` to `desired` would downgrade.
///
/// Versions that do not parse as semver are only compared for equality.
pub fn check_downgrade(current: &str, desired: &str) -> Result<()> {
    let (Ok(from), Ok(to)) = (Version::parse(current), Version::parse(desired)) else {
        log::debug!("Skipping downgrade check for non-semver versions {current} -> {desired}");
        return Ok(());
    };
    if to < from {
        return Err(Error::precondition(format!(
            "downgrade from {from} to {to} is not supported"
        )));
    }
    Ok(())
}

/// Compute the ordered actions that take `node` from `observed` to the
/// environment's desired state.
pub fn plan_node(env: &Environment, node: &Node, observed: &ObservedState) -> Result<NodePlan> {
    let desired = &env.desired;
    let image = desired.image_ref();
    let mut actions = Vec::new();

    // Config; the container bind-mounts this file, so it is written before
    // any container is created
    let rendered = render_config(desired, node);
    let config_changed = observed.config.as_deref() != Some(rendered.as_str());
    if config_changed {
        actions.push(Action::WriteConfig {
            diff: config_diff(observed.config.as_deref(), &rendered),
            contents: rendered,
        });
    }

    // Container
    let current_image = observed.container.image.clone();
    let version_changed =
        observed.container.exists && current_image.as_deref() != Some(image.as_str());
    if version_changed && let Some(current) = observed.container.version() {
        check_downgrade(current, &desired.version)?;
    }

    let starts_container = if !observed.container.exists {
        actions.push(Action::DeployContainer {
            image: image.clone(),
            from: None,
        });
        true
    } else if version_changed {
        if observed.container.running {
            actions.push(Action::StopContainer {
                image: current_image.clone().unwrap_or_default(),
            });
        }
        actions.push(Action::DeployContainer {
            image: image.clone(),
            from: current_image,
        });
        true
    } else if !observed.container.running {
        actions.push(Action::DeployContainer {
            image: image.clone(),
            from: Some(image.clone()),
        });
        true
    } else {
        false
    };

    // Restart; a container that is (re)started reads the new file anyway
    if config_changed && !starts_container {
        actions.push(Action::Restart {
            reason: "config changed".to_string(),
        });
    }

    let is_primary = env.is_primary(node);

    // Replica-set initiation precedes auth: user creation needs a writable primary
    if let Some(replica) = &desired.replica_set
        && is_primary
        && !observed.is_member_of(&replica.name)
    {
        actions.push(Action::InitiateReplicaSet {
            name: replica.name.clone(),
        });
    }

    // Auth; in a replica set users replicate from the primary
    let owns_users = node.role.holds_data() && (desired.replica_set.is_none() || is_primary);
    if desired.auth.enabled && owns_users && observed.root_user_present != Some(true) {
        password_ref(desired)?;
        actions.push(Action::BootstrapAuth {
            user: desired.auth.root_user.clone(),
        });
    }

    if let Some(replica) = &desired.replica_set
        && !is_primary
        && !observed.is_member_of(&replica.name)
    {
        actions.push(Action::JoinReplicaSet {
            name: replica.name.clone(),
        });
    }

    debug_assert!(actions.windows(2).all(|w| w[0].stage() <= w[1].stage()));
    Ok(NodePlan { actions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerState, ReplicaRole, ReplicaSetSpec, ReplicaStatus};

    fn env(desired: DesiredConfig) -> Environment {
        Environment {
            name: "staging".into(),
            nodes: vec![Node::data("db1", "db1"), Node::data("db2", "db2")],
            desired,
        }
    }

    fn converged(env: &Environment, node: &Node, version: &str) -> ObservedState {
        ObservedState {
            container: ContainerState {
                exists: true,
                running: true,
                image: Some(format!("mongo:{version}")),
                healthy: Some(true),
            },
            config: Some(render_config(&env.desired, node)),
            root_user_present: Some(true),
            replica: env.desired.replica_set.as_ref().map(|r| ReplicaStatus {
                set_name: r.name.clone(),
                role: ReplicaRole::Secondary,
                lag_secs: Some(0),
            }),
        }
    }

    fn stages(plan: &NodePlan) -> Vec<Stage> {
        plan.actions.iter().map(Action::stage).collect()
    }

    #[test]
    fn test_fresh_node_writes_config_before_container() {
        let env = env(DesiredConfig::new("7.0.5"));
        let plan = plan_node(&env, &env.nodes[0], &ObservedState::default()).unwrap();

        assert_eq!(stages(&plan), vec![Stage::Config, Stage::Container]);
        assert!(matches!(plan.actions[0], Action::WriteConfig { .. }));
        assert!(matches!(plan.actions[1], Action::DeployContainer { from: None, .. }));
    }

    #[test]
    fn test_config_change_on_running_node_restarts() {
        let env = env(DesiredConfig::new("7.0.5"));
        let node = &env.nodes[0];
        let mut observed = converged(&env, node, "7.0.5");
        observed.config = Some("net:\n  port: 27018\n".into());

        let plan = plan_node(&env, node, &observed).unwrap();

        assert_eq!(stages(&plan), vec![Stage::Config, Stage::Restart]);
        assert!(matches!(
            &plan.actions[1],
            Action::Restart { reason } if reason == "config changed"
        ));
    }

    #[test]
    fn test_stopped_container_is_started_after_config_write() {
        let env = env(DesiredConfig::new("7.0.5"));
        let node = &env.nodes[0];
        let mut observed = converged(&env, node, "7.0.5");
        observed.container.running = false;
        observed.config = None;

        let plan = plan_node(&env, node, &observed).unwrap();

        assert_eq!(stages(&plan), vec![Stage::Config, Stage::Container]);
        assert_eq!(plan.actions[1].describe(), "start container mongo:7.0.5");
    }

    #[test]
    fn test_converged_node_has_empty_plan() {
        let env = env(DesiredConfig::new("7.0.5"));
        let node = &env.nodes[1];
        let plan = plan_node(&env, node, &converged(&env, node, "7.0.5")).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_upgrade_stops_then_redeploys_without_restart() {
        let env = env(DesiredConfig::new("7.0.6"));
        let node = &env.nodes[0];
        let plan = plan_node(&env, node, &converged(&env, node, "7.0.5")).unwrap();

        assert_eq!(plan.actions.len(), 2);
        assert!(matches!(plan.actions[0], Action::StopContainer { .. }));
        assert!(matches!(
            &plan.actions[1],
            Action::DeployContainer { from: Some(from), .. } if from == "mongo:7.0.5"
        ));
    }

    #[test]
    fn test_downgrade_is_precondition_failure() {
        let env = env(DesiredConfig::new("6.0.1"));
        let node = &env.nodes[0];
        let err = plan_node(&env, node, &converged(&env, node, "7.0.5")).unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[test]
    fn test_non_semver_tags_skip_downgrade_check() {
        assert!(check_downgrade("latest", "7.0.5").is_ok());
        assert!(check_downgrade("7.0.5", "7.0.5").is_ok());
        assert!(check_downgrade("7.0.5", "8.0.0").is_ok());
    }

    #[test]
    fn test_replica_set_primary_initiates_before_auth() {
        let mut desired = DesiredConfig::new("7.0.5");
        desired.auth.enabled = true;
        desired.auth.root_password_ref = Some("env:ROOT_PW".into());
        desired.replica_set = Some(ReplicaSetSpec { name: "rs0".into() });
        let env = env(desired);

        let primary = plan_node(&env, &env.nodes[0], &ObservedState::default()).unwrap();
        assert_eq!(
            stages(&primary),
            vec![Stage::Config, Stage::Container, Stage::Initiate, Stage::Auth]
        );

        let secondary = plan_node(&env, &env.nodes[1], &ObservedState::default()).unwrap();
        assert_eq!(
            stages(&secondary),
            vec![Stage::Config, Stage::Container, Stage::Join]
        );
        assert!(secondary.joins());
    }

    #[test]
    fn test_auth_without_password_ref_is_precondition() {
        let mut desired = DesiredConfig::new("7.0.5");
        desired.auth.enabled = true;
        let env = env(desired);
        let err = plan_node(&env, &env.nodes[0], &ObservedState::default()).unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[test]
    fn test_describe_includes_config_diff() {
        let env = env(DesiredConfig::new("7.0.5"));
        let plan = plan_node(&env, &env.nodes[0], &ObservedState::default()).unwrap();
        let text = plan.describe();
        assert!(text.contains("deploy container mongo:7.0.5"));
        assert!(text.contains("+ net:"));
    }
}
