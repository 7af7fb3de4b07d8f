//! Container lifecycle through the `docker` CLI on each node.

use fleetkit::converge::CONTAINER_DATA_DIR;
use fleetkit::{
    CommandOutput, ContainerRuntime, ContainerSpec, ContainerState, Error, Node, RemoteExec,
    Result, shell_quote,
};
use std::sync::Arc;
use std::time::Duration;

/// Where the rendered config is mounted inside the container.
const CONTAINER_CONFIG_PATH: &str = "/etc/mongod.conf";

const INSPECT_FORMAT: &str =
    "{{.State.Running}}|{{.Config.Image}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";

/// [`ContainerRuntime`] that drives `docker` over a [`RemoteExec`].
pub struct DockerRuntime {
    remote: Arc<dyn RemoteExec>,
}

impl DockerRuntime {
    pub fn new(remote: Arc<dyn RemoteExec>) -> Self {
        Self { remote }
    }

    fn docker(&self, node: &Node, args: &str, timeout: Duration) -> Result<CommandOutput> {
        self.remote.exec(node, &format!("docker {args}"), timeout)
    }

    fn docker_ok(&self, node: &Node, args: &str, timeout: Duration) -> Result<String> {
        let output = self.docker(node, args, timeout)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::RemoteError {
                node: node.id.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn inspect(&self, node: &Node, name: &str, timeout: Duration) -> Result<ContainerState> {
        let output = self.docker(
            node,
            &format!("inspect --format {} {}", shell_quote(INSPECT_FORMAT), shell_quote(name)),
            timeout,
        )?;
        if !output.success() {
            if is_missing(&output.stderr) {
                return Ok(ContainerState::default());
            }
            return Err(Error::RemoteError {
                node: node.id.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_inspect(&output.stdout))
    }

    fn ensure_running(
        &self,
        node: &Node,
        spec: &ContainerSpec,
        timeout: Duration,
    ) -> Result<bool> {
        let state = self.inspect(node, &spec.name, timeout)?;
        let same_image = state.image.as_deref() == Some(spec.image.as_str());

        if state.running && same_image {
            return Ok(false);
        }
        if state.exists && same_image {
            self.docker_ok(node, &format!("start {}", shell_quote(&spec.name)), timeout)?;
            return Ok(true);
        }
        if state.exists {
            self.docker_ok(node, &format!("rm -f {}", shell_quote(&spec.name)), timeout)?;
        }

        // docker would create a directory in place of a missing mount source
        let config = shell_quote(&spec.config_path);
        if !self.remote.exec(node, &format!("test -f {config}"), timeout)?.success() {
            return Err(Error::precondition(format!(
                "{} must exist before container {} is created",
                spec.config_path, spec.name
            )));
        }

        self.docker_ok(node, &format!("pull {}", shell_quote(&spec.image)), timeout)?;
        self.docker_ok(node, &run_args(spec), timeout)?;
        log::info!("{}: started {} from {}", node.id, spec.name, spec.image);
        Ok(true)
    }

    fn restart(&self, node: &Node, name: &str, timeout: Duration) -> Result<()> {
        self.docker_ok(node, &format!("restart {}", shell_quote(name)), timeout)
            .map(|_| ())
    }

    fn stop(&self, node: &Node, name: &str, timeout: Duration) -> Result<()> {
        let output = self.docker(node, &format!("stop {}", shell_quote(name)), timeout)?;
        if output.success() || is_missing(&output.stderr) {
            Ok(())
        } else {
            Err(Error::RemoteError {
                node: node.id.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such object") || stderr.contains("No such container")
}

fn parse_inspect(stdout: &str) -> ContainerState {
    let mut fields = stdout.trim().splitn(3, '|');
    let running = fields.next() == Some("true");
    let image = fields.next().filter(|s| !s.is_empty()).map(String::from);
    let healthy = match fields.next() {
        Some("healthy") => Some(true),
        Some("unhealthy") => Some(false),
        _ => None,
    };
    ContainerState {
        exists: true,
        running,
        image,
        healthy,
    }
}

/// `docker run` arguments for a fresh container.
///
/// Host networking keeps the database reachable at `host:port`, which is
/// also the address replica-set members use for each other.
fn run_args(spec: &ContainerSpec) -> String {
    format!(
        "run -d --name {name} --restart unless-stopped --network host \
         -v {data}:{CONTAINER_DATA_DIR} -v {config}:{CONTAINER_CONFIG_PATH}:ro \
         {image} --config {CONTAINER_CONFIG_PATH}",
        name = shell_quote(&spec.name),
        data = shell_quote(&spec.data_path),
        config = shell_quote(&spec.config_path),
        image = shell_quote(&spec.image),
    )
}
