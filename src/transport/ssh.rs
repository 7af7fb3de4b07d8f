//! Remote execution over the system `ssh` and `scp` binaries.

use fleetkit::{CommandOutput, Error, Node, RemoteExec, Result, SecretResolver, shell_quote};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Exit code ssh reserves for its own failures.
const SSH_FAILURE: i32 = 255;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// SSH client settings.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub binary: String,
    pub scp_binary: String,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`
    pub options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
            options: Vec::new(),
        }
    }
}

/// [`RemoteExec`] over ssh subprocesses.
///
/// A node's `credentials` reference, when set, resolves to the identity
/// file passed with `-i`.
pub struct SshTransport {
    options: SshOptions,
    secrets: Arc<dyn SecretResolver>,
}

impl SshTransport {
    pub fn new(options: SshOptions, secrets: Arc<dyn SecretResolver>) -> Self {
        Self { options, secrets }
    }

    fn destination(node: &Node) -> String {
        match &node.ssh_user {
            Some(user) => format!("{user}@{}", node.host),
            None => node.host.clone(),
        }
    }

    fn common_args(&self, node: &Node) -> Result<Vec<String>> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        for option in &self.options.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(reference) = &node.credentials {
            let identity = self.secrets.resolve(reference)?;
            args.push("-i".to_string());
            args.push(identity.expose().to_string());
        }
        Ok(args)
    }

    fn run(
        &self,
        node: &Node,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        log::trace!("{}: {} ({} args)", node.id, program, args.len());
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::unreachable(&node.id, format!("failed to execute {program}: {e}"))
            })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)?;
        }

        let output = wait_with_timeout(child, timeout)
            .map_err(|e| Error::unreachable(&node.id, e))?;
        classify(node, output)
    }
}

impl RemoteExec for SshTransport {
    fn exec(&self, node: &Node, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut args = self.common_args(node)?;
        args.push(Self::destination(node));
        args.push("--".to_string());
        args.push(command.to_string());
        self.run(node, &self.options.binary, &args, None, timeout)
    }

    fn exec_with_input(
        &self,
        node: &Node,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut args = self.common_args(node)?;
        args.push(Self::destination(node));
        args.push("--".to_string());
        args.push(command.to_string());
        self.run(node, &self.options.binary, &args, Some(input), timeout)
    }

    fn write_file(
        &self,
        node: &Node,
        contents: &[u8],
        remote: &str,
        timeout: Duration,
    ) -> Result<()> {
        let quoted = shell_quote(remote);
        let mut args = self.common_args(node)?;
        args.push(Self::destination(node));
        args.push("--".to_string());
        args.push(format!("mkdir -p \"$(dirname {quoted})\" && cat > {quoted}"));
        let output = self.run(node, &self.options.binary, &args, Some(contents), timeout)?;
        ensure_success(node, &output)
    }

    fn push_file(&self, node: &Node, local: &Path, remote: &str, timeout: Duration) -> Result<()> {
        let mut args = self.common_args(node)?;
        args.push(local.display().to_string());
        args.push(format!("{}:{remote}", Self::destination(node)));
        let output = self.run(node, &self.options.scp_binary, &args, None, timeout)?;
        ensure_success(node, &output)
    }

    fn pull_file(&self, node: &Node, remote: &str, local: &Path, timeout: Duration) -> Result<u64> {
        let mut args = self.common_args(node)?;
        args.push(format!("{}:{remote}", Self::destination(node)));
        args.push(local.display().to_string());
        let output = self.run(node, &self.options.scp_binary, &args, None, timeout)?;
        ensure_success(node, &output)?;
        Ok(std::fs::metadata(local)?.len())
    }
}

fn ensure_success(node: &Node, output: &CommandOutput) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(Error::RemoteError {
            node: node.id.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Map ssh's own failures onto the error taxonomy; pass everything else
/// through as the remote command's result.
fn classify(node: &Node, output: CommandOutput) -> Result<CommandOutput> {
    if output.code != SSH_FAILURE {
        return Ok(output);
    }
    let message = output.stderr.trim().to_string();
    let rejected = ["Permission denied", "Too many authentication failures"];
    if rejected.iter().any(|marker| message.contains(marker)) {
        Err(Error::AuthFailed {
            node: node.id.clone(),
            message,
        })
    } else {
        Err(Error::unreachable(&node.id, message))
    }
}

/// Wait for `child`, killing it once `timeout` has elapsed.
///
/// Output pipes are drained on their own threads so a chatty command
/// cannot fill a pipe and stall.
fn wait_with_timeout(
    mut child: Child,
    timeout: Duration,
) -> std::result::Result<CommandOutput, String> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("timed out after {}s", timeout.as_secs()));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(format!("failed to wait for ssh: {e}")),
        }
    };

    Ok(CommandOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        // killed by a signal
        code: status.code().unwrap_or(SSH_FAILURE),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}
