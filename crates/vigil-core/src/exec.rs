//! Bounded command execution.
//!
//! Commands are argument vectors, never shell strings. Stdout and stderr are
//! merged into one capture in arrival order. Timeouts and spawn failures are
//! reported through [`ExecResult`] rather than as errors.

use std::{
    path::Path,
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::sandbox::SandboxMode;

/// Exit code reported when a command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the executable could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

pub const TIMEOUT_MESSAGE: &str = "Command timed out";

const REDACTED: &str = "***";

/// A program plus arguments, with the secret values that must never appear
/// in rendered command lines or captured output.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    secrets: Vec<String>,
    host: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secrets: Vec::new(),
            host: false,
        }
    }

    /// Run on the host even when a sandbox is configured.
    pub fn on_host(mut self) -> Self {
        self.host = true;
        self
    }

    pub fn runs_on_host(&self) -> bool {
        self.host
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Register a value to be masked wherever this command is rendered.
    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Mask every registered secret in `text`.
    pub fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, s| acc.replace(s.as_str(), REDACTED))
    }

    /// Loggable command line.
    pub fn display(&self) -> String {
        self.redact(&self.argv().join(" "))
    }

    /// True if the rendered command line or arguments contain the program name.
    pub fn is(&self, program: &str) -> bool {
        self.program == program
            || Path::new(&self.program)
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n == program)
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CommandSpec").field(&self.display()).finish()
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    /// Stdout and stderr, interleaved.
    pub output: String,
}

impl ExecResult {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::new(TIMEOUT_EXIT_CODE, TIMEOUT_MESSAGE)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE && self.output == TIMEOUT_MESSAGE
    }
}

/// Executes commands for the workspace manager.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` in `cwd` with extra `env` vars layered over the inherited
    /// environment. Must return within roughly `timeout`.
    async fn run(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        env: &[(String, String)],
        timeout: Duration,
    ) -> ExecResult;
}

/// Runs commands as host subprocesses, optionally wrapped in a sandbox.
pub struct ProcessRunner {
    pub sandbox_mode: SandboxMode,
    /// Docker image name (only used when `sandbox_mode == Docker`).
    pub container_image: String,
}

impl ProcessRunner {
    pub fn direct() -> Self {
        Self {
            sandbox_mode: SandboxMode::Direct,
            container_image: String::new(),
        }
    }

    pub fn new(sandbox_mode: SandboxMode, container_image: impl Into<String>) -> Self {
        Self {
            sandbox_mode,
            container_image: container_image.into(),
        }
    }

    fn mode_for(&self, spec: &CommandSpec) -> SandboxMode {
        if spec.runs_on_host() {
            SandboxMode::Direct
        } else {
            self.sandbox_mode
        }
    }

    fn build_command(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        env: &[(String, String)],
        container: &str,
    ) -> Command {
        let workspace = cwd.to_string_lossy();
        let mode = self.mode_for(spec);
        let (program, args) = mode.wrap(&self.container_image, &workspace, env, container, spec.argv());
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout can take down everything the command spawned.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        env: &[(String, String)],
        timeout: Duration,
    ) -> ExecResult {
        debug!(cmd = %spec.display(), cwd = %cwd.display(), timeout_s = timeout.as_secs(), "running command");

        let container = match self.mode_for(spec) {
            SandboxMode::Docker => next_container_name(),
            _ => String::new(),
        };
        let mut child = match self.build_command(spec, cwd, env, &container).spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(cmd = %spec.display(), "failed to spawn: {e}");
                return ExecResult::new(
                    SPAWN_FAILURE_EXIT_CODE,
                    spec.redact(&format!("failed to spawn {}: {e}", spec.program)),
                );
            }
        };
        let pid = child.id();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let collected = tokio::time::timeout(timeout, async {
            let mut combined = Vec::new();
            while let Some(chunk) = rx.recv().await {
                combined.extend_from_slice(&chunk);
            }
            let status = child.wait().await;
            (combined, status)
        })
        .await;

        match collected {
            Ok((bytes, Ok(status))) => {
                let output = spec.redact(&String::from_utf8_lossy(&bytes));
                ExecResult::new(exit_code_of(status), output)
            }
            Ok((bytes, Err(e))) => {
                warn!(cmd = %spec.display(), "failed to wait for command: {e}");
                let mut output = String::from_utf8_lossy(&bytes).into_owned();
                output.push_str(&format!("\nfailed to wait for command: {e}"));
                ExecResult::new(1, spec.redact(&output))
            }
            Err(_elapsed) => {
                warn!(cmd = %spec.display(), timeout_s = timeout.as_secs(), "command timed out, killing process group");
                kill_process_group(pid).await;
                let _ = child.kill().await;
                // Killing the docker client leaves the container running.
                if !container.is_empty() {
                    remove_container(&container).await;
                }
                ExecResult::timed_out()
            }
        }
    }
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Unique per process: `vigil-<pid>-<n>`.
fn next_container_name() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("vigil-{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
}

/// SIGKILL the group led by `pid`. The child was spawned with
/// `process_group(0)`, so its pid is the group id.
#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => debug!(pid, "kill exited with {s}"),
        Err(e) => warn!(pid, "failed to invoke kill: {e}"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>) {}

async fn remove_container(name: &str) {
    let removed = tokio::time::timeout(
        Duration::from_secs(30),
        Command::new("docker")
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;
    match removed {
        Ok(Ok(s)) if s.success() => debug!(container = name, "timed-out container removed"),
        Ok(Ok(s)) => warn!(container = name, "docker rm -f exited with {s}"),
        Ok(Err(e)) => warn!(container = name, "failed to invoke docker rm: {e}"),
        Err(_) => warn!(container = name, "docker rm -f timed out"),
    }
}
