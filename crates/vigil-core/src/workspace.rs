//! Workspace lifecycle: allocation, materializing a change, Python
//! environment setup, file I/O and test execution. Every command goes
//! through the configured [`CommandRunner`]; side effects stay inside the
//! workspace directory.

use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    config::Config,
    error::PipelineError,
    exec::{CommandRunner, CommandSpec, ExecResult},
    git::Git,
};

pub const VENV_DIR: &str = ".venv";
pub const REPORT_FILE: &str = "report.xml";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
const SOURCE_EXTENSION: &str = "py";

/// One command and what it produced, for stage logs.
#[derive(Debug, Clone)]
pub struct Step {
    pub command: String,
    pub result: ExecResult,
}

impl Step {
    fn new(spec: &CommandSpec, result: ExecResult) -> Self {
        Self {
            command: spec.display(),
            result,
        }
    }
}

/// Handle to a virtual environment created inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonEnv {
    pub root: PathBuf,
}

impl PythonEnv {
    pub fn python(&self) -> String {
        self.root.join("bin").join("python").to_string_lossy().into_owned()
    }

    fn pip_install(&self) -> CommandSpec {
        CommandSpec::new(self.python()).args(["-m", "pip", "install"])
    }
}

/// Output of the test command plus the JUnit report, when one was written.
#[derive(Debug, Clone)]
pub struct TestExecution {
    pub command: String,
    pub result: ExecResult,
    pub report: Option<String>,
}

/// Allocate a fresh `repo_*` directory under `root`, creating `root` first.
pub fn create_workspace(root: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create workspace root {}", root.display()))?;
    let dir = tempfile::Builder::new()
        .prefix("repo_")
        .tempdir_in(root)
        .with_context(|| format!("failed to allocate workspace under {}", root.display()))?;
    Ok(dir.keep())
}

/// Best-effort recursive delete.
pub fn remove_workspace(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove workspace: {e}"),
    }
}

/// Resolve `rel` under `workspace`, rejecting anything that could escape it:
/// absolute paths, `..`, and a symlink at any existing step of the path,
/// the final component included.
pub fn resolve_in_workspace(workspace: &Path, rel: &str) -> Result<PathBuf, PipelineError> {
    let unsafe_path = || PipelineError::UnsafePath {
        path: rel.to_string(),
    };
    let candidate = Path::new(rel);
    let lexically_safe = !rel.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !lexically_safe {
        return Err(unsafe_path());
    }

    let mut current = workspace.to_path_buf();
    for component in candidate.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        current.push(name);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!(path = rel, link = %current.display(), "refusing path through symlink");
                return Err(unsafe_path());
            }
            Ok(_) => {}
            // Nothing below a missing entry can be a link yet.
            Err(_) => break,
        }
    }
    Ok(workspace.join(candidate))
}

/// Read a file only if it is a regular file, never through a symlink.
fn read_regular_file(path: &Path) -> Option<String> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "lstat failed: {e}");
            return None;
        }
    };
    if !meta.file_type().is_file() {
        warn!(path = %path.display(), "ignoring non-regular file");
        return None;
    }
    let mut file = match open_nofollow(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), "open failed: {e}");
            return None;
        }
    };
    let mut bytes = Vec::new();
    match std::io::Read::read_to_end(&mut file, &mut bytes) {
        Ok(_) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(path = %path.display(), "read failed: {e}");
            None
        }
    }
}

#[cfg(unix)]
fn open_nofollow(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

#[cfg(not(unix))]
fn open_nofollow(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::File::open(path)
}

/// Drop a report left by an earlier run so it cannot be mistaken for this
/// run's output.
fn clear_report(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale report"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove stale report: {e}"),
    }
}

/// Recursively list files with the source extension, as sorted
/// workspace-relative `/`-separated paths. Nothing is excluded here.
pub fn list_source_files(workspace: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(workspace)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| x == SOURCE_EXTENSION)
        })
        .filter_map(|e| {
            let rel = e.path().strip_prefix(workspace).ok()?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            Some(parts.join("/"))
        })
        .collect();
    files.sort();
    files
}

pub struct WorkspaceManager {
    config: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
}

impl WorkspaceManager {
    pub fn new(config: Arc<Config>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn create_workspace(&self) -> Result<PathBuf> {
        create_workspace(Path::new(&self.config.workspace_root))
    }

    pub async fn run_command(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        env: &[(String, String)],
        timeout: Duration,
    ) -> ExecResult {
        self.runner.run(spec, cwd, env, timeout).await
    }

    /// Clone `repo_url` into `workspace`, then fetch the change head into
    /// `pr-<n>` and check it out. Stops at the first non-zero exit. The
    /// returned output is the transcript of every step that ran.
    pub async fn fetch_change(
        &self,
        workspace: &Path,
        repo_url: &str,
        change_number: u64,
        credential: &str,
    ) -> ExecResult {
        let git = Git::new(
            self.runner.clone(),
            Duration::from_secs(self.config.clone_timeout_s),
        );
        let branch = format!("pr-{change_number}");
        let remote_ref = self.config.change_ref(change_number);
        let mut transcript = String::new();

        let clone = git.clone_into(workspace, repo_url, credential).await;
        push_transcript(&mut transcript, "git clone", &clone);
        if !clone.success() {
            warn!(exit_code = clone.exit_code, "clone failed");
            return ExecResult::new(clone.exit_code, transcript);
        }

        let fetch = git.fetch_ref(workspace, &remote_ref, &branch, credential).await;
        push_transcript(&mut transcript, &format!("git fetch origin {remote_ref}:{branch}"), &fetch);
        if !fetch.success() {
            warn!(exit_code = fetch.exit_code, %remote_ref, "fetch of change ref failed");
            return ExecResult::new(fetch.exit_code, transcript);
        }

        let checkout = git.checkout(workspace, &branch).await;
        push_transcript(&mut transcript, &format!("git checkout {branch}"), &checkout);
        if !checkout.success() {
            warn!(exit_code = checkout.exit_code, %branch, "checkout failed");
            return ExecResult::new(checkout.exit_code, transcript);
        }

        if !credential.is_empty() {
            let reset = git.set_remote_url(workspace, repo_url).await;
            if !reset.success() {
                warn!("could not strip credential from origin: {}", reset.output.trim());
                push_transcript(&mut transcript, "git remote set-url origin", &reset);
            }
        }

        info!(%branch, "change checked out");
        ExecResult::new(0, transcript)
    }

    /// Create `.venv` in the workspace. `None` when the interpreter cannot
    /// build one. The pip self-upgrade is best-effort.
    pub async fn prepare_environment(&self, workspace: &Path) -> (Option<PythonEnv>, Vec<Step>) {
        let mut steps = Vec::new();
        let venv = CommandSpec::new(&self.config.python_bin).args(["-m", "venv", VENV_DIR]);
        let result = self
            .run_command(&venv, workspace, &[], Duration::from_secs(self.config.venv_timeout_s))
            .await;
        let ok = result.success();
        steps.push(Step::new(&venv, result));
        if !ok {
            warn!(python = %self.config.python_bin, "virtualenv creation failed");
            return (None, steps);
        }

        let env = PythonEnv {
            root: workspace.join(VENV_DIR),
        };
        let upgrade = env.pip_install().args(["-U", "pip"]);
        let result = self
            .run_command(&upgrade, workspace, &[], Duration::from_secs(self.config.venv_timeout_s))
            .await;
        if !result.success() {
            warn!(exit_code = result.exit_code, "pip upgrade failed, continuing");
        }
        steps.push(Step::new(&upgrade, result));
        (Some(env), steps)
    }

    /// Install `requirements.txt` when present, then the test toolchain.
    /// Failures are recorded, not raised: the execute stage reports them.
    pub async fn install_dependencies(&self, workspace: &Path, env: &PythonEnv) -> Vec<Step> {
        let mut steps = Vec::new();

        if workspace.join(REQUIREMENTS_FILE).is_file() {
            let spec = env.pip_install().args(["-r", REQUIREMENTS_FILE]);
            let result = self
                .run_command(&spec, workspace, &[], Duration::from_secs(self.config.install_timeout_s))
                .await;
            if !result.success() {
                warn!(exit_code = result.exit_code, "requirements install failed");
            }
            steps.push(Step::new(&spec, result));
        }

        if !self.config.test_packages.is_empty() {
            let spec = env.pip_install().args(self.config.test_packages.iter().cloned());
            let result = self
                .run_command(&spec, workspace, &[], Duration::from_secs(self.config.toolchain_timeout_s))
                .await;
            if !result.success() {
                warn!(exit_code = result.exit_code, "toolchain install failed");
            }
            steps.push(Step::new(&spec, result));
        }

        steps
    }

    /// Run the full suite fail-fast, with a JUnit report as side output.
    /// The report is only returned when this run wrote it and finished.
    pub async fn run_tests(&self, workspace: &Path, env: &PythonEnv) -> TestExecution {
        let report_path = workspace.join(REPORT_FILE);
        clear_report(&report_path);

        let spec = CommandSpec::new(env.python()).args([
            "-m",
            "pytest",
            "-q",
            "-rA",
            "--maxfail=1",
            "--disable-warnings",
            format!("--junitxml={REPORT_FILE}").as_str(),
        ]);
        let result = self
            .run_command(&spec, workspace, &[], Duration::from_secs(self.config.test_timeout_s))
            .await;
        let report = if result.is_timeout() {
            None
        } else {
            read_regular_file(&report_path)
        };
        TestExecution {
            command: spec.display(),
            result,
            report,
        }
    }

    /// Write each `path -> content` pair, creating parents and overwriting.
    pub async fn write_files(&self, workspace: &Path, files: &BTreeMap<String, String>) -> Result<()> {
        for (rel, content) in files {
            let path = resolve_in_workspace(workspace, rel)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }

    pub async fn read_file(&self, workspace: &Path, rel: &str) -> Result<String> {
        let path = resolve_in_workspace(workspace, rel)?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn list_source_files(&self, workspace: &Path) -> Vec<String> {
        list_source_files(workspace)
    }
}

fn push_transcript(transcript: &mut String, label: &str, result: &ExecResult) {
    transcript.push_str(&format!("$ {label}\n"));
    let out = result.output.trim_end();
    if !out.is_empty() {
        transcript.push_str(out);
        transcript.push('\n');
    }
    if !result.success() {
        transcript.push_str(&format!("[exit {}]\n", result.exit_code));
    }
}
