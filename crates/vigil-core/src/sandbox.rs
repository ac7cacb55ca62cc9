//! Optional isolation for commands run inside a workspace.
//!
//! Backends, in preference order when `auto`:
//! 1. **bwrap**: namespace isolation. The host filesystem is mounted
//!    read-only and only the workspace (plus /tmp) is writable.
//! 2. **docker**: a throwaway container with the workspace bind-mounted at
//!    the same path.
//!
//! `SANDBOX_BACKEND=none|auto|bwrap|docker`. Default is `none`: commands run
//! directly on the host.

use std::{path::Path, process::Stdio};

use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Bwrap,
    Docker,
    Direct,
}

impl SandboxMode {
    /// `None` means "auto": detect at runtime.
    pub fn from_str_or_auto(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bwrap" => Some(Self::Bwrap),
            "docker" => Some(Self::Docker),
            "" | "none" | "direct" => Some(Self::Direct),
            _ => None,
        }
    }

    /// Program and arguments that run `command` in `workspace` under this
    /// backend. `Direct` returns the command as is. `container` names the
    /// docker container so it can be removed if the run times out.
    pub fn wrap(
        &self,
        image: &str,
        workspace: &str,
        env: &[(String, String)],
        container: &str,
        command: Vec<String>,
    ) -> (String, Vec<String>) {
        match self {
            Self::Direct => {
                let mut argv = command.into_iter();
                let program = argv.next().unwrap_or_default();
                (program, argv.collect())
            }
            Self::Bwrap => ("bwrap".into(), Sandbox::bwrap_args(&[workspace], workspace, &command)),
            Self::Docker => (
                "docker".into(),
                Sandbox::docker_args(image, container, &[(workspace, workspace)], env, workspace, &command),
            ),
        }
    }
}

pub struct Sandbox;

impl Sandbox {
    /// Resolve a backend preference to a concrete mode.
    pub async fn detect(preferred: &str) -> SandboxMode {
        if let Some(forced) = SandboxMode::from_str_or_auto(preferred) {
            return forced;
        }
        if cfg!(target_os = "linux") && responds("bwrap", "--version").await {
            info!("sandbox: bwrap detected, isolating workspace commands");
            SandboxMode::Bwrap
        } else if responds("docker", "version").await {
            info!("sandbox: bwrap not found, falling back to docker");
            SandboxMode::Docker
        } else {
            warn!("sandbox: neither bwrap nor docker available, running commands directly");
            SandboxMode::Direct
        }
    }

    // --- bwrap backend ---

    /// Argument list for running `command` under bwrap.
    ///
    /// Read-only root, writable `writable_dirs` and /tmp, fresh /dev and
    /// /proc, own PID namespace. The sandbox dies with its parent, so
    /// killing the bwrap process tears down the whole tree. Network is left
    /// shared: dependency installation needs it.
    pub fn bwrap_args(writable_dirs: &[&str], working_dir: &str, command: &[String]) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        args.extend(["--ro-bind", "/", "/", "--dev", "/dev"].map(str::to_string));

        for dir in writable_dirs {
            if !Path::new(dir).exists() {
                warn!("sandbox: skipping non-existent writable dir: {dir}");
                continue;
            }
            args.extend(["--bind", dir, dir].map(str::to_string));
        }

        args.extend(["--bind", "/tmp", "/tmp"].map(str::to_string));
        args.extend(
            ["--unshare-pid", "--new-session", "--die-with-parent", "--proc", "/proc"]
                .map(str::to_string),
        );
        args.extend(["--chdir", working_dir].map(str::to_string));

        args.push("--".into());
        args.extend_from_slice(command);
        args
    }

    // --- docker backend ---

    pub fn docker_args(
        image: &str,
        name: &str,
        binds: &[(&str, &str)],
        env: &[(String, String)],
        working_dir: &str,
        command: &[String],
    ) -> Vec<String> {
        // --init reaps zombies inside the container. Killing the client does
        // not stop the container; callers remove it by name.
        let mut args: Vec<String> = ["run", "--rm", "-i", "--init", "--pids-limit", "512"]
            .map(str::to_string)
            .to_vec();
        if !name.is_empty() {
            args.push("--name".into());
            args.push(name.to_string());
        }

        if cfg!(target_os = "linux") {
            args.extend(
                ["--security-opt", "no-new-privileges:true", "--cap-drop", "ALL", "--network", "host"]
                    .map(str::to_string),
            );
        }

        for (host, container) in binds {
            args.push("-v".into());
            args.push(format!("{host}:{container}"));
        }
        // The container does not inherit the client's environment.
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }

        args.push("-w".into());
        args.push(working_dir.to_string());
        args.push(image.to_string());
        args.extend_from_slice(command);
        args
    }
}

async fn responds(program: &str, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!(SandboxMode::from_str_or_auto("none"), Some(SandboxMode::Direct));
        assert_eq!(SandboxMode::from_str_or_auto(""), Some(SandboxMode::Direct));
        assert_eq!(SandboxMode::from_str_or_auto("BWRAP"), Some(SandboxMode::Bwrap));
        assert_eq!(SandboxMode::from_str_or_auto("docker"), Some(SandboxMode::Docker));
        assert_eq!(SandboxMode::from_str_or_auto("auto"), None);
    }

    #[test]
    fn bwrap_makes_workspace_writable_and_runs_command_last() {
        let ws = tempfile::tempdir().unwrap();
        let ws = ws.path().to_str().unwrap();
        let args = Sandbox::bwrap_args(&[ws], ws, &argv(&["python", "-m", "pytest"]));

        assert_eq!(&args[..3], &["--ro-bind", "/", "/"]);
        let bind = args.windows(3).any(|w| w[0] == "--bind" && w[1] == ws && w[2] == ws);
        assert!(bind, "workspace must be bind-mounted read-write: {args:?}");
        assert!(args.contains(&"--die-with-parent".to_string()));

        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], &["python", "-m", "pytest"]);
    }

    #[test]
    fn bwrap_skips_missing_writable_dirs() {
        let args = Sandbox::bwrap_args(&["/definitely/not/here"], "/tmp", &argv(&["true"]));
        assert!(!args.contains(&"/definitely/not/here".to_string()));
    }

    #[test]
    fn direct_wrap_passes_command_through() {
        let (program, args) = SandboxMode::Direct.wrap("img", "/ws", &[], "", argv(&["git", "status"]));
        assert_eq!(program, "git");
        assert_eq!(args, argv(&["status"]));

        let (program, args) = SandboxMode::Bwrap.wrap("img", "/tmp", &[], "", argv(&["git", "status"]));
        assert_eq!(program, "bwrap");
        assert_eq!(&args[args.len() - 2..], &["git", "status"]);
    }

    #[test]
    fn docker_forwards_env_and_mounts_workspace() {
        let env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        let args = Sandbox::docker_args(
            "python:3.12-slim",
            "vigil-9-0",
            &[("/ws/repo_1", "/ws/repo_1")],
            &env,
            "/ws/repo_1",
            &argv(&["flake8", "."]),
        );
        assert_eq!(args[0], "run");
        assert!(args.contains(&"/ws/repo_1:/ws/repo_1".to_string()));
        assert!(args.contains(&"GIT_TERMINAL_PROMPT=0".to_string()));
        let name = args.iter().position(|a| a == "--name").unwrap();
        assert_eq!(args[name + 1], "vigil-9-0");
        let image = args.iter().position(|a| a == "python:3.12-slim").unwrap();
        assert_eq!(&args[image + 1..], &["flake8", "."]);
    }
}
