use std::{path::Path, sync::Arc, time::Duration};

use crate::exec::{CommandRunner, CommandSpec, ExecResult};

/// Git operations needed to materialize a change, issued through a
/// [`CommandRunner`] so they share its timeout and redaction handling.
pub struct Git {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

fn git_env() -> Vec<(String, String)> {
    // Fail fast instead of blocking on a credential prompt.
    vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]
}

/// Embed a token into an https URL as `x-access-token:<token>@`.
/// Non-https URLs and empty tokens pass through unchanged.
pub fn authenticated_url(url: &str, token: &str) -> String {
    if token.is_empty() {
        return url.to_string();
    }
    match url.strip_prefix("https://") {
        Some(rest) => format!("https://x-access-token:{token}@{rest}"),
        None => url.to_string(),
    }
}

impl Git {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Git always runs on the host; sandbox images need not ship it.
    pub async fn exec(&self, dir: &Path, spec: CommandSpec) -> ExecResult {
        let spec = spec.on_host();
        self.runner.run(&spec, dir, &git_env(), self.timeout).await
    }

    /// `git clone <url> .` into an empty `dir`.
    pub async fn clone_into(&self, dir: &Path, url: &str, token: &str) -> ExecResult {
        let spec = CommandSpec::new("git")
            .args(["clone", authenticated_url(url, token).as_str(), "."])
            .secret(token);
        self.exec(dir, spec).await
    }

    /// Fetch a remote ref into a local branch.
    pub async fn fetch_ref(&self, dir: &Path, remote_ref: &str, branch: &str, token: &str) -> ExecResult {
        let spec = CommandSpec::new("git")
            .args(["fetch", "origin", format!("{remote_ref}:{branch}").as_str()])
            .secret(token);
        self.exec(dir, spec).await
    }

    pub async fn checkout(&self, dir: &Path, branch: &str) -> ExecResult {
        self.exec(dir, CommandSpec::new("git").args(["checkout", branch])).await
    }

    /// Point `origin` back at the credential-free URL.
    pub async fn set_remote_url(&self, dir: &Path, url: &str) -> ExecResult {
        self.exec(dir, CommandSpec::new("git").args(["remote", "set-url", "origin", url]))
            .await
    }
}
