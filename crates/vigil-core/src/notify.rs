//! Reporting results back to where the change came from.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// Best-effort delivery of a text message about a change. Callers log
/// failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, repo: &str, number: u64, text: &str) -> Result<()>;
}

/// Posts an issue comment on the pull request through the GitHub REST API.
pub struct GithubNotifier {
    pub api_url: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

impl GithubNotifier {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            api_url: api_url.into(),
            token: token.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for GithubNotifier {
    async fn notify(&self, repo: &str, number: u64, text: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{repo}/issues/{number}/comments",
            self.api_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&CommentBody { body: text })
            .send()
            .await
            .with_context(|| format!("comment request to {repo}#{number} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GitHub returned {status} for {repo}#{number}: {body}");
        }
        info!(%repo, number, "posted summary comment");
        Ok(())
    }
}

/// Used when no token is configured: the message only goes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, repo: &str, number: u64, text: &str) -> Result<()> {
        info!(%repo, number, "notification: {text}");
        Ok(())
    }
}
