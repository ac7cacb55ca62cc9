//! What the worker was asked to do, and whether a delivered event should
//! start a run.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;
use vigil_core::{
    config::Config,
    trigger::{verify_signature, TriggerEvent, PULL_REQUEST_EVENT},
    ChangeRef,
};

pub const USAGE: &str = "usage: vigil-worker run <owner/repo> <number>\n       vigil-worker event [PAYLOAD_FILE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Check a change directly.
    Run(ChangeRef),
    /// Decode a webhook payload from a file, or stdin when no path is given.
    Event { path: Option<PathBuf> },
}

impl Invocation {
    /// Parse arguments, program name excluded. No arguments means an event
    /// on stdin.
    pub fn parse(args: &[String]) -> Result<Self> {
        match args {
            [] => Ok(Self::Event { path: None }),
            [cmd, repo, number] if cmd == "run" => {
                if !repo.contains('/') {
                    bail!("repository must be owner/name, got {repo:?}");
                }
                let number: u64 = number
                    .parse()
                    .with_context(|| format!("invalid change number {number:?}"))?;
                Ok(Self::Run(ChangeRef::new(repo.as_str(), number)))
            }
            [cmd] if cmd == "event" => Ok(Self::Event { path: None }),
            [cmd, path] if cmd == "event" => Ok(Self::Event {
                path: Some(PathBuf::from(path)),
            }),
            _ => bail!("{USAGE}"),
        }
    }
}

/// A delivered webhook: event name, raw body and optional signature header.
pub struct Delivery<'a> {
    pub event: &'a str,
    pub body: &'a [u8],
    pub signature: &'a str,
}

impl Delivery<'_> {
    /// Event name from `GITHUB_EVENT_NAME`, defaulting to `pull_request`.
    pub fn event_name_from_env() -> String {
        std::env::var("GITHUB_EVENT_NAME").unwrap_or_else(|_| PULL_REQUEST_EVENT.to_string())
    }

    /// Signature header value from `WEBHOOK_SIGNATURE`, empty when unset.
    pub fn signature_from_env() -> String {
        std::env::var("WEBHOOK_SIGNATURE").unwrap_or_default()
    }

    /// The change to run for, or `None` when the event is ignored. A bad
    /// signature or malformed payload is an error.
    pub fn accept(&self, config: &Config) -> Result<Option<ChangeRef>> {
        if !verify_signature(&config.webhook_secret, self.body, self.signature) {
            bail!("webhook signature mismatch");
        }
        let payload: serde_json::Value =
            serde_json::from_slice(self.body).context("event payload is not JSON")?;
        let Some(trigger) = TriggerEvent::from_github(self.event, &payload)? else {
            info!(event = self.event, "ignoring event");
            return Ok(None);
        };
        if !trigger.starts_run() {
            info!(repo = %trigger.repo, number = trigger.number, action = %trigger.action, "action does not start a run");
            return Ok(None);
        }
        Ok(Some(trigger.change()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_direct_run() {
        assert_eq!(
            Invocation::parse(&args(&["run", "org/repo", "12"])).unwrap(),
            Invocation::Run(ChangeRef::new("org/repo", 12))
        );
    }

    #[test]
    fn parses_event_sources() {
        assert_eq!(Invocation::parse(&[]).unwrap(), Invocation::Event { path: None });
        assert_eq!(
            Invocation::parse(&args(&["event", "payload.json"])).unwrap(),
            Invocation::Event {
                path: Some(PathBuf::from("payload.json"))
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(Invocation::parse(&args(&["run", "org/repo", "twelve"])).is_err());
        assert!(Invocation::parse(&args(&["run", "repo", "1"])).is_err());
        assert!(Invocation::parse(&args(&["serve"])).is_err());
    }
}
