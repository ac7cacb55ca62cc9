//! Decoding of change-submission events (GitHub `pull_request` webhooks).

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::types::ChangeRef;

pub const PULL_REQUEST_EVENT: &str = "pull_request";

/// Actions that start a run: opened, updated, ready, reopened.
pub const RUN_ACTIONS: [&str; 4] = ["opened", "synchronize", "ready_for_review", "reopened"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event: String,
    pub action: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub head_sha: String,
    pub head_ref: String,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    number: u64,
    repository: RepositoryPayload,
    pull_request: PullRequestBody,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

#[derive(Deserialize)]
struct PullRequestBody {
    #[serde(default)]
    title: String,
    head: HeadPayload,
}

#[derive(Deserialize)]
struct HeadPayload {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
}

impl TriggerEvent {
    /// Decode a webhook body. Returns `None` for event kinds other than
    /// `pull_request`; a `pull_request` body missing required fields is an
    /// error.
    pub fn from_github(event: &str, payload: &serde_json::Value) -> Result<Option<Self>> {
        if event != PULL_REQUEST_EVENT {
            return Ok(None);
        }
        let body = PullRequestPayload::deserialize(payload)
            .context("malformed pull_request payload")?;
        Ok(Some(Self {
            event: event.to_string(),
            action: body.action,
            repo: body.repository.full_name,
            number: body.number,
            title: body.pull_request.title,
            head_sha: body.pull_request.head.sha,
            head_ref: body.pull_request.head.ref_name,
        }))
    }

    pub fn starts_run(&self) -> bool {
        self.event == PULL_REQUEST_EVENT && RUN_ACTIONS.contains(&self.action.as_str())
    }

    pub fn change(&self) -> ChangeRef {
        ChangeRef {
            repo: self.repo.clone(),
            number: self.number,
            head_sha: self.head_sha.clone(),
            head_ref: self.head_ref.clone(),
            title: self.title.clone(),
        }
    }
}

/// Check an `X-Hub-Signature-256` header (`sha256=<hex>`) against the body.
/// An empty secret disables verification.
pub fn verify_signature(secret: &str, payload: &[u8], header: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Some(expected) = header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
    else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(action: &str) -> serde_json::Value {
        json!({
            "action": action,
            "number": 42,
            "repository": { "full_name": "org/repo", "default_branch": "main" },
            "pull_request": {
                "title": "Add parser",
                "head": { "sha": "abc123", "ref": "feature/parser" }
            }
        })
    }

    #[test]
    fn decodes_pull_request_payload() {
        let ev = TriggerEvent::from_github("pull_request", &payload("opened"))
            .unwrap()
            .unwrap();
        assert_eq!(ev.repo, "org/repo");
        assert_eq!(ev.number, 42);
        assert_eq!(ev.head_sha, "abc123");
        assert_eq!(ev.head_ref, "feature/parser");
        assert!(ev.starts_run());

        let change = ev.change();
        assert_eq!(change.to_string(), "org/repo#42");
        assert_eq!(change.title, "Add parser");
    }

    #[test]
    fn only_run_actions_start_a_run() {
        for action in RUN_ACTIONS {
            let ev = TriggerEvent::from_github("pull_request", &payload(action)).unwrap().unwrap();
            assert!(ev.starts_run(), "{action}");
        }
        for action in ["closed", "labeled", "edited"] {
            let ev = TriggerEvent::from_github("pull_request", &payload(action)).unwrap().unwrap();
            assert!(!ev.starts_run(), "{action}");
        }
    }

    #[test]
    fn other_events_are_ignored() {
        assert!(TriggerEvent::from_github("push", &json!({})).unwrap().is_none());
    }

    #[test]
    fn missing_fields_are_an_error() {
        let err = TriggerEvent::from_github("pull_request", &json!({ "action": "opened" }));
        assert!(err.is_err());
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"action":"opened"}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature("s3cret", body, &header));
        assert!(!verify_signature("other", body, &header));
        assert!(!verify_signature("s3cret", b"tampered", &header));
        assert!(!verify_signature("s3cret", body, "sha1=deadbeef"));
        assert!(verify_signature("", body, ""));
    }
}
