use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vigil_core::agent::RemoteGenerator;

/// Calls a hosted text-generation endpoint (Hugging Face Inference API
/// shape): `POST {"inputs": prompt}` with a bearer key.
///
/// Every failure is soft. Timeouts, transport errors, non-2xx statuses and
/// empty bodies all come back as `None` so the caller can fall back.
pub struct HttpGenerator {
    pub url: String,
    api_key: String,
    pub timeout_secs: u64,
}

impl HttpGenerator {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            timeout_secs: 120,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    inputs: &'a str,
}

#[derive(Deserialize)]
struct Generation {
    generated_text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GenerationResponse {
    Batch(Vec<Generation>),
    Single(Generation),
}

/// Pull the generated text out of a response body: `[{"generated_text"}]`,
/// `{"generated_text"}`, or the body itself when it is not one of those.
pub fn extract_generated_text(body: &str) -> String {
    match serde_json::from_str::<GenerationResponse>(body) {
        Ok(GenerationResponse::Batch(items)) => items
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .unwrap_or_default(),
        Ok(GenerationResponse::Single(g)) => g.generated_text,
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl RemoteGenerator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Option<String> {
        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to build http client: {e}");
                return None;
            }
        };

        let response = match client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&GenerationRequest { inputs: prompt })
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout_secs, "generation request timed out");
                return None;
            }
            Err(e) => {
                warn!("generation request failed: {e}");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "generation endpoint returned non-200: {}", body.chars().take(200).collect::<String>());
            return None;
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to read generation response: {e}");
                return None;
            }
        };
        let text = extract_generated_text(&body);
        if text.trim().is_empty() {
            warn!("generation endpoint returned empty text");
            return None;
        }
        info!(output_len = text.len(), "generation response received");
        Some(text)
    }
}
