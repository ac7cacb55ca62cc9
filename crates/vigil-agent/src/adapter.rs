use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use vigil_core::{
    agent::{RemoteGenerator, TestGenerator},
    config::Config,
    GeneratedTest, GenerationSource,
};

use crate::{
    heuristic::plan_tests,
    prompt::build_prompt,
    remote::HttpGenerator,
    render::{destination_path, module_path, render_skeleton, render_tests},
};

pub const REMOTE_RATIONALE: &str = "Generated via HF model";
pub const HEURISTIC_RATIONALE: &str = "Heuristic AST-based generator";
pub const SKELETON_RATIONALE: &str = "Heuristic AST-based generator (source did not parse)";

/// Marker a remote response must contain to be used as a test file.
const TEST_MARKER: &str = "def test";

/// Remote model first, tree-sitter heuristic when the model is absent or
/// its answer is unusable.
pub struct TestGenAdapter {
    remote: Option<Arc<dyn RemoteGenerator>>,
    prompt_max_chars: usize,
}

impl TestGenAdapter {
    pub fn new(remote: Option<Arc<dyn RemoteGenerator>>, prompt_max_chars: usize) -> Self {
        Self {
            remote,
            prompt_max_chars,
        }
    }

    pub fn heuristic_only() -> Self {
        Self::new(None, 0)
    }

    /// Remote generation is wired only when both endpoint and key are set.
    pub fn from_config(config: &Config) -> Self {
        let remote: Option<Arc<dyn RemoteGenerator>> = if config.remote_generation_enabled() {
            Some(Arc::new(
                HttpGenerator::new(&config.gen_api_url, &config.gen_api_key)
                    .with_timeout(config.gen_timeout_s),
            ))
        } else {
            info!("remote test generation disabled, using heuristic generator only");
            None
        };
        Self::new(remote, config.prompt_max_chars)
    }

    async fn try_remote(&self, path: &str, source: &str) -> Option<String> {
        let remote = self.remote.as_ref()?;
        let text = remote.generate(&build_prompt(source, self.prompt_max_chars)).await?;
        let text = strip_code_fence(&text);
        if !text.contains(TEST_MARKER) {
            debug!(%path, "remote output has no test functions, falling back");
            return None;
        }
        Some(text)
    }
}

/// Models often wrap code in a Markdown fence; keep only its body.
fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return text.to_string();
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    let body = body.trim_end().strip_suffix("```").unwrap_or(body);
    format!("{}\n", body.trim_end())
}

/// Heuristic generation alone: tests for each public top-level function,
/// or a skipped placeholder when the source does not parse.
pub fn heuristic_test(path: &str, source: &str) -> GeneratedTest {
    let (content, rationale) = match plan_tests(source) {
        Ok(specs) => (render_tests(&module_path(path), &specs), HEURISTIC_RATIONALE),
        Err(e) => {
            debug!(%path, "{e}, emitting skeleton");
            (render_skeleton(path), SKELETON_RATIONALE)
        }
    };
    GeneratedTest {
        path: destination_path(path),
        content,
        source: GenerationSource::Heuristic,
        rationale: rationale.to_string(),
    }
}

#[async_trait]
impl TestGenerator for TestGenAdapter {
    async fn generate(&self, path: &str, source: &str) -> GeneratedTest {
        if let Some(content) = self.try_remote(path, source).await {
            debug!(%path, "using remote generation");
            return GeneratedTest {
                path: destination_path(path),
                content,
                source: GenerationSource::Remote,
                rationale: REMOTE_RATIONALE.to_string(),
            };
        }
        heuristic_test(path, source)
    }
}
