use std::collections::HashMap;

use anyhow::Result;

use crate::exec::CommandSpec;

/// Full worker configuration.
/// Sensitive fields (tokens, API keys) come from env/.env only and are never logged.
#[derive(Debug, Clone)]
pub struct Config {
    // Workspaces
    pub workspace_root: String,
    pub data_dir: String,
    /// Leave workspaces on disk after the run for debugging.
    pub keep_workspaces: bool,

    // Version control
    pub git_base_url: String,
    pub github_token: String,
    pub github_api_url: String,
    /// Shared secret for `X-Hub-Signature-256`; empty disables verification.
    pub webhook_secret: String,
    /// Remote ref holding a change head; `{number}` is substituted.
    pub change_ref_template: String,

    // Test environment
    pub python_bin: String,
    pub test_packages: Vec<String>,
    pub analyzers: Vec<CommandSpec>,

    // Timeouts (seconds)
    pub clone_timeout_s: u64,
    pub analysis_timeout_s: u64,
    pub venv_timeout_s: u64,
    pub install_timeout_s: u64,
    pub toolchain_timeout_s: u64,
    pub test_timeout_s: u64,

    // Remote test generation
    pub gen_api_url: String,
    pub gen_api_key: String,
    pub gen_timeout_s: u64,
    pub prompt_max_chars: usize,

    // Sandbox
    /// "none" (default), "auto", "bwrap" or "docker".
    pub sandbox_backend: String,
    pub container_image: String,
}

const DEFAULT_ANALYZERS: &str = "bandit -r -q .|flake8 .|semgrep scan --quiet --error --config p/ci";
const DEFAULT_TEST_PACKAGES: &str = "pytest pytest-cov hypothesis";

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: "workspaces".into(),
            data_dir: "store".into(),
            keep_workspaces: false,
            git_base_url: "https://github.com".into(),
            github_token: String::new(),
            github_api_url: "https://api.github.com".into(),
            webhook_secret: String::new(),
            change_ref_template: "pull/{number}/head".into(),
            python_bin: "python3".into(),
            test_packages: split_words(DEFAULT_TEST_PACKAGES),
            analyzers: parse_analyzers(DEFAULT_ANALYZERS),
            clone_timeout_s: 600,
            analysis_timeout_s: 600,
            venv_timeout_s: 300,
            install_timeout_s: 1200,
            toolchain_timeout_s: 600,
            test_timeout_s: 1800,
            gen_api_url: String::new(),
            gen_api_key: String::new(),
            gen_timeout_s: 120,
            prompt_max_chars: 8000,
            sandbox_backend: "none".into(),
            container_image: "python:3.12-slim".into(),
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, path.strip_prefix("~/").unwrap_or(path));
        }
    }
    path.to_string()
}

fn split_words(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Parse `|`-separated analyzer command lines into argument vectors.
/// Empty entries are skipped.
pub fn parse_analyzers(raw: &str) -> Vec<CommandSpec> {
    raw.split('|')
        .filter_map(|entry| {
            let mut words = entry.split_whitespace();
            let program = words.next()?;
            Some(CommandSpec::new(program).args(words))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        let d = Config::default();

        let analyzers_raw = get_str("ANALYZERS", &dotenv, DEFAULT_ANALYZERS);
        let packages_raw = get_str("TEST_PACKAGES", &dotenv, DEFAULT_TEST_PACKAGES);

        Ok(Config {
            workspace_root: resolve_tilde(&get_str("WORKSPACE_ROOT", &dotenv, &d.workspace_root)),
            data_dir: resolve_tilde(&get_str("DATA_DIR", &dotenv, &d.data_dir)),
            keep_workspaces: get_bool("KEEP_WORKSPACES", &dotenv, d.keep_workspaces),
            git_base_url: get_str("GIT_BASE_URL", &dotenv, &d.git_base_url),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            github_api_url: get_str("GITHUB_API_URL", &dotenv, &d.github_api_url),
            webhook_secret: get_str("GITHUB_WEBHOOK_SECRET", &dotenv, ""),
            change_ref_template: get_str("CHANGE_REF_TEMPLATE", &dotenv, &d.change_ref_template),
            python_bin: get_str("PYTHON_BIN", &dotenv, &d.python_bin),
            test_packages: split_words(&packages_raw),
            analyzers: parse_analyzers(&analyzers_raw),
            clone_timeout_s: get_u64("CLONE_TIMEOUT_S", &dotenv, d.clone_timeout_s),
            analysis_timeout_s: get_u64("ANALYSIS_TIMEOUT_S", &dotenv, d.analysis_timeout_s),
            venv_timeout_s: get_u64("VENV_TIMEOUT_S", &dotenv, d.venv_timeout_s),
            install_timeout_s: get_u64("INSTALL_TIMEOUT_S", &dotenv, d.install_timeout_s),
            toolchain_timeout_s: get_u64("TOOLCHAIN_TIMEOUT_S", &dotenv, d.toolchain_timeout_s),
            test_timeout_s: get_u64("TEST_TIMEOUT_S", &dotenv, d.test_timeout_s),
            gen_api_url: get_str("HF_INFERENCE_API_URL", &dotenv, ""),
            gen_api_key: get_str("HF_API_KEY", &dotenv, ""),
            gen_timeout_s: get_u64("GEN_TIMEOUT_S", &dotenv, d.gen_timeout_s),
            prompt_max_chars: get_usize("PROMPT_MAX_CHARS", &dotenv, d.prompt_max_chars),
            sandbox_backend: get_str("SANDBOX_BACKEND", &dotenv, &d.sandbox_backend),
            container_image: get_str("CONTAINER_IMAGE", &dotenv, &d.container_image),
        })
    }

    /// HTTPS clone URL for a repository identifier, without credentials.
    pub fn repo_url(&self, repo: &str) -> String {
        format!("{}/{}.git", self.git_base_url.trim_end_matches('/'), repo)
    }

    /// Remote ref for a change number.
    pub fn change_ref(&self, number: u64) -> String {
        self.change_ref_template
            .replace("{number}", &number.to_string())
    }

    pub fn remote_generation_enabled(&self) -> bool {
        !self.gen_api_url.is_empty() && !self.gen_api_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_analyzers_are_split_into_argv() {
        let config = Config::default();
        assert_eq!(config.analyzers.len(), 3);
        assert_eq!(config.analyzers[0].program, "bandit");
        assert_eq!(config.analyzers[0].args, vec!["-r", "-q", "."]);
        assert_eq!(config.analyzers[2].program, "semgrep");
        assert_eq!(config.analyzers[2].args.last().map(String::as_str), Some("p/ci"));
    }

    #[test]
    fn parse_analyzers_skips_blank_entries() {
        let specs = parse_analyzers(" ruff check . || mypy . |");
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].program, "ruff");
        assert_eq!(specs[1].program, "mypy");
    }

    #[test]
    fn parse_analyzers_empty_string_disables_analysis() {
        assert!(parse_analyzers("").is_empty());
    }

    #[test]
    fn change_ref_substitutes_number() {
        let config = Config::default();
        assert_eq!(config.change_ref(17), "pull/17/head");

        let gerrit = Config {
            change_ref_template: "refs/changes/{number}/head".into(),
            ..Config::default()
        };
        assert_eq!(gerrit.change_ref(5), "refs/changes/5/head");
    }

    #[test]
    fn repo_url_trims_trailing_slash() {
        let config = Config {
            git_base_url: "https://git.example.com/".into(),
            ..Config::default()
        };
        assert_eq!(config.repo_url("org/repo"), "https://git.example.com/org/repo.git");
    }

    #[test]
    fn remote_generation_needs_url_and_key() {
        let mut config = Config::default();
        assert!(!config.remote_generation_enabled());
        config.gen_api_url = "https://example.com/model".into();
        assert!(!config.remote_generation_enabled());
        config.gen_api_key = "k".into();
        assert!(config.remote_generation_enabled());
    }

    #[test]
    fn default_test_packages_include_toolchain() {
        let config = Config::default();
        assert_eq!(config.test_packages, vec!["pytest", "pytest-cov", "hypothesis"]);
    }
}
