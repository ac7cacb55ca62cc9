use std::collections::HashSet;

use async_trait::async_trait;

use crate::types::GeneratedTest;

/// A model service that turns a prompt into test source.
///
/// Implementations must bound their own latency. `None` covers every kind
/// of miss (transport error, non-success status, unusable body) and sends
/// the caller to its fallback.
#[async_trait]
pub trait RemoteGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Option<String>;
}

/// Produces one test file for one source file. Never fails: the worst case
/// is a placeholder skeleton.
#[async_trait]
pub trait TestGenerator: Send + Sync {
    async fn generate(&self, path: &str, source: &str) -> GeneratedTest;
}

/// Whether a workspace-relative path is a source file tests should be
/// generated for: a `.py` file that is not itself a test module and does not
/// live under a hidden directory (`.venv`, `.git`, ...).
pub fn is_generation_candidate(path: &str) -> bool {
    let mut parts = path.split('/');
    let Some(name) = parts.next_back() else {
        return false;
    };
    if parts.any(|p| p.starts_with('.')) || name.starts_with('.') {
        return false;
    }
    name.ends_with(".py")
        && !name.starts_with("test_")
        && !name.ends_with("_test.py")
        && name != "conftest.py"
}

/// Give every test a distinct destination. A path already taken by an
/// earlier test gets `_2`, `_3`, ... inserted before its extension.
/// Returns the `(original, renamed)` pairs.
pub fn dedupe_destinations(tests: &mut [GeneratedTest]) -> Vec<(String, String)> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut renamed = Vec::new();
    for test in tests.iter_mut() {
        if taken.insert(test.path.clone()) {
            continue;
        }
        let (stem, ext) = match test.path.rsplit_once('.') {
            Some((stem, ext)) if !ext.contains('/') => (stem.to_string(), format!(".{ext}")),
            _ => (test.path.clone(), String::new()),
        };
        let mut n = 2;
        let fresh = loop {
            let candidate = format!("{stem}_{n}{ext}");
            if !taken.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        taken.insert(fresh.clone());
        let original = std::mem::replace(&mut test.path, fresh.clone());
        renamed.push((original, fresh));
    }
    renamed
}
