// Full pipeline runs with the real test generator: heuristic generation via
// tree-sitter and remote generation against a mock model endpoint.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mockito::Matcher;
use tempfile::TempDir;
use tracing_test::traced_test;

use vigil_agent::{adapter::HEURISTIC_RATIONALE, HttpGenerator, TestGenAdapter};
use vigil_core::{
    agent::RemoteGenerator,
    config::Config,
    exec::{CommandRunner, CommandSpec, ExecResult},
    notify::Notifier,
    pipeline::Pipeline,
    store::MemoryStore,
    ChangeRef, GenerationSource, RunStatus, StageKind, StageStatus,
};

/// Pretends to be git, python and pytest. Seeds the repo on clone and
/// answers the test run with canned pytest output.
struct FakeToolchain {
    repo_files: Vec<(&'static str, &'static str)>,
    test_output: &'static str,
    test_exit: i32,
}

#[async_trait]
impl CommandRunner for FakeToolchain {
    async fn run(&self, spec: &CommandSpec, cwd: &Path, _env: &[(String, String)], _timeout: Duration) -> ExecResult {
        let has = |a: &str| spec.args.iter().any(|x| x == a);
        if spec.is("git") && has("clone") {
            for (path, content) in &self.repo_files {
                let full = cwd.join(path);
                std::fs::create_dir_all(full.parent().unwrap()).unwrap();
                std::fs::write(full, content).unwrap();
            }
        }
        if has("pytest") && !has("install") {
            return ExecResult::new(self.test_exit, self.test_output);
        }
        ExecResult::new(0, "")
    }
}

#[derive(Default)]
struct Inbox(Mutex<Vec<String>>);

#[async_trait]
impl Notifier for Inbox {
    async fn notify(&self, _repo: &str, _number: u64, text: &str) -> Result<()> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

const CALC: &str = "def add(a, b):\n    return a + b\n";
const UTIL: &str = "def inverse(x):\n    return 1 / x\n";
const SLUG: &str = "def slugify(s):\n    return s.lower()\n";

struct Run {
    _root: TempDir,
    store: Arc<MemoryStore>,
    inbox: Arc<Inbox>,
    run: vigil_core::PipelineRun,
}

async fn run_pipeline(toolchain: FakeToolchain, generator: TestGenAdapter) -> Run {
    let root = tempfile::tempdir().unwrap();
    let config = Config {
        workspace_root: root.path().to_string_lossy().into_owned(),
        analyzers: Vec::new(),
        ..Config::default()
    };
    let store = Arc::new(MemoryStore::new());
    let inbox = Arc::new(Inbox::default());
    let (pipeline, _rx) = Pipeline::new(
        Arc::new(config),
        Arc::new(toolchain),
        Arc::new(generator),
        store.clone(),
        inbox.clone(),
    );
    let run = pipeline.run(ChangeRef::new("org/repo", 42)).await;
    Run {
        _root: root,
        store,
        inbox,
        run,
    }
}

#[tokio::test]
async fn mixed_generation_with_one_failing_test() {
    let mut server = mockito::Server::new_async().await;
    let remote_hit = server
        .mock("POST", "/models/coder")
        .match_header("authorization", "Bearer hf-key")
        .match_body(Matcher::Regex("def slugify".into()))
        .with_status(200)
        .with_body(r#"[{"generated_text":"from slug import slugify\n\ndef test_slugify():\n    assert slugify('A') == 'a'\n"}]"#)
        .create_async()
        .await;
    let remote_miss = server
        .mock("POST", "/models/coder")
        .match_body(Matcher::Regex("def (add|inverse)".into()))
        .with_status(503)
        .with_body("model loading")
        .expect(2)
        .create_async()
        .await;

    let remote: Arc<dyn RemoteGenerator> =
        Arc::new(HttpGenerator::new(format!("{}/models/coder", server.url()), "hf-key").with_timeout(5));
    let toolchain = FakeToolchain {
        repo_files: vec![("calc.py", CALC), ("pkg/util.py", UTIL), ("slug.py", SLUG)],
        test_output: "\
PASSED tests/generated/test_calc.py::test_add_smoke
PASSED tests/generated/test_slug.py::test_slugify
FAILED tests/generated/test_pkg_util.py::test_inverse_smoke - ZeroDivisionError: division by zero
",
        test_exit: 1,
    };
    let r = run_pipeline(toolchain, TestGenAdapter::new(Some(remote), 8000)).await;

    remote_hit.assert_async().await;
    remote_miss.assert_async().await;

    assert_eq!(r.run.status, RunStatus::Failure);
    assert_eq!(r.run.stages.len(), 7);
    assert_eq!(r.run.stage(StageKind::Execute).unwrap().status, StageStatus::Failure);

    let generated = r.store.generated_tests(r.run.id);
    assert_eq!(generated.len(), 3);
    let remote_count = generated.iter().filter(|t| t.source == GenerationSource::Remote).count();
    assert_eq!(remote_count, 1);
    let calc = generated.iter().find(|t| t.path == "tests/generated/test_calc.py").unwrap();
    assert_eq!(calc.rationale, HEURISTIC_RATIONALE);
    assert!(calc.content.contains("_ = module.add(0, 0)"));
    let util = generated.iter().find(|t| t.path == "tests/generated/test_pkg_util.py").unwrap();
    assert!(util.content.contains("import pkg.util as module"));
    assert!(util.content.contains("def test_inverse_property(x):"));

    let result = r.run.test_result.as_ref().unwrap();
    assert_eq!((result.passed, result.failed, result.errors), (2, 1, 0));

    assert_eq!(r.run.failures.len(), 1);
    assert_eq!(r.run.failures[0].file, "tests/generated/test_pkg_util.py");
    assert_eq!(r.run.clusters.len(), 1);
    assert_eq!(r.run.clusters[0].count, 1);
    assert_eq!(r.run.patches.len(), 1);
    assert_eq!(r.store.patches(r.run.id).len(), 1);

    let inbox = r.inbox.0.lock().unwrap().clone();
    assert_eq!(
        inbox,
        vec!["Static analysis done. Generated 3 tests. Test result: 2 passed, 1 failed, 0 errors. Status: failure."]
    );
}

#[tokio::test]
async fn passing_suite_suggests_no_patch() {
    let toolchain = FakeToolchain {
        repo_files: vec![("calc.py", CALC)],
        test_output: "PASSED tests/generated/test_calc.py::test_add_smoke\n",
        test_exit: 0,
    };
    let r = run_pipeline(toolchain, TestGenAdapter::heuristic_only()).await;

    assert_eq!(r.run.status, RunStatus::Success);
    assert!(r.run.failures.is_empty());
    assert!(r.run.clusters.is_empty());
    assert!(r.run.patches.is_empty());
    assert!(r.run.stage(StageKind::Patch).unwrap().log.contains("No failures -> no patch"));
}

#[tokio::test]
async fn unparsable_source_gets_a_skipped_placeholder() {
    let toolchain = FakeToolchain {
        repo_files: vec![("broken.py", "def broken(:\n    return\n")],
        test_output: "SKIPPED [1] tests/generated/test_broken.py:5: could not parse broken.py\n",
        test_exit: 0,
    };
    let r = run_pipeline(toolchain, TestGenAdapter::heuristic_only()).await;

    assert_eq!(r.run.status, RunStatus::Success);
    let generated = r.store.generated_tests(r.run.id);
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].source, GenerationSource::Heuristic);
    assert!(generated[0].content.contains("@pytest.mark.skip("));
    assert!(!generated[0].content.contains("import broken"));
}

#[tokio::test]
#[traced_test]
async fn non_success_status_is_logged_and_falls_back() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/gen")
        .with_status(500)
        .with_body("internal error")
        .create_async()
        .await;

    let generator = HttpGenerator::new(format!("{}/gen", server.url()), "k").with_timeout(5);
    assert_eq!(generator.generate("prompt").await, None);
    assert!(logs_contain("generation endpoint returned non-200"));

    let adapter = TestGenAdapter::new(Some(Arc::new(generator)), 8000);
    let test = vigil_core::agent::TestGenerator::generate(&adapter, "calc.py", CALC).await;
    assert_eq!(test.source, GenerationSource::Heuristic);
}
