use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub use crate::types::PipelineEvent;

use crate::{
    agent::{dedupe_destinations, is_generation_candidate, TestGenerator},
    analysis,
    config::Config,
    error::PipelineError,
    exec::{CommandRunner, ExecResult},
    notify::Notifier,
    patch::suggest_patches,
    results::{ResultParser, SubstringParser},
    store::Store,
    triage::cluster_failures,
    types::{
        ChangeRef, GenerationSource, PipelineRun, RunStatus, Stage, StageKind, StageStatus,
        TestRunResult,
    },
    workspace::{self, Step, WorkspaceManager},
};

// ── Stage log ─────────────────────────────────────────────────────────────

/// Append-only log owned by the stage that is running. It is written to the
/// stage record once, when the stage closes.
#[derive(Debug, Default)]
pub struct StageLog {
    buf: String,
}

impl StageLog {
    pub fn line(&mut self, msg: impl AsRef<str>) {
        self.buf.push_str(&format!(
            "{} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            msg.as_ref()
        ));
    }

    /// Record a command line, its exit code and its captured output verbatim.
    pub fn command(&mut self, command: &str, result: &ExecResult) {
        self.line(format!("$ {command} (exit {})", result.exit_code));
        let out = result.output.trim_end();
        if !out.is_empty() {
            self.buf.push_str(out);
            self.buf.push('\n');
        }
    }

    pub fn step(&mut self, step: &Step) {
        self.command(&step.command, &step.result);
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

struct StageDone {
    status: StageStatus,
    payload: Value,
}

impl StageDone {
    fn success(payload: Value) -> Self {
        Self {
            status: StageStatus::Success,
            payload,
        }
    }

    fn with_status(status: StageStatus, payload: Value) -> Self {
        Self { status, payload }
    }
}

struct RunContext {
    workspace: PathBuf,
}

// ── Pipeline ──────────────────────────────────────────────────────────────

/// Drives one change through clone → analysis → generate → execute →
/// triage → patch → report. Stages run strictly in order on the calling
/// task; the first error aborts the run.
pub struct Pipeline {
    pub config: Arc<Config>,
    pub workspace: WorkspaceManager,
    pub generator: Arc<dyn TestGenerator>,
    pub parser: Arc<dyn ResultParser>,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        runner: Arc<dyn CommandRunner>,
        generator: Arc<dyn TestGenerator>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let p = Self {
            workspace: WorkspaceManager::new(Arc::clone(&config), runner),
            config,
            generator,
            parser: Arc::new(SubstringParser),
            store,
            notifier,
            event_tx: tx,
        };
        (p, rx)
    }

    pub fn with_parser(mut self, parser: Arc<dyn ResultParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Execute a full run for `change`. Never fails: every outcome,
    /// including an aborted run, is reported through the returned record.
    pub async fn run(&self, change: ChangeRef) -> PipelineRun {
        let mut run = PipelineRun::new(change);
        run.status = RunStatus::Running;
        match self.store.create_run(&run) {
            Ok(id) => run.id = id,
            Err(e) => warn!(change = %run.change, "failed to persist new run: {e:#}"),
        }
        info!(run_id = run.id, change = %run.change, "pipeline run started");

        let mut workspace = None;
        match self.run_stages(&mut run, &mut workspace).await {
            Ok(()) => run.status = run.completed_status(),
            Err(e) => self.abort(&mut run, &e).await,
        }
        run.finished_at = Some(Utc::now());

        if let Err(e) = self.store.update_run(&run) {
            warn!(run_id = run.id, "failed to persist finished run: {e:#}");
        }

        if let Some(ws) = workspace {
            if self.config.keep_workspaces {
                info!(run_id = run.id, path = %ws.display(), "keeping workspace");
            } else {
                workspace::remove_workspace(&ws);
            }
        }

        info!(
            run_id = run.id,
            change = %run.change,
            status = run.status.as_str(),
            stages = run.finished_stage_count(),
            "pipeline run finished"
        );
        self.emit(PipelineEvent::Finished {
            run_id: run.id,
            status: run.status,
        });
        run
    }

    async fn run_stages(&self, run: &mut PipelineRun, workspace: &mut Option<PathBuf>) -> Result<()> {
        let ws = self.workspace.create_workspace()?;
        run.append_log(&format!("workspace: {}", ws.display()));
        *workspace = Some(ws.clone());
        let mut ctx = RunContext { workspace: ws };

        for kind in StageKind::ALL {
            let mut log = self.begin_stage(run, kind)?;
            match self.execute_stage(kind, run, &mut ctx, &mut log).await {
                Ok(done) => self.finish_stage(run, kind, log, done)?,
                Err(e) => {
                    log.line(format!("ERROR: {e:#}"));
                    let closed = StageDone::with_status(StageStatus::Failure, Value::Null);
                    if let Err(persist) = self.finish_stage(run, kind, log, closed) {
                        warn!(run_id = run.id, stage = kind.as_str(), "failed to close stage: {persist:#}");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Top-level handler: the run is over, record why and tell the origin.
    async fn abort(&self, run: &mut PipelineRun, err: &anyhow::Error) {
        let msg = format!("{err:#}");
        error!(run_id = run.id, change = %run.change, "pipeline failed: {msg}");
        run.append_log(&format!("ERROR: {msg}"));
        run.status = RunStatus::Failure;
        self.notify(run, &format!("Pipeline failed: {msg}")).await;
    }

    // ── Stage bookkeeping ─────────────────────────────────────────────────

    fn begin_stage(&self, run: &mut PipelineRun, kind: StageKind) -> Result<StageLog> {
        let mut stage = Stage::new(run.id, kind);
        stage.status = StageStatus::Running;
        stage.started_at = Some(Utc::now());
        stage.id = self
            .store
            .create_stage(&stage)
            .with_context(|| format!("failed to persist {} stage", kind.as_str()))?;
        run.stages.push(stage);

        info!(run_id = run.id, stage = kind.as_str(), "stage started");
        self.emit(PipelineEvent::Stage {
            run_id: run.id,
            stage: kind,
            status: StageStatus::Running,
        });
        Ok(StageLog::default())
    }

    fn finish_stage(&self, run: &mut PipelineRun, kind: StageKind, log: StageLog, done: StageDone) -> Result<()> {
        let run_id = run.id;
        let stage = run
            .stages
            .iter_mut()
            .rev()
            .find(|s| s.kind == kind)
            .with_context(|| format!("{} stage was never started", kind.as_str()))?;
        stage.status = done.status;
        stage.finished_at = Some(Utc::now());
        stage.log = log.into_string();
        stage.payload = done.payload;
        self.store
            .update_stage(stage)
            .with_context(|| format!("failed to persist {} stage", kind.as_str()))?;

        info!(run_id, stage = kind.as_str(), status = done.status.as_str(), "stage finished");
        self.emit(PipelineEvent::Stage {
            run_id,
            stage: kind,
            status: done.status,
        });
        Ok(())
    }

    async fn execute_stage(
        &self,
        kind: StageKind,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        log: &mut StageLog,
    ) -> Result<StageDone> {
        match kind {
            StageKind::Clone => self.clone_stage(run, ctx, log).await,
            StageKind::Analysis => self.analysis_stage(ctx, log).await,
            StageKind::Generate => self.generate_stage(run, ctx, log).await,
            StageKind::Execute => self.execute_tests_stage(run, ctx, log).await,
            StageKind::Triage => self.triage_stage(run, log),
            StageKind::Patch => self.patch_stage(run, log),
            StageKind::Report => self.report_stage(run, log).await,
        }
    }

    // ── Stages ────────────────────────────────────────────────────────────

    async fn clone_stage(&self, run: &mut PipelineRun, ctx: &RunContext, log: &mut StageLog) -> Result<StageDone> {
        let repo_url = self.config.repo_url(&run.change.repo);
        let result = self
            .workspace
            .fetch_change(&ctx.workspace, &repo_url, run.change.number, &self.config.github_token)
            .await;
        log.command(
            &format!("fetch {repo_url} {}", run.change.local_branch()),
            &result,
        );
        run.append_log(&format!("clone code={}", result.exit_code));
        if !result.success() {
            return Err(PipelineError::CloneFailed {
                exit_code: result.exit_code,
            }
            .into());
        }
        Ok(StageDone::success(json!({ "exit_code": result.exit_code })))
    }

    async fn analysis_stage(&self, ctx: &RunContext, log: &mut StageLog) -> Result<StageDone> {
        let runs = analysis::run_analyzers(
            &self.workspace,
            &ctx.workspace,
            &self.config.analyzers,
            Duration::from_secs(self.config.analysis_timeout_s),
        )
        .await;
        if runs.is_empty() {
            log.line("no analyzers configured");
        }
        for r in &runs {
            log.line(format!("{}:", r.tool));
            log.command(&r.command, &r.result);
        }
        Ok(StageDone::success(analysis::payload(&runs)))
    }

    async fn generate_stage(&self, run: &mut PipelineRun, ctx: &RunContext, log: &mut StageLog) -> Result<StageDone> {
        let candidates: Vec<String> = self
            .workspace
            .list_source_files(&ctx.workspace)
            .into_iter()
            .filter(|p| is_generation_candidate(p))
            .collect();
        log.line(format!("{} source files eligible", candidates.len()));

        let mut tests = Vec::with_capacity(candidates.len());
        for path in &candidates {
            let source = match self.workspace.read_file(&ctx.workspace, path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(run_id = run.id, %path, "unreadable source, generating from empty text: {e:#}");
                    String::new()
                }
            };
            let test = self.generator.generate(path, &source).await;
            log.line(format!("{path} -> {} ({})", test.path, test.rationale));
            tests.push(test);
        }

        for (original, renamed) in dedupe_destinations(&mut tests) {
            warn!(run_id = run.id, %original, %renamed, "generated test path collision, renamed");
            log.line(format!("{original} already taken, wrote {renamed}"));
        }

        let files: BTreeMap<String, String> = tests
            .iter()
            .map(|t| (t.path.clone(), t.content.clone()))
            .collect();
        self.workspace.write_files(&ctx.workspace, &files).await?;
        for test in &tests {
            self.store.insert_generated_test(run.id, test)?;
        }

        let remote = tests.iter().filter(|t| t.source == GenerationSource::Remote).count();
        let heuristic = tests.len() - remote;
        log.line(format!("Generated {} test files", tests.len()));
        let payload = json!({
            "count": tests.len(),
            "remote": remote,
            "heuristic": heuristic,
            "files": files.keys().collect::<Vec<_>>(),
        });
        run.generated_tests = tests;
        Ok(StageDone::success(payload))
    }

    async fn execute_tests_stage(&self, run: &mut PipelineRun, ctx: &RunContext, log: &mut StageLog) -> Result<StageDone> {
        let (env, steps) = self.workspace.prepare_environment(&ctx.workspace).await;
        for step in &steps {
            log.step(step);
        }
        let env = env.ok_or(PipelineError::EnvironmentUnavailable)?;

        for step in self.workspace.install_dependencies(&ctx.workspace, &env).await {
            log.step(&step);
        }

        let started_at = Utc::now();
        let exec = self.workspace.run_tests(&ctx.workspace, &env).await;
        log.command(&exec.command, &exec.result);

        let counts = self.parser.counts(&exec.result.output);
        let mut result = TestRunResult {
            id: 0,
            run_id: run.id,
            passed: counts.passed,
            failed: counts.failed,
            errors: counts.errors,
            exit_code: exec.result.exit_code,
            raw_output: exec.result.output,
            report: exec.report,
            started_at,
            finished_at: Some(Utc::now()),
        };
        result.id = self.store.insert_test_run(&result)?;
        log.line(format!(
            "Test result: {} passed, {} failed, {} errors (exit {})",
            result.passed, result.failed, result.errors, result.exit_code
        ));

        let status = if result.exit_code == 0 {
            StageStatus::Success
        } else {
            StageStatus::Failure
        };
        let payload = json!({
            "exit_code": result.exit_code,
            "passed": result.passed,
            "failed": result.failed,
            "errors": result.errors,
            "has_report": result.report.is_some(),
        });
        run.test_result = Some(result);
        Ok(StageDone::with_status(status, payload))
    }

    fn triage_stage(&self, run: &mut PipelineRun, log: &mut StageLog) -> Result<StageDone> {
        let (failures, test_run_id) = match &run.test_result {
            Some(r) => (self.parser.failures(&r.raw_output), r.id),
            None => (Vec::new(), 0),
        };
        let clusters = cluster_failures(&failures);

        for failure in &failures {
            self.store.insert_failure(test_run_id, failure)?;
        }
        for cluster in &clusters {
            self.store.insert_cluster(run.id, cluster)?;
        }

        let overview: Vec<Value> = clusters
            .iter()
            .map(|c| json!({ "signature": c.signature, "summary": c.summary, "count": c.count }))
            .collect();
        log.line(format!("{} failures in {} clusters", failures.len(), clusters.len()));
        log.line(serde_json::to_string_pretty(&overview)?);

        let payload = json!({ "failures": failures.len(), "clusters": clusters.len() });
        run.failures = failures;
        run.clusters = clusters;
        Ok(StageDone::success(payload))
    }

    fn patch_stage(&self, run: &mut PipelineRun, log: &mut StageLog) -> Result<StageDone> {
        let patches = suggest_patches(&run.failures);
        for patch in &patches {
            self.store.insert_patch(run.id, patch)?;
        }
        if patches.is_empty() {
            log.line("No failures -> no patch");
        } else {
            log.line(format!("Suggested {} patch", patches.len()));
        }
        let payload = json!({ "suggestions": patches.len() });
        run.patches = patches;
        Ok(StageDone::success(payload))
    }

    async fn report_stage(&self, run: &mut PipelineRun, log: &mut StageLog) -> Result<StageDone> {
        let counts = run
            .test_result
            .as_ref()
            .map(TestRunResult::counts)
            .unwrap_or_default();
        let summary = format!(
            "Static analysis done. Generated {} tests. Test result: {} passed, {} failed, {} errors. Status: {}.",
            run.generated_tests.len(),
            counts.passed,
            counts.failed,
            counts.errors,
            run.completed_status().as_str()
        );
        log.line(&summary);
        let notified = self.notify(run, &summary).await;
        if !notified {
            log.line("notification failed");
        }
        Ok(StageDone::success(json!({ "summary": summary, "notified": notified })))
    }

    // ── Notify + event broadcast ──────────────────────────────────────────

    /// Best-effort: a delivery failure is logged and reported as `false`.
    async fn notify(&self, run: &PipelineRun, message: &str) -> bool {
        self.emit(PipelineEvent::Notify {
            repo: run.change.repo.clone(),
            number: run.change.number,
            message: message.to_string(),
        });
        match self
            .notifier
            .notify(&run.change.repo, run.change.number, message)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = run.id, change = %run.change, "notification failed: {e:#}");
                false
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }
}
