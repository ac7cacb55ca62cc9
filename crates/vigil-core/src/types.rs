use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Change under test ────────────────────────────────────────────────────

/// The proposed change a run is checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRef {
    /// Repository identifier, e.g. "org/repo".
    pub repo: String,
    pub number: u64,
    /// Head revision the event was raised for. May be empty.
    pub head_sha: String,
    pub head_ref: String,
    pub title: String,
}

impl ChangeRef {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
            head_sha: String::new(),
            head_ref: String::new(),
            title: String::new(),
        }
    }

    /// Local branch the change head is checked out into.
    pub fn local_branch(&self) -> String {
        format!("pr-{}", self.number)
    }
}

impl std::fmt::Display for ChangeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

// ── Status enums ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Queued,
    Running,
    Success,
    Failure,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Clone,
    Analysis,
    Generate,
    Execute,
    Triage,
    Patch,
    Report,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        Self::Clone,
        Self::Analysis,
        Self::Generate,
        Self::Execute,
        Self::Triage,
        Self::Patch,
        Self::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Analysis => "analysis",
            Self::Generate => "generate",
            Self::Execute => "execute",
            Self::Triage => "triage",
            Self::Patch => "patch",
            Self::Report => "report",
        }
    }
}

// ── Run and stage records ────────────────────────────────────────────────

/// One named step of a run. Only the orchestrator mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub run_id: i64,
    pub kind: StageKind,
    pub status: StageStatus,
    pub log: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stage-specific structured result.
    pub payload: serde_json::Value,
}

impl Stage {
    pub fn new(run_id: i64, kind: StageKind) -> Self {
        Self {
            id: 0,
            run_id,
            kind,
            status: StageStatus::Queued,
            log: String::new(),
            started_at: None,
            finished_at: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
            && matches!(self.status, StageStatus::Success | StageStatus::Failure)
    }
}

/// One full pipeline execution for one change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub change: ChangeRef,
    pub status: RunStatus,
    pub stages: Vec<Stage>,
    /// Top-level log; receives workspace info and the fatal error, if any.
    pub log: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub generated_tests: Vec<GeneratedTest>,
    pub test_result: Option<TestRunResult>,
    pub failures: Vec<FailureRecord>,
    pub clusters: Vec<FailureCluster>,
    pub patches: Vec<PatchSuggestion>,
}

impl PipelineRun {
    pub fn new(change: ChangeRef) -> Self {
        Self {
            id: 0,
            change,
            status: RunStatus::Pending,
            stages: Vec::new(),
            log: String::new(),
            created_at: Utc::now(),
            finished_at: None,
            generated_tests: Vec::new(),
            test_result: None,
            failures: Vec::new(),
            clusters: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Append a timestamped line to the run log.
    pub fn append_log(&mut self, msg: &str) {
        self.log
            .push_str(&format!("{} {msg}\n", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")));
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn finished_stage_count(&self) -> usize {
        self.stages.iter().filter(|s| s.is_finished()).count()
    }

    pub fn any_stage_failed(&self) -> bool {
        self.stages.iter().any(|s| s.status == StageStatus::Failure)
    }

    /// Status a run that completed every stage should end with.
    pub fn completed_status(&self) -> RunStatus {
        if self.any_stage_failed() {
            return RunStatus::Failure;
        }
        match &self.test_result {
            Some(r) if r.failed == 0 && r.errors == 0 => RunStatus::Success,
            _ => RunStatus::Failure,
        }
    }
}

// ── Stage artifacts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationSource {
    Remote,
    Heuristic,
}

/// A test file produced during the generate stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTest {
    /// Workspace-relative destination path.
    pub path: String,
    pub content: String,
    pub source: GenerationSource,
    pub rationale: String,
}

/// Aggregate counts parsed from test output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
}

/// Result of the single test execution pass of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResult {
    pub id: i64,
    pub run_id: i64,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub exit_code: i32,
    pub raw_output: String,
    /// Machine-readable report (JUnit XML) when the runner produced one.
    pub report: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TestRunResult {
    pub fn counts(&self) -> TestCounts {
        TestCounts {
            passed: self.passed,
            failed: self.failed,
            errors: self.errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub test_name: String,
    pub file: String,
    pub line: u32,
    pub message: String,
    pub stacktrace: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCluster {
    pub signature: String,
    pub summary: String,
    pub count: usize,
    pub items: Vec<FailureRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSuggestion {
    pub diff: String,
    pub rationale: String,
    pub applied: bool,
}

// ── Pipeline Events ──────────────────────────────────────────────────────

/// Broadcast after each stage transition and at run completion.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Stage {
        run_id: i64,
        stage: StageKind,
        status: StageStatus,
    },
    Finished {
        run_id: i64,
        status: RunStatus,
    },
    Notify {
        repo: String,
        number: u64,
        message: String,
    },
}
