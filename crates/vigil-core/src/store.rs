//! Persistence collaborator. The orchestrator only talks to [`Store`];
//! [`MemoryStore`] keeps everything in process for the worker and tests.

use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::types::{
    FailureCluster, FailureRecord, GeneratedTest, PatchSuggestion, PipelineRun, Stage,
    TestRunResult,
};

pub trait Store: Send + Sync {
    /// Persist a new run and return its id.
    fn create_run(&self, run: &PipelineRun) -> Result<i64>;
    fn update_run(&self, run: &PipelineRun) -> Result<()>;

    /// Persist a new stage and return its id.
    fn create_stage(&self, stage: &Stage) -> Result<i64>;
    fn update_stage(&self, stage: &Stage) -> Result<()>;

    fn insert_generated_test(&self, run_id: i64, test: &GeneratedTest) -> Result<()>;
    fn insert_test_run(&self, result: &TestRunResult) -> Result<i64>;
    fn insert_failure(&self, test_run_id: i64, failure: &FailureRecord) -> Result<()>;
    fn insert_cluster(&self, run_id: i64, cluster: &FailureCluster) -> Result<()>;
    fn insert_patch(&self, run_id: i64, patch: &PatchSuggestion) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    runs: Vec<PipelineRun>,
    stages: Vec<Stage>,
    generated_tests: Vec<(i64, GeneratedTest)>,
    test_runs: Vec<TestRunResult>,
    failures: Vec<(i64, FailureRecord)>,
    clusters: Vec<(i64, FailureCluster)>,
    patches: Vec<(i64, PatchSuggestion)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn run(&self, id: i64) -> Option<PipelineRun> {
        self.lock().runs.iter().find(|r| r.id == id).cloned()
    }

    pub fn stages(&self, run_id: i64) -> Vec<Stage> {
        self.lock()
            .stages
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn generated_tests(&self, run_id: i64) -> Vec<GeneratedTest> {
        rows_for(&self.lock().generated_tests, run_id)
    }

    pub fn test_runs(&self, run_id: i64) -> Vec<TestRunResult> {
        self.lock()
            .test_runs
            .iter()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn failures(&self, test_run_id: i64) -> Vec<FailureRecord> {
        rows_for(&self.lock().failures, test_run_id)
    }

    pub fn clusters(&self, run_id: i64) -> Vec<FailureCluster> {
        rows_for(&self.lock().clusters, run_id)
    }

    pub fn patches(&self, run_id: i64) -> Vec<PatchSuggestion> {
        rows_for(&self.lock().patches, run_id)
    }
}

fn rows_for<T: Clone>(rows: &[(i64, T)], owner: i64) -> Vec<T> {
    rows.iter()
        .filter(|(id, _)| *id == owner)
        .map(|(_, row)| row.clone())
        .collect()
}

fn next_id(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX - 1) + 1
}

impl Store for MemoryStore {
    fn create_run(&self, run: &PipelineRun) -> Result<i64> {
        let mut state = self.lock();
        let id = next_id(state.runs.len());
        let mut row = run.clone();
        row.id = id;
        state.runs.push(row);
        Ok(id)
    }

    fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let mut state = self.lock();
        let row = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| anyhow!("run #{} not found", run.id))?;
        *row = run.clone();
        Ok(())
    }

    fn create_stage(&self, stage: &Stage) -> Result<i64> {
        let mut state = self.lock();
        let id = next_id(state.stages.len());
        let mut row = stage.clone();
        row.id = id;
        state.stages.push(row);
        Ok(id)
    }

    fn update_stage(&self, stage: &Stage) -> Result<()> {
        let mut state = self.lock();
        let row = state
            .stages
            .iter_mut()
            .find(|s| s.id == stage.id)
            .ok_or_else(|| anyhow!("stage #{} not found", stage.id))?;
        *row = stage.clone();
        Ok(())
    }

    fn insert_generated_test(&self, run_id: i64, test: &GeneratedTest) -> Result<()> {
        self.lock().generated_tests.push((run_id, test.clone()));
        Ok(())
    }

    fn insert_test_run(&self, result: &TestRunResult) -> Result<i64> {
        let mut state = self.lock();
        let id = next_id(state.test_runs.len());
        let mut row = result.clone();
        row.id = id;
        state.test_runs.push(row);
        Ok(id)
    }

    fn insert_failure(&self, test_run_id: i64, failure: &FailureRecord) -> Result<()> {
        self.lock().failures.push((test_run_id, failure.clone()));
        Ok(())
    }

    fn insert_cluster(&self, run_id: i64, cluster: &FailureCluster) -> Result<()> {
        self.lock().clusters.push((run_id, cluster.clone()));
        Ok(())
    }

    fn insert_patch(&self, run_id: i64, patch: &PatchSuggestion) -> Result<()> {
        self.lock().patches.push((run_id, patch.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeRef, StageKind, StageStatus};

    #[test]
    fn ids_are_assigned_sequentially() {
        let store = MemoryStore::new();
        let a = store.create_run(&PipelineRun::new(ChangeRef::new("o/r", 1))).unwrap();
        let b = store.create_run(&PipelineRun::new(ChangeRef::new("o/r", 2))).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(store.run(b).unwrap().change.number, 2);
    }

    #[test]
    fn stage_updates_replace_the_row() {
        let store = MemoryStore::new();
        let mut stage = Stage::new(7, StageKind::Analysis);
        stage.id = store.create_stage(&stage).unwrap();
        stage.status = StageStatus::Success;
        stage.log = "done".into();
        store.update_stage(&stage).unwrap();

        let stages = store.stages(7);
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Success);
        assert_eq!(stages[0].log, "done");
    }

    #[test]
    fn updating_unknown_rows_fails() {
        let store = MemoryStore::new();
        let mut run = PipelineRun::new(ChangeRef::new("o/r", 1));
        run.id = 99;
        assert!(store.update_run(&run).is_err());
        let mut stage = Stage::new(1, StageKind::Clone);
        stage.id = 5;
        assert!(store.update_stage(&stage).is_err());
    }

    #[test]
    fn child_rows_are_scoped_to_their_owner() {
        let store = MemoryStore::new();
        let patch = PatchSuggestion {
            diff: "d".into(),
            rationale: "r".into(),
            applied: false,
        };
        store.insert_patch(1, &patch).unwrap();
        assert_eq!(store.patches(1).len(), 1);
        assert!(store.patches(2).is_empty());
    }
}
