//! Static analyzers. Each configured command runs once from the workspace
//! root; exit codes are recorded but never fail the stage.

use std::{path::Path, time::Duration};

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::{
    exec::{CommandSpec, ExecResult},
    workspace::WorkspaceManager,
};

#[derive(Debug, Clone)]
pub struct AnalyzerRun {
    pub tool: String,
    pub command: String,
    pub result: ExecResult,
}

fn tool_name(spec: &CommandSpec) -> String {
    Path::new(&spec.program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| spec.program.clone())
}

/// Run every analyzer in order. A missing tool shows up as exit 127 and a
/// slow one as exit 124; both are just recorded.
pub async fn run_analyzers(
    workspace: &WorkspaceManager,
    dir: &Path,
    analyzers: &[CommandSpec],
    timeout: Duration,
) -> Vec<AnalyzerRun> {
    let mut runs = Vec::with_capacity(analyzers.len());
    for spec in analyzers {
        let tool = tool_name(spec);
        let result = workspace.run_command(spec, dir, &[], timeout).await;
        if result.success() {
            info!(%tool, "analyzer clean");
        } else {
            warn!(%tool, exit_code = result.exit_code, "analyzer reported findings or failed");
        }
        runs.push(AnalyzerRun {
            tool,
            command: spec.display(),
            result,
        });
    }
    runs
}

/// `{tool: exit_code}` for the analysis stage payload.
pub fn payload(runs: &[AnalyzerRun]) -> Value {
    let mut map = Map::new();
    for run in runs {
        map.insert(run.tool.clone(), json!(run.result.exit_code));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, exec::ProcessRunner};
    use std::sync::Arc;

    #[tokio::test]
    async fn nonzero_and_missing_tools_are_recorded() {
        let ws = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(Arc::new(Config::default()), Arc::new(ProcessRunner::direct()));
        let analyzers = vec![
            CommandSpec::new("sh").args(["-c", "echo finding; exit 1"]),
            CommandSpec::new("vigil-missing-analyzer").arg("."),
        ];
        let runs = run_analyzers(&manager, ws.path(), &analyzers, Duration::from_secs(10)).await;

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].tool, "sh");
        assert_eq!(runs[0].result.exit_code, 1);
        assert!(runs[0].result.output.contains("finding"));
        assert_eq!(runs[1].result.exit_code, crate::exec::SPAWN_FAILURE_EXIT_CODE);

        let p = payload(&runs);
        assert_eq!(p["sh"], 1);
        assert_eq!(p["vigil-missing-analyzer"], 127);
    }

    #[test]
    fn tool_name_is_program_basename() {
        assert_eq!(tool_name(&CommandSpec::new("/usr/bin/flake8")), "flake8");
        assert_eq!(tool_name(&CommandSpec::new("bandit")), "bandit");
    }
}
