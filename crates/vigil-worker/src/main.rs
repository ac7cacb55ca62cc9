use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};
use vigil_agent::TestGenAdapter;
use vigil_core::{
    config::Config,
    exec::ProcessRunner,
    notify::{GithubNotifier, LogNotifier, Notifier},
    pipeline::Pipeline,
    sandbox::Sandbox,
    store::MemoryStore,
    ChangeRef, PipelineEvent, RunStatus,
};
use vigil_worker::{
    invocation::{Delivery, Invocation},
    snapshot::write_snapshot,
};

fn read_payload(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(p) => std::fs::read(p).with_context(|| format!("failed to read {}", p.display())),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read event from stdin")?;
            Ok(buf)
        }
    }
}

fn resolve_change(invocation: Invocation, config: &Config) -> anyhow::Result<Option<ChangeRef>> {
    match invocation {
        Invocation::Run(change) => Ok(Some(change)),
        Invocation::Event { path } => {
            let body = read_payload(path.as_deref())?;
            let event = Delivery::event_name_from_env();
            let signature = Delivery::signature_from_env();
            Delivery {
                event: &event,
                body: &body,
                signature: &signature,
            }
            .accept(config)
        }
    }
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_worker=info,vigil_core=info,vigil_agent=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = Invocation::parse(&args)?;
    let config = Config::from_env()?;

    let Some(change) = resolve_change(invocation, &config)? else {
        return Ok(());
    };

    std::fs::create_dir_all(&config.workspace_root)
        .with_context(|| format!("failed to create {}", config.workspace_root))?;
    let config = Arc::new(config);

    let sandbox_mode = Sandbox::detect(&config.sandbox_backend).await;
    let runner = Arc::new(ProcessRunner::new(sandbox_mode, &config.container_image));

    let notifier: Arc<dyn Notifier> = if config.github_token.is_empty() {
        info!("GITHUB_TOKEN not set, notifications go to the log");
        Arc::new(LogNotifier)
    } else {
        Arc::new(GithubNotifier::new(&config.github_api_url, &config.github_token)?)
    };

    let generator = Arc::new(TestGenAdapter::from_config(&config));
    let store = Arc::new(MemoryStore::new());
    let (pipeline, mut events) = Pipeline::new(Arc::clone(&config), runner, generator, store, notifier);

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                PipelineEvent::Stage { run_id, stage, status } => {
                    debug!(run_id, stage = stage.as_str(), status = status.as_str(), "stage event");
                }
                PipelineEvent::Finished { run_id, status } => {
                    debug!(run_id, status = status.as_str(), "run event");
                }
                PipelineEvent::Notify { repo, number, .. } => {
                    debug!(%repo, number, "notify event");
                }
            }
        }
    });

    let run = pipeline.run(change).await;

    match write_snapshot(Path::new(&config.data_dir), &run) {
        Ok(path) => info!(path = %path.display(), "run snapshot written"),
        Err(e) => warn!("failed to write run snapshot: {e:#}"),
    }

    if run.status != RunStatus::Success {
        std::process::exit(1);
    }
    Ok(())
}
