use anyhow::{Context, Result};
use jobs::JobScheduler;
use modelops::ModelFactory;
use orchestrator::{recover_interrupted_iterations, AppConfig, Orchestrator};
use statestore::{IterationStatus, WorkspaceKind};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;
    info!(data_dir = %cfg.data_dir.display(), cpu_workers = cfg.cpu_workers, gpu_workers = cfg.gpu_workers, "starting orchestrator");

    let scheduler = JobScheduler::new(cfg.scheduler()).context("Failed to start job scheduler")?;
    // Classifiers are registered by the embedding deployment.
    let orch = Orchestrator::from_config(cfg, scheduler, ModelFactory::new())
        .context("Failed to open workspace store")?;

    // RECOVERY: iterations from a previous run can never settle
    let report = recover_interrupted_iterations(orch.store()).context("Iteration recovery failed")?;
    info!(
        workspaces = report.workspaces,
        iterations_failed = report.iterations_failed,
        models_failed = report.models_failed,
        "recovery done"
    );

    for ws in orch.store().list_workspaces()? {
        let tracks: Vec<_> = match &ws.kind {
            WorkspaceKind::Binary { .. } => ws.categories().into_iter().map(|c| &c.track).collect(),
            WorkspaceKind::Multiclass { track, .. } => vec![track],
        };
        let iterations: usize = tracks.iter().map(|t| t.iterations.len()).sum();
        let ready = tracks
            .iter()
            .flat_map(|t| t.iterations.iter())
            .filter(|it| it.status == IterationStatus::Ready)
            .count();
        info!(
            workspace_id = %ws.workspace_id,
            dataset = %ws.dataset_name,
            kind = ws.kind.name(),
            categories = ws.categories().len(),
            iterations,
            ready,
            "workspace loaded"
        );
    }

    info!("orchestrator ready");
    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
