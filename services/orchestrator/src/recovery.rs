use serde_json::json;
use statestore::{IterationStatus, IterationTrack, ModelStatus, StoreError, WorkspaceKind, WorkspaceStore};
use tracing::{info, warn};

pub const RESTART_ERROR: &str = "orchestrator_restart";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub workspaces: usize,
    pub iterations_failed: usize,
    pub models_failed: usize,
}

/// Fail every iteration a previous process left in the pipeline. Their
/// continuations died with that process, so they would never settle.
pub fn recover_interrupted_iterations(store: &WorkspaceStore) -> statestore::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for ws in store.list_workspaces()? {
        report.workspaces += 1;
        let outcome = store.update_workspace(&ws.workspace_id, |draft| {
            let mut counts = (0, 0);
            match &mut draft.kind {
                WorkspaceKind::Binary { categories, .. } => {
                    for cat in categories.values_mut() {
                        fail_interrupted(&mut cat.track, &mut counts);
                    }
                }
                WorkspaceKind::Multiclass { track, .. } => fail_interrupted(track, &mut counts),
            }
            Ok(counts)
        });
        match outcome {
            Ok((0, 0)) => {}
            Ok((iterations, models)) => {
                warn!(workspace_id = %ws.workspace_id, iterations, models, "failed interrupted iterations");
                report.iterations_failed += iterations;
                report.models_failed += models;
            }
            Err(e @ StoreError::WorkspaceLoad { .. }) => {
                warn!(workspace_id = %ws.workspace_id, error = %e, "skipping unreadable workspace");
            }
            Err(e) => return Err(e),
        }
    }
    info!(?report, "recovery finished");
    Ok(report)
}

fn fail_interrupted(track: &mut IterationTrack, counts: &mut (usize, usize)) {
    for it in track.iterations.iter_mut().filter(|it| !it.status.is_terminal()) {
        it.status = IterationStatus::Error;
        it.iteration_statistics
            .insert("error".into(), json!(RESTART_ERROR));
        counts.0 += 1;
        if let Some(model) = it.model.as_mut().filter(|m| m.model_status == ModelStatus::Training) {
            model.model_status = ModelStatus::Error;
            counts.1 += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_iterations_become_errors() {
        let store = WorkspaceStore::in_memory();
        store.create_workspace("ws", "ds").unwrap();
        let cat = store.add_category("ws", "c", "").unwrap();
        let done = store.add_iteration("ws", Some(cat)).unwrap();
        for s in [
            IterationStatus::Training,
            IterationStatus::RunningInference,
            IterationStatus::RunningActiveLearning,
            IterationStatus::CalculatingStatistics,
            IterationStatus::Ready,
        ] {
            store.update_iteration_status("ws", Some(cat), done, s).unwrap();
        }
        let stuck = store.add_iteration("ws", Some(cat)).unwrap();

        let report = recover_interrupted_iterations(&store).unwrap();
        assert_eq!(report.iterations_failed, 1);

        let its = store.get_all_iterations("ws", Some(cat)).unwrap();
        assert_eq!(its[done].status, IterationStatus::Ready);
        assert_eq!(its[stuck].status, IterationStatus::Error);
        assert_eq!(its[stuck].iteration_statistics["error"], json!(RESTART_ERROR));

        // nothing left to recover
        assert_eq!(recover_interrupted_iterations(&store).unwrap().iterations_failed, 0);
    }
}
