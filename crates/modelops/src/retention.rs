use statestore::{CategoryId, Iteration, IterationStatus, ModelStatus, StoreError, WorkspaceStore};
use tracing::info;

use crate::{ModelFactory, ModelOpsError, ModelType, Result};

/// Indices whose models should go: among READY iterations in `0..=up_to`,
/// all but the most recent `keep`.
pub fn iterations_to_prune(iterations: &[Iteration], up_to: usize, keep: usize) -> Vec<usize> {
    let ready: Vec<usize> = iterations
        .iter()
        .enumerate()
        .take(up_to.saturating_add(1))
        .filter(|(_, it)| it.status == IterationStatus::Ready)
        .map(|(i, _)| i)
        .collect();
    let excess = ready.len().saturating_sub(keep);
    ready[..excess].to_vec()
}

/// Delete one iteration's model artifacts, then mark the model DELETED and
/// the iteration MODEL_DELETED in a single write.
pub fn delete_iteration_model(
    store: &WorkspaceStore,
    factory: &ModelFactory,
    workspace_id: &str,
    category_id: Option<CategoryId>,
    index: usize,
) -> Result<()> {
    let it = store.get_iteration(workspace_id, category_id, index)?;
    let model = it.model.ok_or(StoreError::NoModel(index))?;
    if model.model_status != ModelStatus::Ready || it.status != IterationStatus::Ready {
        return Err(ModelOpsError::ModelNotActive {
            model_id: model.model_id,
            status: model.model_status,
        });
    }

    let classifier = factory.get(&ModelType::new(model.model_type.as_str()))?;
    classifier
        .delete_model(&model.model_id)
        .map_err(ModelOpsError::Classifier)?;

    store.update_workspace(workspace_id, |ws| {
        let it = ws.track_mut(category_id)?.iteration_mut(index)?;
        if !it.status.can_transition_to(IterationStatus::ModelDeleted) {
            return Err(StoreError::IllegalTransition {
                from: it.status,
                to: IterationStatus::ModelDeleted,
            });
        }
        it.model.as_mut().ok_or(StoreError::NoModel(index))?.model_status = ModelStatus::Deleted;
        it.status = IterationStatus::ModelDeleted;
        Ok(())
    })?;
    info!(workspace_id, ?category_id, iteration = index, model_id = %model.model_id, "pruned model");
    Ok(())
}

/// Keep only the newest `keep` READY models among iterations `0..=up_to`.
/// Returns the pruned iteration indices.
pub fn prune_models(
    store: &WorkspaceStore,
    factory: &ModelFactory,
    workspace_id: &str,
    category_id: Option<CategoryId>,
    up_to: usize,
    keep: usize,
) -> Result<Vec<usize>> {
    let iterations = store.get_all_iterations(workspace_id, category_id)?;
    let doomed = iterations_to_prune(&iterations, up_to, keep);
    for &index in &doomed {
        delete_iteration_model(store, factory, workspace_id, category_id, index)?;
    }
    Ok(doomed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_status(statuses: &[IterationStatus]) -> Vec<Iteration> {
        statuses
            .iter()
            .map(|s| Iteration {
                status: *s,
                ..Iteration::new()
            })
            .collect()
    }

    #[test]
    fn keeps_most_recent_ready() {
        use IterationStatus::*;
        let its = with_status(&[Ready, Ready, Ready, Ready]);
        assert_eq!(iterations_to_prune(&its, 3, 2), vec![0, 1]);
    }

    #[test]
    fn ignores_non_ready_and_later_iterations() {
        use IterationStatus::*;
        let its = with_status(&[Ready, Error, ModelDeleted, Ready, Ready, Ready]);
        // only 0..=4 are considered: READY at 0, 3, 4
        assert_eq!(iterations_to_prune(&its, 4, 2), vec![0]);
        assert!(iterations_to_prune(&its, 4, 5).is_empty());
    }
}
