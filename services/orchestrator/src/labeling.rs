//! Synchronous workspace, category and label operations. Failures here are
//! returned to the caller.

use std::collections::HashSet;
use std::path::PathBuf;

use modelops::ModelType;
use statestore::{CategoryId, IterationStatus, IterationTrack, ModelStatus, WorkspaceKind};
use tracing::{info, warn};

use crate::data_access::{Element, Label, LabelCounts};
use crate::pipeline::Orchestrator;
use crate::{OrchestratorError, Result};

impl Orchestrator {
    /// The dataset must already hold elements.
    pub fn create_workspace(&self, workspace_id: &str, dataset_name: &str) -> Result<()> {
        self.data.get_all_elements(dataset_name)?;
        self.store.create_workspace(workspace_id, dataset_name)?;
        info!(workspace_id, dataset_name, "workspace created");
        Ok(())
    }

    /// Remove the workspace record, its labels and every model it still owns.
    pub fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        let ws = self.store.get_workspace(workspace_id)?;
        match &ws.kind {
            WorkspaceKind::Binary { categories, .. } => {
                for cat in categories.values() {
                    self.delete_track_models(workspace_id, &cat.track);
                }
            }
            WorkspaceKind::Multiclass { track, .. } => self.delete_track_models(workspace_id, track),
        }
        self.data.delete_all_labels(workspace_id, &ws.dataset_name)?;
        self.store.delete_workspace(workspace_id)?;
        info!(workspace_id, "workspace deleted");
        Ok(())
    }

    pub fn create_category(&self, workspace_id: &str, name: &str, description: &str) -> Result<CategoryId> {
        let id = self.store.add_category(workspace_id, name, description)?;
        info!(workspace_id, category_id = id, name, "category created");
        Ok(id)
    }

    pub fn delete_category(&self, workspace_id: &str, category_id: CategoryId) -> Result<()> {
        let (dataset_name, track) = self.store.read_workspace(workspace_id, |ws| {
            Ok((ws.dataset_name.clone(), ws.track(Some(category_id))?.clone()))
        })?;
        self.delete_track_models(workspace_id, &track);
        self.data
            .delete_labels_for_category(workspace_id, &dataset_name, category_id)?;
        self.store.delete_category(workspace_id, category_id)?;
        info!(workspace_id, category_id, "category deleted");
        Ok(())
    }

    fn delete_track_models(&self, workspace_id: &str, track: &IterationTrack) {
        for model in track.iterations.iter().filter_map(|it| it.model.as_ref()) {
            if model.model_status == ModelStatus::Deleted {
                continue;
            }
            let deleted = self
                .factory
                .get(&ModelType::new(model.model_type.as_str()))
                .map_err(OrchestratorError::from)
                .and_then(|c| c.delete_model(&model.model_id).map_err(OrchestratorError::Model));
            if let Err(e) = deleted {
                warn!(workspace_id, model_id = %model.model_id, error = %e, "could not delete model");
            }
        }
    }

    /// Dataset of the workspace, once the category is known to be live.
    fn dataset_for(&self, workspace_id: &str, category_id: CategoryId) -> Result<String> {
        Ok(self.store.read_workspace(workspace_id, |ws| {
            ws.category(category_id)?;
            Ok(ws.dataset_name.clone())
        })?)
    }

    /// Set labels and add the number of elements whose label changed to the
    /// category's change counter.
    pub fn set_labels(&self, workspace_id: &str, category_id: CategoryId, labels: &[(String, Label)]) -> Result<usize> {
        let dataset_name = self.dataset_for(workspace_id, category_id)?;
        let changed = self
            .data
            .set_labels(workspace_id, &dataset_name, category_id, labels)?;
        self.count_changes(workspace_id, category_id, changed)?;
        Ok(changed)
    }

    pub fn unset_labels(&self, workspace_id: &str, category_id: CategoryId, uris: &[String]) -> Result<usize> {
        let dataset_name = self.dataset_for(workspace_id, category_id)?;
        let changed = self
            .data
            .unset_labels(workspace_id, &dataset_name, category_id, uris)?;
        self.count_changes(workspace_id, category_id, changed)?;
        Ok(changed)
    }

    fn count_changes(&self, workspace_id: &str, category_id: CategoryId, changed: usize) -> Result<()> {
        if changed > 0 {
            let total = self.store.increase_label_change_count_since_last_train(
                workspace_id,
                Some(category_id),
                changed as u64,
            )?;
            info!(workspace_id, category_id, changed, since_last_train = total, "labels changed");
        }
        Ok(())
    }

    /// Deduplicated counts, as used by the retrain policy.
    pub fn get_label_counts(&self, workspace_id: &str, category_id: CategoryId) -> Result<LabelCounts> {
        let dataset_name = self.dataset_for(workspace_id, category_id)?;
        Ok(self
            .data
            .get_label_counts(workspace_id, &dataset_name, category_id, true)?)
    }

    /// Recommendations of the latest READY iteration that are still unlabeled.
    pub fn get_recommendations(&self, workspace_id: &str, category_id: CategoryId) -> Result<Vec<Element>> {
        let (dataset_name, uris) = self.store.read_workspace(workspace_id, |ws| {
            let uris = ws
                .track(Some(category_id))?
                .iterations
                .iter()
                .rev()
                .find(|it| it.status == IterationStatus::Ready)
                .map(|it| it.recommended_uris.clone())
                .unwrap_or_default();
            Ok((ws.dataset_name.clone(), uris))
        })?;
        if uris.is_empty() {
            return Ok(Vec::new());
        }

        let unlabeled: HashSet<String> = self
            .data
            .get_unlabeled_elements(workspace_id, &dataset_name, category_id, false)?
            .into_iter()
            .map(|e| e.uri)
            .collect();
        let still_open: Vec<String> = uris.into_iter().filter(|u| unlabeled.contains(u)).collect();
        Ok(self.data.get_elements_by_uris(&dataset_name, &still_open)?)
    }

    /// Copy the model of a READY iteration out for export.
    pub fn export_model(&self, workspace_id: &str, category_id: CategoryId, index: usize) -> Result<PathBuf> {
        let it = self.store.get_iteration(workspace_id, Some(category_id), index)?;
        let model = it.model.ok_or(statestore::StoreError::NoModel(index))?;
        if it.status != IterationStatus::Ready {
            return Err(modelops::ModelOpsError::ModelNotActive {
                model_id: model.model_id,
                status: model.model_status,
            }
            .into());
        }
        let classifier = self.factory.get(&ModelType::new(model.model_type.as_str()))?;
        classifier
            .copy_model_dir_for_export(&model.model_id)
            .map_err(OrchestratorError::Model)
    }
}
