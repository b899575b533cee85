use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::storage::{FileBackedStorage, InMemoryStorage, Storage};
use crate::types::{
    CategoryId, Iteration, IterationStatus, ModelInfo, ModelStatus, Statistics, Workspace,
};
use crate::{Result, StoreError};

type Slot = Arc<Mutex<Option<Workspace>>>;

/// Workspace state store.
///
/// Every operation takes the workspace's own lock, loads the cached copy
/// (reading the record on first use), applies the change to a draft and
/// persists the whole record before publishing the draft to the cache. A
/// failed operation leaves both cache and record untouched. Different
/// workspaces never contend on the same lock.
///
/// The cache is never invalidated from outside, so only one process may
/// own a storage root at a time.
pub struct WorkspaceStore {
    storage: Box<dyn Storage>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl WorkspaceStore {
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self {
            storage: Box::new(storage),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(InMemoryStorage::new())
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(FileBackedStorage::new(dir)?))
    }

    fn slot(&self, workspace_id: &str) -> Slot {
        self.slots
            .lock()
            .entry(workspace_id.to_string())
            .or_default()
            .clone()
    }

    fn loaded<'a>(&self, workspace_id: &str, cached: &'a mut Option<Workspace>) -> Result<&'a mut Workspace> {
        if cached.is_none() {
            let bytes = self
                .storage
                .load(workspace_id)?
                .ok_or_else(|| StoreError::WorkspaceNotFound(workspace_id.to_string()))?;
            let ws: Workspace = serde_json::from_slice(&bytes).map_err(|e| StoreError::WorkspaceLoad {
                workspace_id: workspace_id.to_string(),
                reason: e.to_string(),
            })?;
            debug!(workspace_id, "loaded workspace record");
            *cached = Some(ws);
        }
        cached
            .as_mut()
            .ok_or_else(|| StoreError::WorkspaceNotFound(workspace_id.to_string()))
    }

    fn persist(&self, ws: &Workspace) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(ws)?;
        self.storage.save(&ws.workspace_id, &bytes)?;
        Ok(())
    }

    /// Atomic read-modify-write of a whole workspace.
    pub fn update_workspace<R>(
        &self,
        workspace_id: &str,
        f: impl FnOnce(&mut Workspace) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(workspace_id);
        let mut guard = slot.lock();
        let current = self.loaded(workspace_id, &mut guard)?;
        let mut draft = current.clone();
        let out = f(&mut draft)?;
        self.persist(&draft)?;
        *current = draft;
        Ok(out)
    }

    /// Read a workspace under its lock without copying it.
    pub fn read_workspace<R>(
        &self,
        workspace_id: &str,
        f: impl FnOnce(&Workspace) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(workspace_id);
        let mut guard = slot.lock();
        let ws = self.loaded(workspace_id, &mut guard)?;
        f(ws)
    }

    // ---------------- Workspaces ---------------- //

    pub fn create_workspace(&self, workspace_id: &str, dataset_name: &str) -> Result<()> {
        self.insert_new(Workspace::new_binary(workspace_id, dataset_name))
    }

    pub fn create_multiclass_workspace(
        &self,
        workspace_id: &str,
        dataset_name: &str,
        classes: Vec<String>,
    ) -> Result<()> {
        self.insert_new(Workspace::new_multiclass(workspace_id, dataset_name, classes))
    }

    fn insert_new(&self, ws: Workspace) -> Result<()> {
        let slot = self.slot(&ws.workspace_id);
        let mut guard = slot.lock();
        if guard.is_some() || self.storage.load(&ws.workspace_id)?.is_some() {
            return Err(StoreError::WorkspaceExists(ws.workspace_id));
        }
        self.persist(&ws)?;
        debug!(workspace_id = %ws.workspace_id, kind = ws.kind.name(), "created workspace");
        *guard = Some(ws);
        Ok(())
    }

    pub fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.read_workspace(workspace_id, |ws| Ok(ws.clone()))
    }

    pub fn workspace_exists(&self, workspace_id: &str) -> Result<bool> {
        match self.read_workspace(workspace_id, |_| Ok(())) {
            Ok(()) => Ok(true),
            Err(StoreError::WorkspaceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        let slot = self.slot(workspace_id);
        let mut guard = slot.lock();
        let existed = self.storage.delete(workspace_id)?;
        if !existed && guard.is_none() {
            return Err(StoreError::WorkspaceNotFound(workspace_id.to_string()));
        }
        *guard = None;
        drop(guard);
        self.slots.lock().remove(workspace_id);
        debug!(workspace_id, "deleted workspace");
        Ok(())
    }

    pub fn list_workspace_ids(&self) -> Result<Vec<String>> {
        Ok(self.storage.keys()?)
    }

    /// All loadable workspaces. Records that fail to load are logged and
    /// skipped.
    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut out = Vec::new();
        for id in self.list_workspace_ids()? {
            match self.get_workspace(&id) {
                Ok(ws) => out.push(ws),
                Err(e @ StoreError::WorkspaceLoad { .. }) => {
                    warn!(workspace_id = %id, error = %e, "skipping unreadable workspace");
                }
                Err(StoreError::WorkspaceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // ---------------- Categories ---------------- //

    pub fn add_category(&self, workspace_id: &str, name: &str, description: &str) -> Result<CategoryId> {
        self.update_workspace(workspace_id, |ws| ws.add_category(name, description))
    }

    pub fn edit_category(
        &self,
        workspace_id: &str,
        category_id: CategoryId,
        name: &str,
        description: &str,
    ) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            let taken = ws
                .categories()
                .iter()
                .any(|c| c.id != category_id && c.name == name);
            if taken {
                return Err(StoreError::CategoryNameTaken(name.to_string()));
            }
            let cat = ws.category_mut(category_id)?;
            cat.name = name.to_string();
            cat.description = description.to_string();
            Ok(())
        })
    }

    /// Tombstone a category. Its id is never handed out again.
    pub fn delete_category(&self, workspace_id: &str, category_id: CategoryId) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            ws.category_mut(category_id)?.deleted = true;
            Ok(())
        })
    }

    // ---------------- Iterations ---------------- //

    /// Append a PREPARING_DATA iteration and return its index.
    pub fn add_iteration(&self, workspace_id: &str, category_id: Option<CategoryId>) -> Result<usize> {
        self.update_workspace(workspace_id, |ws| {
            let track = ws.track_mut(category_id)?;
            track.iterations.push(Iteration::new());
            Ok(track.iterations.len() - 1)
        })
    }

    pub fn get_iteration(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        index: usize,
    ) -> Result<Iteration> {
        self.read_workspace(workspace_id, |ws| ws.track(category_id)?.iteration(index).cloned())
    }

    pub fn get_all_iterations(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
    ) -> Result<Vec<Iteration>> {
        self.read_workspace(workspace_id, |ws| Ok(ws.track(category_id)?.iterations.clone()))
    }

    pub fn get_all_iterations_by_status(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        status: IterationStatus,
    ) -> Result<Vec<(usize, Iteration)>> {
        self.read_workspace(workspace_id, |ws| {
            Ok(ws
                .track(category_id)?
                .iterations
                .iter()
                .enumerate()
                .filter(|(_, it)| it.status == status)
                .map(|(i, it)| (i, it.clone()))
                .collect())
        })
    }

    pub fn update_iteration_status(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        index: usize,
        status: IterationStatus,
    ) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            let it = ws.track_mut(category_id)?.iteration_mut(index)?;
            if it.status != status && !it.status.can_transition_to(status) {
                return Err(StoreError::IllegalTransition { from: it.status, to: status });
            }
            it.status = status;
            Ok(())
        })
    }

    /// Merge `stats` into the iteration's statistics, last writer wins per key.
    pub fn add_iteration_statistics(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        index: usize,
        stats: Statistics,
    ) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            let it = ws.track_mut(category_id)?.iteration_mut(index)?;
            it.iteration_statistics.extend(stats);
            Ok(())
        })
    }

    pub fn update_category_recommendations(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        index: usize,
        uris: Vec<String>,
    ) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            ws.track_mut(category_id)?.iteration_mut(index)?.recommended_uris = uris;
            Ok(())
        })
    }

    // ---------------- Models ---------------- //

    /// Attach a model to an iteration. A model can be set only once.
    pub fn add_model(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        index: usize,
        model: ModelInfo,
    ) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            let it = ws.track_mut(category_id)?.iteration_mut(index)?;
            if let Some(existing) = &it.model {
                return Err(StoreError::ModelAlreadySet {
                    index,
                    existing: existing.model_id.clone(),
                });
            }
            it.model = Some(model);
            Ok(())
        })
    }

    pub fn update_model_status(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        index: usize,
        status: ModelStatus,
    ) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            let it = ws.track_mut(category_id)?.iteration_mut(index)?;
            let model = it.model.as_mut().ok_or(StoreError::NoModel(index))?;
            model.model_status = status;
            Ok(())
        })
    }

    // ---------------- Retrain counter ---------------- //

    /// Add `by` to the change counter and return the new value.
    pub fn increase_label_change_count_since_last_train(
        &self,
        workspace_id: &str,
        category_id: Option<CategoryId>,
        by: u64,
    ) -> Result<u64> {
        self.update_workspace(workspace_id, |ws| {
            let track = ws.track_mut(category_id)?;
            track.label_change_count_since_last_train += by;
            Ok(track.label_change_count_since_last_train)
        })
    }

    pub fn reset_label_change_count(&self, workspace_id: &str, category_id: Option<CategoryId>) -> Result<()> {
        self.update_workspace(workspace_id, |ws| {
            ws.track_mut(category_id)?.label_change_count_since_last_train = 0;
            Ok(())
        })
    }

    pub fn get_label_change_count(&self, workspace_id: &str, category_id: Option<CategoryId>) -> Result<u64> {
        self.read_workspace(workspace_id, |ws| {
            Ok(ws.track(category_id)?.label_change_count_since_last_train)
        })
    }
}
