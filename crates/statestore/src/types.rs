//! Workspace data model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

pub type CategoryId = u32;

/// Free-form statistics attached to iterations and models.
pub type Statistics = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationStatus {
    PreparingData,
    Training,
    RunningInference,
    RunningActiveLearning,
    CalculatingStatistics,
    Ready,
    Error,
    InsufficientTrainData,
    ModelDeleted,
}

impl IterationStatus {
    /// Terminal statuses never change again, except READY which may
    /// become MODEL_DELETED when retention prunes its model.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IterationStatus::Ready
                | IterationStatus::Error
                | IterationStatus::InsufficientTrainData
                | IterationStatus::ModelDeleted
        )
    }

    /// Position in the active pipeline, `None` for off-pipeline terminals.
    pub fn pipeline_stage(self) -> Option<u8> {
        match self {
            IterationStatus::PreparingData => Some(0),
            IterationStatus::Training => Some(1),
            IterationStatus::RunningInference => Some(2),
            IterationStatus::RunningActiveLearning => Some(3),
            IterationStatus::CalculatingStatistics => Some(4),
            IterationStatus::Ready => Some(5),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: IterationStatus) -> bool {
        match (self, next) {
            (IterationStatus::Ready, IterationStatus::ModelDeleted) => true,
            (from, _) if from.is_terminal() => false,
            (_, IterationStatus::Error) => true,
            (IterationStatus::PreparingData, IterationStatus::InsufficientTrainData) => true,
            (from, to) => match (from.pipeline_stage(), to.pipeline_stage()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Training,
    Ready,
    Error,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_status: ModelStatus,
    pub creation_date: DateTime<Utc>,
    pub model_type: String,
    #[serde(default)]
    pub train_statistics: Statistics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Iteration {
    pub status: IterationStatus,
    #[serde(default)]
    pub model: Option<ModelInfo>,
    #[serde(default)]
    pub iteration_statistics: Statistics,
    #[serde(default)]
    pub recommended_uris: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Iteration {
    pub fn new() -> Self {
        Self {
            status: IterationStatus::PreparingData,
            model: None,
            iteration_statistics: Statistics::new(),
            recommended_uris: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

impl Default for Iteration {
    fn default() -> Self {
        Self::new()
    }
}

/// The append-only iteration list plus its retrain counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IterationTrack {
    #[serde(default)]
    pub iterations: Vec<Iteration>,
    #[serde(default)]
    pub label_change_count_since_last_train: u64,
}

impl IterationTrack {
    pub fn iteration(&self, index: usize) -> Result<&Iteration> {
        self.iterations
            .get(index)
            .ok_or(StoreError::IterationNotFound { index, count: self.iterations.len() })
    }

    pub fn iteration_mut(&mut self, index: usize) -> Result<&mut Iteration> {
        let count = self.iterations.len();
        self.iterations
            .get_mut(index)
            .ok_or(StoreError::IterationNotFound { index, count })
    }

    /// Most recent READY iteration strictly before `before`.
    pub fn latest_ready_before(&self, before: usize) -> Option<(usize, &Iteration)> {
        self.iterations
            .iter()
            .enumerate()
            .take(before)
            .rev()
            .find(|(_, it)| it.status == IterationStatus::Ready)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub track: IterationTrack,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkspaceKind {
    Binary {
        #[serde(default, with = "category_list")]
        categories: BTreeMap<CategoryId, Category>,
        #[serde(default)]
        next_category_id: CategoryId,
    },
    Multiclass {
        classes: Vec<String>,
        #[serde(default)]
        track: IterationTrack,
    },
}

// Persisted as a list: integer map keys do not survive the tagged enum.
mod category_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Category, CategoryId};

    pub fn serialize<S: Serializer>(map: &BTreeMap<CategoryId, Category>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(map.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<CategoryId, Category>, D::Error> {
        let list = Vec::<Category>::deserialize(d)?;
        Ok(list.into_iter().map(|c| (c.id, c)).collect())
    }
}

impl WorkspaceKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkspaceKind::Binary { .. } => "binary",
            WorkspaceKind::Multiclass { .. } => "multiclass",
        }
    }

    fn track(&self, category_id: Option<CategoryId>) -> Result<&IterationTrack> {
        match (self, category_id) {
            (WorkspaceKind::Binary { categories, .. }, Some(id)) => {
                live_category(categories, id).map(|c| &c.track)
            }
            (WorkspaceKind::Multiclass { track, .. }, None) => Ok(track),
            _ => Err(self.kind_mismatch(category_id)),
        }
    }

    fn track_mut(&mut self, category_id: Option<CategoryId>) -> Result<&mut IterationTrack> {
        let mismatch = self.kind_mismatch(category_id);
        match (self, category_id) {
            (WorkspaceKind::Binary { categories, .. }, Some(id)) => match categories.get_mut(&id) {
                Some(c) if !c.deleted => Ok(&mut c.track),
                Some(_) => Err(StoreError::CategoryDeleted(id)),
                None => Err(StoreError::CategoryNotFound(id)),
            },
            (WorkspaceKind::Multiclass { track, .. }, None) => Ok(track),
            _ => Err(mismatch),
        }
    }

    fn kind_mismatch(&self, category_id: Option<CategoryId>) -> StoreError {
        StoreError::WrongWorkspaceKind {
            kind: self.name(),
            category_id,
        }
    }
}

fn live_category(categories: &BTreeMap<CategoryId, Category>, id: CategoryId) -> Result<&Category> {
    match categories.get(&id) {
        Some(c) if !c.deleted => Ok(c),
        Some(_) => Err(StoreError::CategoryDeleted(id)),
        None => Err(StoreError::CategoryNotFound(id)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub workspace_id: String,
    pub dataset_name: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub kind: WorkspaceKind,
}

impl Workspace {
    pub fn new_binary(workspace_id: &str, dataset_name: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            dataset_name: dataset_name.to_string(),
            created_at: Utc::now(),
            kind: WorkspaceKind::Binary {
                categories: BTreeMap::new(),
                next_category_id: 0,
            },
        }
    }

    pub fn new_multiclass(workspace_id: &str, dataset_name: &str, classes: Vec<String>) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            dataset_name: dataset_name.to_string(),
            created_at: Utc::now(),
            kind: WorkspaceKind::Multiclass {
                classes,
                track: IterationTrack::default(),
            },
        }
    }

    pub fn track(&self, category_id: Option<CategoryId>) -> Result<&IterationTrack> {
        self.kind.track(category_id)
    }

    pub fn track_mut(&mut self, category_id: Option<CategoryId>) -> Result<&mut IterationTrack> {
        self.kind.track_mut(category_id)
    }

    /// Live (non-deleted) categories of a binary workspace.
    pub fn categories(&self) -> Vec<&Category> {
        match &self.kind {
            WorkspaceKind::Binary { categories, .. } => {
                categories.values().filter(|c| !c.deleted).collect()
            }
            WorkspaceKind::Multiclass { .. } => Vec::new(),
        }
    }

    pub fn category(&self, id: CategoryId) -> Result<&Category> {
        match &self.kind {
            WorkspaceKind::Binary { categories, .. } => live_category(categories, id),
            WorkspaceKind::Multiclass { .. } => Err(self.kind.kind_mismatch(Some(id))),
        }
    }

    pub(crate) fn add_category(&mut self, name: &str, description: &str) -> Result<CategoryId> {
        let kind_name = self.kind.name();
        match &mut self.kind {
            WorkspaceKind::Binary { categories, next_category_id } => {
                if categories.values().any(|c| !c.deleted && c.name == name) {
                    return Err(StoreError::CategoryNameTaken(name.to_string()));
                }
                let id = *next_category_id;
                *next_category_id += 1;
                categories.insert(
                    id,
                    Category {
                        id,
                        name: name.to_string(),
                        description: description.to_string(),
                        deleted: false,
                        track: IterationTrack::default(),
                    },
                );
                Ok(id)
            }
            WorkspaceKind::Multiclass { .. } => Err(StoreError::WrongWorkspaceKind {
                kind: kind_name,
                category_id: None,
            }),
        }
    }

    pub(crate) fn category_mut(&mut self, id: CategoryId) -> Result<&mut Category> {
        let kind_name = self.kind.name();
        match &mut self.kind {
            WorkspaceKind::Binary { categories, .. } => match categories.get_mut(&id) {
                Some(c) if !c.deleted => Ok(c),
                Some(_) => Err(StoreError::CategoryDeleted(id)),
                None => Err(StoreError::CategoryNotFound(id)),
            },
            WorkspaceKind::Multiclass { .. } => Err(StoreError::WrongWorkspaceKind {
                kind: kind_name,
                category_id: Some(id),
            }),
        }
    }
}
