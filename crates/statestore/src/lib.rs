//! Persistent workspace state store
//!
//! One serialized record per workspace, guarded by a per-workspace lock and
//! cached in memory after the first load.

mod storage;
mod store;
mod types;

pub use storage::{write_atomic, FileBackedStorage, InMemoryStorage, Storage};
pub use store::WorkspaceStore;
pub use types::{
    Category, CategoryId, Iteration, IterationStatus, IterationTrack, ModelInfo, ModelStatus,
    Statistics, Workspace, WorkspaceKind,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workspace '{0}' not found")]
    WorkspaceNotFound(String),

    #[error("workspace '{0}' already exists")]
    WorkspaceExists(String),

    #[error("failed to load workspace '{workspace_id}': {reason}")]
    WorkspaceLoad { workspace_id: String, reason: String },

    #[error("category {0} not found")]
    CategoryNotFound(CategoryId),

    #[error("category {0} was deleted")]
    CategoryDeleted(CategoryId),

    #[error("category name '{0}' is already in use")]
    CategoryNameTaken(String),

    #[error("{kind} workspace cannot address category {category_id:?}")]
    WrongWorkspaceKind {
        kind: &'static str,
        category_id: Option<CategoryId>,
    },

    #[error("iteration {index} not found ({count} iterations)")]
    IterationNotFound { index: usize, count: usize },

    #[error("iteration {index} already has model '{existing}'")]
    ModelAlreadySet { index: usize, existing: String },

    #[error("iteration {0} has no model")]
    NoModel(usize),

    #[error("illegal iteration status transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: IterationStatus,
        to: IterationStatus,
    },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
