pub mod cache;
pub mod classifier;
pub mod fingerprint;
pub mod model_api;
pub mod retention;
pub mod schema;

pub use cache::InferenceCache;
pub use classifier::{Classifier, InferCallback, ModelFactory, TrainSubmission};
pub use fingerprint::item_fingerprint;
pub use model_api::{Estimator, ModelApi};
pub use retention::{delete_iteration_model, iterations_to_prune, prune_models};
pub use schema::*;

use statestore::{ModelStatus, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelOpsError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown model type '{0}'")]
    UnknownModelType(String),

    #[error("model '{model_id}' is not active (status {status:?})")]
    ModelNotActive { model_id: String, status: ModelStatus },

    #[error("classifier error: {0}")]
    Classifier(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ModelOpsError>;
