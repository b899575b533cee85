use jobs::JobError;
use modelops::ModelOpsError;
use statestore::StoreError;
use thiserror::Error;

use crate::data_access::DataError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    ModelOps(#[from] ModelOpsError),

    #[error("classifier error: {0:#}")]
    Model(anyhow::Error),

    #[error("background job failed: {0}")]
    Job(#[from] JobError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
