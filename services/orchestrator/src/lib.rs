pub mod active_learning;
pub mod config;
pub mod data_access;
pub mod error;
pub mod labeling;
pub mod pipeline;
pub mod recovery;
pub mod retrain_policy;
pub mod train_set;
pub mod train_validator;

pub use active_learning::{ActiveLearner, ActiveLearningPolicy, Strategy};
pub use config::AppConfig;
pub use data_access::{DataAccess, DataError, Element, FileDataAccess, Label, LabelCounts, LabelType};
pub use error::{OrchestratorError, Result};
pub use pipeline::Orchestrator;
pub use recovery::{recover_interrupted_iterations, RecoveryReport};
pub use retrain_policy::{RetrainDecision, RetrainThresholds};
pub use train_set::{DefaultTrainSetSelector, TrainSetSelector};
pub use train_validator::{validate_train_set, TrainCounts};
