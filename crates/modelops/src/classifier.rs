use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use jobs::JobHandle;
use statestore::ModelStatus;

use crate::{InferItem, ModelOpsError, ModelType, Prediction, Result, TrainElement, TrainParams};

/// What `train` hands back right away. Fitting continues in `job`.
pub struct TrainSubmission {
    pub model_id: String,
    pub status: ModelStatus,
    pub job: JobHandle<()>,
}

pub type InferCallback = Box<dyn FnOnce(&JobHandle<Vec<Prediction>>) + Send + 'static>;

pub trait Classifier: Send + Sync {
    fn model_type(&self) -> &ModelType;

    fn train(
        &self,
        train_data: Vec<TrainElement>,
        language: &str,
        params: &TrainParams,
    ) -> anyhow::Result<TrainSubmission>;

    fn get_model_status(&self, model_id: &str) -> anyhow::Result<ModelStatus>;

    fn infer_by_id(&self, model_id: &str, items: &[InferItem], use_cache: bool) -> anyhow::Result<Vec<Prediction>>;

    fn infer_by_id_async(
        &self,
        model_id: &str,
        items: Vec<InferItem>,
        done: InferCallback,
    ) -> JobHandle<Vec<Prediction>>;

    fn delete_model(&self, model_id: &str) -> anyhow::Result<()>;

    fn copy_model_dir_for_export(&self, model_id: &str) -> anyhow::Result<PathBuf>;
}

/// Registry of classifiers by model type.
#[derive(Clone, Default)]
pub struct ModelFactory {
    classifiers: BTreeMap<ModelType, Arc<dyn Classifier>>,
}

impl ModelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, classifier: Arc<dyn Classifier>) {
        self.classifiers.insert(classifier.model_type().clone(), classifier);
    }

    pub fn with(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.register(classifier);
        self
    }

    pub fn get(&self, model_type: &ModelType) -> Result<Arc<dyn Classifier>> {
        self.classifiers
            .get(model_type)
            .cloned()
            .ok_or_else(|| ModelOpsError::UnknownModelType(model_type.to_string()))
    }

    pub fn model_types(&self) -> Vec<ModelType> {
        self.classifiers.keys().cloned().collect()
    }
}
