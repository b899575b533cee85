use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use jobs::{JobHandle, JobScheduler, ResourceKind};
use serde::{Deserialize, Serialize};
use statestore::ModelStatus;
use tracing::info;
use uuid::Uuid;

use crate::{
    Classifier, InferCallback, InferItem, InferenceCache, ModelType, Prediction, TrainElement,
    TrainParams, TrainSubmission,
};

const STATUS_FILE: &str = "status.json";

/// The fitting/prediction core of a classifier. Runs synchronously; the
/// scheduling, model directories and caching come from [`ModelApi`].
pub trait Estimator: Send + Sync + 'static {
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn fit(
        &self,
        model_dir: &Path,
        train_data: &[TrainElement],
        language: &str,
        params: &TrainParams,
    ) -> anyhow::Result<()>;

    fn predict(&self, model_dir: &Path, items: &[InferItem]) -> anyhow::Result<Vec<Prediction>>;
}

#[derive(Serialize, Deserialize)]
struct StatusRecord {
    status: ModelStatus,
}

struct ModelApiInner<E> {
    model_type: ModelType,
    estimator: E,
    models_dir: PathBuf,
    exports_dir: PathBuf,
    scheduler: JobScheduler,
    cache: Arc<InferenceCache>,
}

/// A [`Classifier`] that keeps each model in `<models_dir>/<model_id>/`
/// with a status file next to the estimator's artifacts.
pub struct ModelApi<E> {
    inner: Arc<ModelApiInner<E>>,
}

impl<E> Clone for ModelApi<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E: Estimator> ModelApi<E> {
    pub fn new(
        model_type: ModelType,
        estimator: E,
        data_dir: &Path,
        scheduler: JobScheduler,
        cache: Arc<InferenceCache>,
    ) -> Self {
        Self {
            inner: Arc::new(ModelApiInner {
                model_type,
                estimator,
                models_dir: data_dir.join("models"),
                exports_dir: data_dir.join("exports"),
                scheduler,
                cache,
            }),
        }
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        self.inner.models_dir.join(model_id)
    }

    fn predict(&self, model_id: &str, items: &[InferItem]) -> anyhow::Result<Vec<Prediction>> {
        let preds = self.inner.estimator.predict(&self.model_dir(model_id), items)?;
        if preds.len() != items.len() {
            bail!("model {model_id} returned {} predictions for {} items", preds.len(), items.len());
        }
        Ok(preds)
    }
}

fn write_status(model_dir: &Path, status: ModelStatus) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(&StatusRecord { status })?;
    statestore::write_atomic(&model_dir.join(STATUS_FILE), &bytes)
        .with_context(|| format!("writing status for {}", model_dir.display()))
}

impl<E: Estimator> Classifier for ModelApi<E> {
    fn model_type(&self) -> &ModelType {
        &self.inner.model_type
    }

    fn train(
        &self,
        train_data: Vec<TrainElement>,
        language: &str,
        params: &TrainParams,
    ) -> anyhow::Result<TrainSubmission> {
        let model_id = format!("{}_{}", self.inner.model_type, Uuid::new_v4().simple());
        let dir = self.model_dir(&model_id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        write_status(&dir, ModelStatus::Training)?;

        let train_size = train_data.len();
        let inner = self.inner.clone();
        let language = language.to_string();
        let params = params.clone();
        let job_model_id = model_id.clone();
        let job = self.inner.scheduler.submit(self.inner.estimator.resource_kind(), move || {
            let fitted = inner.estimator.fit(&dir, &train_data, &language, &params);
            let status = if fitted.is_ok() { ModelStatus::Ready } else { ModelStatus::Error };
            write_status(&dir, status)?;
            fitted.with_context(|| format!("training model {job_model_id}"))
        });

        info!(model_id = %model_id, model_type = %self.inner.model_type, train_size, "training submitted");
        Ok(TrainSubmission {
            model_id,
            status: ModelStatus::Training,
            job,
        })
    }

    /// A model whose directory is gone reports DELETED.
    fn get_model_status(&self, model_id: &str) -> anyhow::Result<ModelStatus> {
        let path = self.model_dir(model_id).join(STATUS_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice::<StatusRecord>(&bytes)?.status),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ModelStatus::Deleted),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn infer_by_id(&self, model_id: &str, items: &[InferItem], use_cache: bool) -> anyhow::Result<Vec<Prediction>> {
        let status = self.get_model_status(model_id)?;
        if status != ModelStatus::Ready {
            bail!("model {model_id} is not ready for inference ({status:?})");
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if use_cache {
            self.inner
                .cache
                .get_or_compute(model_id, items, |missing| self.predict(model_id, missing))
        } else {
            self.predict(model_id, items)
        }
    }

    fn infer_by_id_async(
        &self,
        model_id: &str,
        items: Vec<InferItem>,
        done: InferCallback,
    ) -> JobHandle<Vec<Prediction>> {
        let this = self.clone();
        let model_id = model_id.to_string();
        self.inner.scheduler.submit_with_callback(
            self.inner.estimator.resource_kind(),
            move || this.infer_by_id(&model_id, &items, true),
            move |h| done(h),
        )
    }

    fn delete_model(&self, model_id: &str) -> anyhow::Result<()> {
        let dir = self.model_dir(model_id);
        if !dir.exists() {
            bail!("model {model_id} does not exist");
        }
        fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        self.inner.cache.forget_model(model_id)?;
        info!(model_id, "model deleted");
        Ok(())
    }

    fn copy_model_dir_for_export(&self, model_id: &str) -> anyhow::Result<PathBuf> {
        let src = self.model_dir(model_id);
        if !src.exists() {
            bail!("model {model_id} does not exist");
        }
        let dest = self.inner.exports_dir.join(model_id);
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        copy_dir(&src, &dest)?;
        Ok(dest)
    }
}

fn copy_dir(src: &Path, dest: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
