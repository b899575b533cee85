use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use jobs::{JobHandle, JobScheduler, ResourceKind};
use modelops::{
    Estimator, InferItem, ModelApi, ModelFactory, ModelOpsError, ModelType, Prediction, TrainElement, TrainParams,
};
use orchestrator::{
    AppConfig, DataAccess, DataError, DefaultTrainSetSelector, Element, FileDataAccess, Label, LabelCounts,
    Orchestrator, OrchestratorError, TrainSetSelector,
};
use parking_lot::Mutex;
use serde_json::json;
use statestore::{CategoryId, Iteration, IterationStatus, ModelStatus, StoreError, WorkspaceStore};
use tempfile::TempDir;

struct Controls {
    fail_fit: AtomicBool,
    fail_predict: AtomicBool,
    fit_delay_ms: AtomicU64,
    /// Word the next fitted model calls positive.
    keyword: Mutex<String>,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            fail_fit: AtomicBool::new(false),
            fail_predict: AtomicBool::new(false),
            fit_delay_ms: AtomicU64::new(0),
            keyword: Mutex::new("great".to_string()),
        }
    }
}

/// Calls anything containing its keyword positive. The keyword is fixed
/// when the model is fitted, so each model keeps its own.
struct KeywordEstimator {
    ctl: Arc<Controls>,
}

impl Estimator for KeywordEstimator {
    fn fit(&self, dir: &Path, data: &[TrainElement], _language: &str, _params: &TrainParams) -> anyhow::Result<()> {
        let delay = self.ctl.fit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.ctl.fail_fit.load(Ordering::SeqCst) {
            anyhow::bail!("fit blew up");
        }
        std::fs::write(dir.join("model.txt"), format!("{} examples", data.len()))?;
        std::fs::write(dir.join("keyword.txt"), self.ctl.keyword.lock().as_str())?;
        Ok(())
    }

    fn predict(&self, dir: &Path, items: &[InferItem]) -> anyhow::Result<Vec<Prediction>> {
        if self.ctl.fail_predict.load(Ordering::SeqCst) {
            anyhow::bail!("predict blew up");
        }
        let keyword = std::fs::read_to_string(dir.join("keyword.txt"))?;
        Ok(items
            .iter()
            .map(|it| {
                let hit = it["text"].contains(keyword.as_str());
                Prediction {
                    label: hit,
                    score: if hit { 0.9 } else { 0.3 },
                }
            })
            .collect())
    }
}

/// Train-set collection that always fails.
struct BrokenSelector;

impl TrainSetSelector for BrokenSelector {
    fn collect_train_set(&self, _: &str, _: &str, _: CategoryId) -> JobHandle<Vec<TrainElement>> {
        JobHandle::completed(ResourceKind::Cpu, Err(anyhow::anyhow!("label index offline")))
    }
}

/// Labels work, but listing unlabeled elements fails.
struct NoUnlabeledListing {
    inner: Arc<dyn DataAccess>,
}

impl DataAccess for NoUnlabeledListing {
    fn add_elements(&self, dataset: &str, elements: Vec<Element>) -> Result<usize, DataError> {
        self.inner.add_elements(dataset, elements)
    }

    fn get_all_elements(&self, dataset: &str) -> Result<Vec<Element>, DataError> {
        self.inner.get_all_elements(dataset)
    }

    fn get_elements_by_uris(&self, dataset: &str, uris: &[String]) -> Result<Vec<Element>, DataError> {
        self.inner.get_elements_by_uris(dataset, uris)
    }

    fn set_labels(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        labels: &[(String, Label)],
    ) -> Result<usize, DataError> {
        self.inner.set_labels(workspace_id, dataset, category_id, labels)
    }

    fn unset_labels(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        uris: &[String],
    ) -> Result<usize, DataError> {
        self.inner.unset_labels(workspace_id, dataset, category_id, uris)
    }

    fn get_labeled_elements(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
    ) -> Result<Vec<(Element, Label)>, DataError> {
        self.inner.get_labeled_elements(workspace_id, dataset, category_id)
    }

    fn get_unlabeled_elements(&self, _: &str, _: &str, _: CategoryId, _: bool) -> Result<Vec<Element>, DataError> {
        Err(DataError::Io(io::Error::new(io::ErrorKind::Other, "label index offline")))
    }

    fn get_label_counts(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        dedup: bool,
    ) -> Result<LabelCounts, DataError> {
        self.inner.get_label_counts(workspace_id, dataset, category_id, dedup)
    }

    fn delete_all_labels(&self, workspace_id: &str, dataset: &str) -> Result<(), DataError> {
        self.inner.delete_all_labels(workspace_id, dataset)
    }

    fn delete_labels_for_category(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
    ) -> Result<(), DataError> {
        self.inner.delete_labels_for_category(workspace_id, dataset, category_id)
    }
}

struct Harness {
    _dir: TempDir,
    orch: Arc<Orchestrator>,
    ctl: Arc<Controls>,
    cat: CategoryId,
}

/// The collaborators the orchestrator is built from; tests may swap them.
struct Parts {
    data: Arc<dyn DataAccess>,
    selector: Arc<dyn TrainSetSelector>,
}

fn harness(tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    harness_with(tweak, |parts| parts)
}

fn harness_with(tweak: impl FnOnce(&mut AppConfig), swap: impl FnOnce(Parts) -> Parts) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AppConfig {
        data_dir: dir.path().to_path_buf(),
        first_model_positive_threshold: 1,
        first_model_negative_threshold: 0,
        changed_element_threshold: 1,
        model_type: "keyword".to_string(),
        ..AppConfig::default()
    };
    tweak(&mut cfg);

    let scheduler = JobScheduler::new(cfg.scheduler()).unwrap();
    let ctl = Arc::new(Controls::default());
    let api = ModelApi::new(
        ModelType::new("keyword"),
        KeywordEstimator { ctl: ctl.clone() },
        &cfg.data_dir,
        scheduler.clone(),
        Arc::new(cfg.inference_cache()),
    );
    let factory = ModelFactory::new().with(Arc::new(api));

    let store = Arc::new(WorkspaceStore::open(cfg.workspaces_dir()).unwrap());
    let data: Arc<dyn DataAccess> = Arc::new(FileDataAccess::new(
        cfg.datasets_dir(),
        cfg.labels_dir(),
        cfg.apply_labels_to_duplicate_texts,
    ));
    let selector = Arc::new(DefaultTrainSetSelector::new(data.clone(), scheduler, cfg.weak_negative_ratio));
    let parts = swap(Parts { data, selector });
    let orch = Orchestrator::new(cfg, store, parts.data, factory, parts.selector);

    orch.data()
        .add_elements(
            "ds",
            vec![
                Element::new("u1", "great match today"),
                Element::new("u2", "rainy today"),
                Element::new("u3", "cold rainy night"),
            ],
        )
        .unwrap();
    orch.create_workspace("ws", "ds").unwrap();
    let cat = orch.create_category("ws", "sports", "about sports").unwrap();

    Harness {
        _dir: dir,
        orch,
        ctl,
        cat,
    }
}

fn label(uri: &str, value: bool) -> (String, Label) {
    let l = if value { Label::positive() } else { Label::negative() };
    (uri.to_string(), l)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn settled(h: &Harness, index: usize) -> Iteration {
    let store = h.orch.store();
    wait_until("iteration to settle", || {
        store
            .get_iteration("ws", Some(h.cat), index)
            .map(|it| it.status.is_terminal())
            .unwrap_or(false)
    })
    .await;
    store.get_iteration("ws", Some(h.cat), index).unwrap()
}

fn stat(it: &Iteration, key: &str) -> f64 {
    it.iteration_statistics[key].as_f64().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_label_train_and_retrain() {
    let h = harness(|_| {});

    assert_eq!(h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap(), 1);
    let first = h.orch.train_if_recommended("ws", h.cat, false).unwrap();
    assert_eq!(first, Some(0));
    assert_eq!(h.orch.store().get_label_change_count("ws", Some(h.cat)).unwrap(), 0);

    let it = settled(&h, 0).await;
    assert_eq!(it.status, IterationStatus::Ready);
    assert!((stat(&it, "positive_fraction") - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(stat(&it, "changed_fraction"), 0.0);
    let model = it.model.clone().unwrap();
    assert_eq!(model.model_status, ModelStatus::Ready);
    assert_eq!(model.train_statistics["train_positive"], json!(1));
    assert_eq!(model.train_statistics["train_weak_negative"], json!(1));
    assert_eq!(it.recommended_uris.len(), 2);
    assert_eq!(it.iteration_statistics["recommended_count"], json!(2));

    assert_eq!(h.orch.set_labels("ws", h.cat, &[label("u2", false)]).unwrap(), 1);
    assert_eq!(h.orch.store().get_label_change_count("ws", Some(h.cat)).unwrap(), 1);
    // the next model calls u3 positive instead of u1
    *h.ctl.keyword.lock() = "night".to_string();
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, false).unwrap(), Some(1));

    let it = settled(&h, 1).await;
    assert_eq!(it.status, IterationStatus::Ready);
    assert_eq!(it.iteration_statistics["compared_to_iteration"], json!(0));
    assert!((stat(&it, "positive_fraction") - 1.0 / 3.0).abs() < 1e-9);
    assert!((stat(&it, "changed_fraction") - 2.0 / 3.0).abs() < 1e-9);

    // u2 is labeled now, so only u3 is still worth showing
    let recs = h.orch.get_recommendations("ws", h.cat).unwrap();
    let uris: Vec<_> = recs.iter().map(|e| e.uri.as_str()).collect();
    assert_eq!(uris, vec!["u3"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unmet_thresholds_never_create_iterations() {
    let h = harness(|cfg| cfg.first_model_positive_threshold = 2);

    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    for _ in 0..3 {
        assert_eq!(h.orch.train_if_recommended("ws", h.cat, false).unwrap(), None);
    }
    assert!(h.orch.store().get_all_iterations("ws", Some(h.cat)).unwrap().is_empty());

    // relabeling with the same value is not a change
    assert_eq!(h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap(), 0);

    h.orch.set_labels("ws", h.cat, &[label("u2", true)]).unwrap();
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, false).unwrap(), Some(0));
    // counter was reset, so the second call is a no-op
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, false).unwrap(), None);
    settled(&h, 0).await;
    assert_eq!(h.orch.store().get_all_iterations("ws", Some(h.cat)).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_in_flight_iteration_blocks_forced_retrain() {
    let h = harness(|_| {});
    h.ctl.fit_delay_ms.store(300, Ordering::SeqCst);

    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, false).unwrap(), Some(0));
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, true).unwrap(), None);

    settled(&h, 0).await;
    h.ctl.fit_delay_ms.store(0, Ordering::SeqCst);
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, true).unwrap(), Some(1));
    settled(&h, 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_training_failure_marks_error_and_keeps_counter_reset() {
    let h = harness(|_| {});
    h.ctl.fail_fit.store(true, Ordering::SeqCst);

    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, false).unwrap(), Some(0));

    let it = settled(&h, 0).await;
    assert_eq!(it.status, IterationStatus::Error);
    assert_eq!(it.model.unwrap().model_status, ModelStatus::Error);
    assert_eq!(it.iteration_statistics["error_stage"], json!("training"));
    assert!(it.iteration_statistics["error"].as_str().unwrap().contains("fit blew up"));
    assert_eq!(h.orch.store().get_label_change_count("ws", Some(h.cat)).unwrap(), 0);

    // an ERROR iteration does not block the next one
    h.ctl.fail_fit.store(false, Ordering::SeqCst);
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, true).unwrap(), Some(1));
    assert_eq!(settled(&h, 1).await.status, IterationStatus::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inference_failure_marks_error() {
    let h = harness(|_| {});
    h.ctl.fail_predict.store(true, Ordering::SeqCst);

    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    h.orch.train_if_recommended("ws", h.cat, false).unwrap();

    let it = settled(&h, 0).await;
    assert_eq!(it.status, IterationStatus::Error);
    assert_eq!(it.iteration_statistics["error_stage"], json!("post_inference"));
    // the model itself trained fine
    assert_eq!(it.model.unwrap().model_status, ModelStatus::Ready);
    assert!(it.recommended_uris.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_class_is_insufficient_train_data() {
    let h = harness(|cfg| cfg.weak_negative_ratio = 0.0);

    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    h.orch.train_if_recommended("ws", h.cat, false).unwrap();

    let it = settled(&h, 0).await;
    assert_eq!(it.status, IterationStatus::InsufficientTrainData);
    assert!(it.model.is_none());
    assert_eq!(it.iteration_statistics["train_positive"], json!(1));
    assert_eq!(it.iteration_statistics["train_negative"], json!(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_model_type_fails_the_iteration() {
    let h = harness(|_| {});
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();

    let err = h.orch.run_iteration("ws", h.cat, &ModelType::new("nope")).unwrap_err();
    assert!(matches!(err, OrchestratorError::ModelOps(ModelOpsError::UnknownModelType(_))));

    let its = h.orch.store().get_all_iterations("ws", Some(h.cat)).unwrap();
    assert_eq!(its.len(), 1);
    assert_eq!(its[0].status, IterationStatus::Error);
    assert_eq!(its[0].iteration_statistics["error_stage"], json!("launch"));
    assert!(its[0].model.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_launch_leaves_error_iteration_and_resets_counter() {
    let h = harness(|cfg| cfg.model_type = "missing".to_string());
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();

    let err = h.orch.train_if_recommended("ws", h.cat, false).unwrap_err();
    assert!(matches!(err, OrchestratorError::ModelOps(ModelOpsError::UnknownModelType(_))));
    assert_eq!(h.orch.store().get_label_change_count("ws", Some(h.cat)).unwrap(), 0);

    let its = h.orch.store().get_all_iterations("ws", Some(h.cat)).unwrap();
    assert_eq!(its.len(), 1);
    assert_eq!(its[0].status, IterationStatus::Error);
    assert_eq!(its[0].iteration_statistics["error_stage"], json!("launch"));
    assert!(its[0].iteration_statistics["error"].as_str().unwrap().contains("missing"));

    // a failed launch is history, not an iteration in flight
    assert!(h.orch.train_if_recommended("ws", h.cat, true).is_err());
    let its = h.orch.store().get_all_iterations("ws", Some(h.cat)).unwrap();
    assert_eq!(its.len(), 2);
    assert!(its.iter().all(|it| it.status == IterationStatus::Error));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_retrain_requests_launch_once() {
    let h = harness(|_| {});
    h.ctl.fit_delay_ms.store(300, Ordering::SeqCst);
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let orch = h.orch.clone();
            let barrier = barrier.clone();
            let cat = h.cat;
            std::thread::spawn(move || {
                barrier.wait();
                orch.train_if_recommended("ws", cat, true).unwrap()
            })
        })
        .collect();
    let launched: Vec<Option<usize>> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(launched.iter().flatten().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(h.orch.store().get_all_iterations("ws", Some(h.cat)).unwrap().len(), 1);
    assert_eq!(settled(&h, 0).await.status, IterationStatus::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_train_set_failure_marks_error_without_model() {
    let h = harness_with(
        |_| {},
        |parts| Parts {
            selector: Arc::new(BrokenSelector),
            ..parts
        },
    );
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    assert_eq!(h.orch.train_if_recommended("ws", h.cat, false).unwrap(), Some(0));

    let it = settled(&h, 0).await;
    assert_eq!(it.status, IterationStatus::Error);
    assert_eq!(it.iteration_statistics["error_stage"], json!("prepare_data"));
    assert!(it.iteration_statistics["error"].as_str().unwrap().contains("label index offline"));
    assert!(it.model.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_active_learning_failure_marks_error_after_inference() {
    let h = harness_with(
        |_| {},
        |parts| Parts {
            data: Arc::new(NoUnlabeledListing { inner: parts.data }),
            selector: parts.selector,
        },
    );
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    h.orch.train_if_recommended("ws", h.cat, false).unwrap();

    let it = settled(&h, 0).await;
    assert_eq!(it.status, IterationStatus::Error);
    assert_eq!(it.iteration_statistics["error_stage"], json!("post_inference"));
    // inference and its statistics went through before recommending failed
    assert_eq!(it.model.as_ref().unwrap().model_status, ModelStatus::Ready);
    assert!((stat(&it, "positive_fraction") - 1.0 / 3.0).abs() < 1e-9);
    assert!(!it.iteration_statistics.contains_key("recommended_count"));
    assert!(it.recommended_uris.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retention_keeps_two_most_recent_models() {
    let h = harness(|cfg| cfg.max_models_per_category = 2);
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();

    let model_type = ModelType::new("keyword");
    for expected in 0..4 {
        let index = h.orch.run_iteration("ws", h.cat, &model_type).unwrap();
        assert_eq!(index, expected);
        assert_eq!(settled(&h, index).await.status, IterationStatus::Ready);
    }

    let store = h.orch.store();
    wait_until("old models to be pruned", || {
        store
            .get_all_iterations("ws", Some(h.cat))
            .map(|its| its[..2].iter().all(|it| it.status == IterationStatus::ModelDeleted))
            .unwrap_or(false)
    })
    .await;

    let its = store.get_all_iterations("ws", Some(h.cat)).unwrap();
    for (i, it) in its.iter().enumerate() {
        let model = it.model.as_ref().unwrap();
        if i < 2 {
            assert_eq!(it.status, IterationStatus::ModelDeleted, "iteration {i}");
            assert_eq!(model.model_status, ModelStatus::Deleted);
            assert!(!h.orch.config().data_dir.join("models").join(&model.model_id).exists());
        } else {
            assert_eq!(it.status, IterationStatus::Ready, "iteration {i}");
            assert_eq!(model.model_status, ModelStatus::Ready);
        }
    }

    let exported = h.orch.export_model("ws", h.cat, 3).unwrap();
    assert!(exported.join("model.txt").exists());
    assert!(h.orch.export_model("ws", h.cat, 0).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_category_removes_models_and_labels() {
    let h = harness(|_| {});
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    h.orch.train_if_recommended("ws", h.cat, false).unwrap();
    let it = settled(&h, 0).await;
    let model_dir = h.orch.config().data_dir.join("models").join(it.model.unwrap().model_id);
    assert!(model_dir.exists());

    h.orch.delete_category("ws", h.cat).unwrap();
    assert!(!model_dir.exists());
    assert!(h.orch.data().get_labeled_elements("ws", "ds", h.cat).unwrap().is_empty());

    let err = h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap_err();
    assert!(matches!(err, orchestrator::OrchestratorError::Store(StoreError::CategoryDeleted(_))));

    // ids are never reused
    let next = h.orch.create_category("ws", "sports", "").unwrap();
    assert_ne!(next, h.cat);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_workspace_removes_everything() {
    let h = harness(|_| {});
    h.orch.set_labels("ws", h.cat, &[label("u1", true)]).unwrap();
    h.orch.train_if_recommended("ws", h.cat, false).unwrap();
    settled(&h, 0).await;

    h.orch.delete_workspace("ws").unwrap();
    assert!(!h.orch.store().workspace_exists("ws").unwrap());
    assert!(h.orch.data().get_labeled_elements("ws", "ds", h.cat).unwrap().is_empty());
    assert!(h.orch.create_workspace("other", "missing-dataset").is_err());
}
