//! The iteration state machine.
//!
//! Each stage runs on a scheduler worker and registers the next stage as a
//! continuation on the previous stage's job handle:
//!
//! PREPARING_DATA -> TRAINING -> RUNNING_INFERENCE -> RUNNING_ACTIVE_LEARNING
//! -> CALCULATING_STATISTICS -> READY
//!
//! A failing stage logs the failure with its context and moves the iteration
//! to ERROR. Nothing is re-raised into the worker pool.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use jobs::{JobHandle, JobScheduler};
use modelops::{prune_models, ModelFactory, ModelType, Prediction, TrainElement, TrainParams};
use serde_json::json;
use statestore::{
    CategoryId, Iteration, IterationStatus, IterationTrack, ModelInfo, ModelStatus, Statistics, Workspace,
    WorkspaceStore,
};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::data_access::{DataAccess, Element, FileDataAccess, LabelCounts};
use crate::retrain_policy::{self, RetrainDecision, RetrainThresholds};
use crate::train_set::{DefaultTrainSetSelector, TrainSetSelector};
use crate::train_validator::{validate_train_set, TrainCounts};
use crate::{OrchestratorError, Result};

pub struct Orchestrator {
    pub(crate) store: Arc<WorkspaceStore>,
    pub(crate) data: Arc<dyn DataAccess>,
    pub(crate) factory: ModelFactory,
    selector: Arc<dyn TrainSetSelector>,
    pub(crate) config: AppConfig,
}

#[derive(Clone, Debug)]
struct IterationCtx {
    workspace_id: String,
    category_id: CategoryId,
    index: usize,
    dataset_name: String,
    model_type: ModelType,
}

impl IterationCtx {
    fn track(&self) -> Option<CategoryId> {
        Some(self.category_id)
    }
}

const LAUNCH_STAGE: &str = "launch";

struct Recommendations {
    uris: Vec<String>,
    mean_score: f64,
    strategy: &'static str,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        store: Arc<WorkspaceStore>,
        data: Arc<dyn DataAccess>,
        factory: ModelFactory,
        selector: Arc<dyn TrainSetSelector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            data,
            factory,
            selector,
            config,
        })
    }

    /// File-backed store and labels under `config.data_dir`, with the
    /// default train-set selector.
    pub fn from_config(config: AppConfig, scheduler: JobScheduler, factory: ModelFactory) -> Result<Arc<Self>> {
        let store = Arc::new(WorkspaceStore::open(config.workspaces_dir())?);
        let data: Arc<dyn DataAccess> = Arc::new(FileDataAccess::new(
            config.datasets_dir(),
            config.labels_dir(),
            config.apply_labels_to_duplicate_texts,
        ));
        let selector = Arc::new(DefaultTrainSetSelector::new(
            data.clone(),
            scheduler,
            config.weak_negative_ratio,
        ));
        Ok(Self::new(config, store, data, factory, selector))
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    pub fn data(&self) -> &dyn DataAccess {
        self.data.as_ref()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ---------------- Entry points ---------------- //

    /// Append a new iteration for the category and start its pipeline.
    /// Returns the new index as soon as the first stage is submitted.
    ///
    /// Does not check for an iteration already in flight; that guard lives
    /// in [`train_if_recommended`](Self::train_if_recommended). A launch that
    /// cannot proceed still appends the iteration, already at ERROR.
    pub fn run_iteration(
        self: &Arc<Self>,
        workspace_id: &str,
        category_id: CategoryId,
        model_type: &ModelType,
    ) -> Result<usize> {
        let precheck = self.launch_precheck(model_type);
        let launch_error = precheck.as_ref().err().map(ToString::to_string);
        let ctx = self.store.update_workspace(workspace_id, |ws| {
            append_iteration(ws, category_id, model_type, launch_error.as_deref())
        })?;
        let index = ctx.index;
        self.launch(ctx, precheck)?;
        Ok(index)
    }

    pub fn retrain_decision(&self, workspace_id: &str, category_id: CategoryId, force: bool) -> Result<RetrainDecision> {
        let counts = self.label_counts_for_policy(workspace_id, category_id)?;
        let thresholds = RetrainThresholds::from(&self.config);
        Ok(self.store.read_workspace(workspace_id, |ws| {
            let track = ws.track(Some(category_id))?;
            Ok(evaluate_track(&counts, track, &thresholds, force))
        })?)
    }

    /// Start a new iteration when the retrain policy says so.
    ///
    /// The policy check, the change-counter reset and the append of the new
    /// iteration happen in one write under the workspace lock, so concurrent
    /// callers launch at most one iteration and no label change counted in
    /// between is lost. The trailing iteration always ends up well formed: a
    /// launch failure leaves it at ERROR rather than PREPARING_DATA.
    pub fn train_if_recommended(
        self: &Arc<Self>,
        workspace_id: &str,
        category_id: CategoryId,
        force: bool,
    ) -> Result<Option<usize>> {
        let counts = self.label_counts_for_policy(workspace_id, category_id)?;
        let thresholds = RetrainThresholds::from(&self.config);

        // cheap read first, most calls end here
        let decision = self.store.read_workspace(workspace_id, |ws| {
            Ok(evaluate_track(&counts, ws.track(Some(category_id))?, &thresholds, force))
        })?;
        if !decision.should_train() {
            debug!(workspace_id, category_id, ?decision, "retrain not recommended");
            return Ok(None);
        }

        let model_type = ModelType::new(self.config.model_type.as_str());
        let precheck = self.launch_precheck(&model_type);
        let launch_error = precheck.as_ref().err().map(ToString::to_string);
        let (decision, ctx) = self.store.update_workspace(workspace_id, |ws| {
            let decision = evaluate_track(&counts, ws.track(Some(category_id))?, &thresholds, force);
            if !decision.should_train() {
                return Ok((decision, None));
            }
            ws.track_mut(Some(category_id))?.label_change_count_since_last_train = 0;
            let ctx = append_iteration(ws, category_id, &model_type, launch_error.as_deref())?;
            Ok((decision, Some(ctx)))
        })?;
        let Some(ctx) = ctx else {
            debug!(workspace_id, category_id, ?decision, "retrain not recommended");
            return Ok(None);
        };

        let index = ctx.index;
        self.launch(ctx, precheck)?;
        info!(workspace_id, category_id, iteration = index, ?decision, "retrain launched");
        Ok(Some(index))
    }

    fn label_counts_for_policy(&self, workspace_id: &str, category_id: CategoryId) -> Result<LabelCounts> {
        let dataset_name = self.store.read_workspace(workspace_id, |ws| {
            ws.category(category_id)?;
            Ok(ws.dataset_name.clone())
        })?;
        Ok(self.data.get_label_counts(workspace_id, &dataset_name, category_id, true)?)
    }

    /// Checks that must pass before an iteration may enter the pipeline.
    fn launch_precheck(&self, model_type: &ModelType) -> Result<()> {
        self.factory.get(model_type)?;
        Ok(())
    }

    /// Submit the first stage of a freshly appended iteration. A failed
    /// precheck was already recorded on the iteration; it is only logged and
    /// returned here.
    fn launch(self: &Arc<Self>, ctx: IterationCtx, precheck: Result<()>) -> Result<()> {
        if let Err(e) = precheck {
            error!(
                workspace_id = %ctx.workspace_id,
                category_id = ctx.category_id,
                iteration = ctx.index,
                stage = LAUNCH_STAGE,
                error = %e,
                "iteration failed"
            );
            return Err(e);
        }

        info!(
            workspace_id = %ctx.workspace_id,
            category_id = ctx.category_id,
            iteration = ctx.index,
            model_type = %ctx.model_type,
            "iteration started"
        );
        let job = self
            .selector
            .collect_train_set(&ctx.workspace_id, &ctx.dataset_name, ctx.category_id);
        let this = self.clone();
        job.on_done(move |h| this.train_set_ready(ctx, h));
        Ok(())
    }

    // ---------------- Stages ---------------- //

    fn train_set_ready(self: Arc<Self>, ctx: IterationCtx, handle: &JobHandle<Vec<TrainElement>>) {
        let train = match handle.try_result() {
            Ok(train) => train,
            Err(e) => return self.fail(&ctx, "prepare_data", &e),
        };
        if let Err(e) = self.launch_training(&ctx, train) {
            self.fail(&ctx, "training", &e);
        }
    }

    fn launch_training(self: &Arc<Self>, ctx: &IterationCtx, train: Vec<TrainElement>) -> Result<()> {
        let counts = TrainCounts::of(&train);
        let mut stats = counts.to_statistics();

        if let Err(insufficient) = validate_train_set(counts, self.config.min_train_per_class) {
            warn!(
                workspace_id = %ctx.workspace_id,
                category_id = ctx.category_id,
                iteration = ctx.index,
                reason = %insufficient.reason,
                "insufficient train data"
            );
            stats.insert("insufficient_reason".into(), json!(insufficient.reason));
            self.store
                .add_iteration_statistics(&ctx.workspace_id, ctx.track(), ctx.index, stats)?;
            self.store.update_iteration_status(
                &ctx.workspace_id,
                ctx.track(),
                ctx.index,
                IterationStatus::InsufficientTrainData,
            )?;
            return Ok(());
        }

        self.store
            .add_iteration_statistics(&ctx.workspace_id, ctx.track(), ctx.index, stats.clone())?;
        self.store
            .update_iteration_status(&ctx.workspace_id, ctx.track(), ctx.index, IterationStatus::Training)?;

        let classifier = self.factory.get(&ctx.model_type)?;
        let submission = classifier
            .train(train, &self.config.language, &TrainParams::new())
            .map_err(OrchestratorError::Model)?;
        self.store.add_model(
            &ctx.workspace_id,
            ctx.track(),
            ctx.index,
            ModelInfo {
                model_id: submission.model_id.clone(),
                model_status: submission.status,
                creation_date: Utc::now(),
                model_type: ctx.model_type.to_string(),
                train_statistics: stats,
            },
        )?;
        info!(
            workspace_id = %ctx.workspace_id,
            category_id = ctx.category_id,
            iteration = ctx.index,
            model_id = %submission.model_id,
            "training submitted"
        );

        let this = self.clone();
        let next = ctx.clone();
        let model_id = submission.model_id;
        submission.job.on_done(move |h| this.train_done(next, model_id, h));
        Ok(())
    }

    fn train_done(self: Arc<Self>, ctx: IterationCtx, model_id: String, handle: &JobHandle<()>) {
        if let Err(e) = handle.try_result() {
            if let Err(se) = self
                .store
                .update_model_status(&ctx.workspace_id, ctx.track(), ctx.index, ModelStatus::Error)
            {
                warn!(workspace_id = %ctx.workspace_id, iteration = ctx.index, error = %se, "could not mark model failed");
            }
            return self.fail(&ctx, "training", &e);
        }
        if let Err(e) = self.start_inference(&ctx, &model_id) {
            self.fail(&ctx, "inference", &e);
        }
    }

    fn start_inference(self: &Arc<Self>, ctx: &IterationCtx, model_id: &str) -> Result<()> {
        self.store
            .update_model_status(&ctx.workspace_id, ctx.track(), ctx.index, ModelStatus::Ready)?;
        self.store.update_iteration_status(
            &ctx.workspace_id,
            ctx.track(),
            ctx.index,
            IterationStatus::RunningInference,
        )?;

        let elements = self.data.get_all_elements(&ctx.dataset_name)?;
        let items = elements.iter().map(Element::infer_item).collect();
        let classifier = self.factory.get(&ctx.model_type)?;

        let this = self.clone();
        let next = ctx.clone();
        let owned_id = model_id.to_string();
        classifier.infer_by_id_async(
            model_id,
            items,
            Box::new(move |h: &JobHandle<Vec<Prediction>>| this.infer_done(next, owned_id, elements, h)),
        );
        Ok(())
    }

    fn infer_done(
        self: Arc<Self>,
        ctx: IterationCtx,
        model_id: String,
        elements: Vec<Element>,
        handle: &JobHandle<Vec<Prediction>>,
    ) {
        let outcome = match handle.try_result() {
            Ok(predictions) => self.finish_iteration(&ctx, &model_id, &elements, &predictions),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            self.fail(&ctx, "post_inference", &e);
        }
        self.prune(&ctx);
    }

    fn finish_iteration(
        &self,
        ctx: &IterationCtx,
        model_id: &str,
        elements: &[Element],
        predictions: &[Prediction],
    ) -> Result<()> {
        let stats = self.post_train_statistics(ctx, elements, predictions)?;
        self.store
            .add_iteration_statistics(&ctx.workspace_id, ctx.track(), ctx.index, stats)?;

        self.store.update_iteration_status(
            &ctx.workspace_id,
            ctx.track(),
            ctx.index,
            IterationStatus::RunningActiveLearning,
        )?;
        let rec = self.recommend(ctx, model_id)?;
        let recommended_count = rec.uris.len();
        self.store
            .update_category_recommendations(&ctx.workspace_id, ctx.track(), ctx.index, rec.uris)?;

        self.store.update_iteration_status(
            &ctx.workspace_id,
            ctx.track(),
            ctx.index,
            IterationStatus::CalculatingStatistics,
        )?;
        let mut stats = Statistics::new();
        stats.insert("recommended_count".into(), json!(recommended_count));
        stats.insert("recommended_mean_score".into(), json!(rec.mean_score));
        stats.insert("active_learning_strategy".into(), json!(rec.strategy));
        self.store
            .add_iteration_statistics(&ctx.workspace_id, ctx.track(), ctx.index, stats)?;

        self.store
            .update_iteration_status(&ctx.workspace_id, ctx.track(), ctx.index, IterationStatus::Ready)?;
        info!(
            workspace_id = %ctx.workspace_id,
            category_id = ctx.category_id,
            iteration = ctx.index,
            model_id,
            recommended_count,
            "iteration ready"
        );
        Ok(())
    }

    /// Share of elements predicted positive, and share of predictions that
    /// flipped since the latest earlier READY iteration (0 without one).
    fn post_train_statistics(
        &self,
        ctx: &IterationCtx,
        elements: &[Element],
        predictions: &[Prediction],
    ) -> Result<Statistics> {
        let total = predictions.len();
        let positives = predictions.iter().filter(|p| p.label).count();

        let previous = self.store.read_workspace(&ctx.workspace_id, |ws| {
            Ok(ws
                .track(ctx.track())?
                .latest_ready_before(ctx.index)
                .and_then(|(i, it)| it.model.clone().map(|m| (i, m))))
        })?;

        let mut stats = Statistics::new();
        let changed_fraction = match previous {
            None => 0.0,
            Some((prev_index, prev_model)) => {
                let classifier = self.factory.get(&ModelType::new(prev_model.model_type.as_str()))?;
                let items: Vec<_> = elements.iter().map(Element::infer_item).collect();
                let before = classifier
                    .infer_by_id(&prev_model.model_id, &items, true)
                    .map_err(OrchestratorError::Model)?;
                let changed = before
                    .iter()
                    .zip(predictions)
                    .filter(|(a, b)| a.label != b.label)
                    .count();
                stats.insert("compared_to_iteration".into(), json!(prev_index));
                fraction(changed, total)
            }
        };

        stats.insert("element_count".into(), json!(total));
        stats.insert("positive_count".into(), json!(positives));
        stats.insert("positive_fraction".into(), json!(fraction(positives, total)));
        stats.insert("changed_fraction".into(), json!(changed_fraction));
        Ok(stats)
    }

    fn recommend(&self, ctx: &IterationCtx, model_id: &str) -> Result<Recommendations> {
        let unlabeled = self.data.get_unlabeled_elements(
            &ctx.workspace_id,
            &ctx.dataset_name,
            ctx.category_id,
            self.config.apply_labels_to_duplicate_texts,
        )?;
        let items: Vec<_> = unlabeled.iter().map(Element::infer_item).collect();
        let classifier = self.factory.get(&ctx.model_type)?;
        let predictions = classifier
            .infer_by_id(model_id, &items, true)
            .map_err(OrchestratorError::Model)?;

        let strategy = self.config.active_learning.strategy_for(ctx.index);
        let picked = strategy
            .learner(ctx.index as u64)
            .get_recommended_items_for_labeling(&unlabeled, &predictions, self.config.al_sample_size)
            .map_err(OrchestratorError::Model)?;

        let uris: Vec<String> = picked
            .iter()
            .filter_map(|&i| unlabeled.get(i))
            .map(|e| e.uri.clone())
            .collect();
        let score_sum: f64 = picked.iter().filter_map(|&i| predictions.get(i)).map(|p| p.score).sum();
        let mean_score = if picked.is_empty() { 0.0 } else { score_sum / picked.len() as f64 };

        Ok(Recommendations {
            uris,
            mean_score,
            strategy: strategy.as_str(),
        })
    }

    fn prune(&self, ctx: &IterationCtx) {
        match prune_models(
            &self.store,
            &self.factory,
            &ctx.workspace_id,
            ctx.track(),
            ctx.index,
            self.config.max_models_per_category,
        ) {
            Ok(pruned) if !pruned.is_empty() => {
                info!(workspace_id = %ctx.workspace_id, category_id = ctx.category_id, ?pruned, "old models pruned");
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    workspace_id = %ctx.workspace_id,
                    category_id = ctx.category_id,
                    iteration = ctx.index,
                    error = %e,
                    "model pruning failed"
                );
            }
        }
    }

    // ---------------- Failure handling ---------------- //

    fn fail(&self, ctx: &IterationCtx, stage: &str, err: &dyn Display) {
        error!(
            workspace_id = %ctx.workspace_id,
            category_id = ctx.category_id,
            iteration = ctx.index,
            stage,
            error = %err,
            "iteration failed"
        );
        self.mark_error(&ctx.workspace_id, ctx.category_id, ctx.index, stage, err);
    }

    fn mark_error(&self, workspace_id: &str, category_id: CategoryId, index: usize, stage: &str, err: &dyn Display) {
        let mut stats = Statistics::new();
        stats.insert("error".into(), json!(err.to_string()));
        stats.insert("error_stage".into(), json!(stage));
        if let Err(e) = self
            .store
            .add_iteration_statistics(workspace_id, Some(category_id), index, stats)
        {
            warn!(workspace_id, category_id, iteration = index, error = %e, "could not record failure");
        }
        if let Err(e) = self
            .store
            .update_iteration_status(workspace_id, Some(category_id), index, IterationStatus::Error)
        {
            warn!(workspace_id, category_id, iteration = index, error = %e, "could not mark iteration failed");
        }
    }
}

fn evaluate_track(
    counts: &LabelCounts,
    track: &IterationTrack,
    thresholds: &RetrainThresholds,
    force: bool,
) -> RetrainDecision {
    retrain_policy::evaluate(
        counts,
        track.label_change_count_since_last_train,
        &track.iterations,
        thresholds,
        force,
    )
}

/// Append a PREPARING_DATA iteration to the category's track. With a
/// `launch_error` the iteration is written straight to ERROR instead.
fn append_iteration(
    ws: &mut Workspace,
    category_id: CategoryId,
    model_type: &ModelType,
    launch_error: Option<&str>,
) -> statestore::Result<IterationCtx> {
    let workspace_id = ws.workspace_id.clone();
    let dataset_name = ws.dataset_name.clone();
    let track = ws.track_mut(Some(category_id))?;

    let mut it = Iteration::new();
    it.iteration_statistics
        .insert("model_type".into(), json!(model_type.as_str()));
    if let Some(err) = launch_error {
        it.status = IterationStatus::Error;
        it.iteration_statistics.insert("error".into(), json!(err));
        it.iteration_statistics
            .insert("error_stage".into(), json!(LAUNCH_STAGE));
    }
    track.iterations.push(it);

    Ok(IterationCtx {
        workspace_id,
        category_id,
        index: track.iterations.len() - 1,
        dataset_name,
        model_type: model_type.clone(),
    })
}

fn fraction(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
