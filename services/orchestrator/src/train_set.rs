use std::sync::Arc;

use jobs::{JobHandle, JobScheduler, ResourceKind};
use modelops::TrainElement;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use statestore::CategoryId;
use tracing::debug;

use crate::data_access::{DataAccess, LabelType};

pub trait TrainSetSelector: Send + Sync {
    fn collect_train_set(
        &self,
        workspace_id: &str,
        dataset_name: &str,
        category_id: CategoryId,
    ) -> JobHandle<Vec<TrainElement>>;
}

/// Human labels of the category, padded with weak negatives drawn from the
/// unlabeled elements at `weak_negative_ratio` per positive label.
pub struct DefaultTrainSetSelector {
    data: Arc<dyn DataAccess>,
    scheduler: JobScheduler,
    weak_negative_ratio: f64,
    seed: u64,
}

impl DefaultTrainSetSelector {
    pub fn new(data: Arc<dyn DataAccess>, scheduler: JobScheduler, weak_negative_ratio: f64) -> Self {
        Self {
            data,
            scheduler,
            weak_negative_ratio,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl TrainSetSelector for DefaultTrainSetSelector {
    fn collect_train_set(
        &self,
        workspace_id: &str,
        dataset_name: &str,
        category_id: CategoryId,
    ) -> JobHandle<Vec<TrainElement>> {
        let data = self.data.clone();
        let workspace_id = workspace_id.to_string();
        let dataset_name = dataset_name.to_string();
        let ratio = self.weak_negative_ratio;
        let seed = self.seed ^ u64::from(category_id);

        self.scheduler.submit(ResourceKind::Cpu, move || {
            let labeled = data.get_labeled_elements(&workspace_id, &dataset_name, category_id)?;
            let mut train: Vec<TrainElement> = labeled
                .into_iter()
                .filter(|(_, label)| label.label_type == LabelType::Standard)
                .map(|(el, label)| TrainElement {
                    item: el.infer_item(),
                    label: label.value,
                    weak: false,
                })
                .collect();

            let positives = train.iter().filter(|t| t.label).count();
            let wanted = (positives as f64 * ratio).round() as usize;
            if wanted > 0 {
                let unlabeled = data.get_unlabeled_elements(&workspace_id, &dataset_name, category_id, true)?;
                let mut rng = StdRng::seed_from_u64(seed);
                train.extend(unlabeled.choose_multiple(&mut rng, wanted).map(|el| TrainElement {
                    item: el.infer_item(),
                    label: false,
                    weak: true,
                }));
            }

            debug!(
                workspace_id = %workspace_id,
                category_id,
                train_size = train.len(),
                positives,
                "train set collected"
            );
            Ok(train)
        })
    }
}
