use statestore::{Iteration, IterationStatus};

use crate::config::AppConfig;
use crate::data_access::LabelCounts;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrainThresholds {
    pub positive: u64,
    pub negative: u64,
    pub changed: u64,
}

impl From<&AppConfig> for RetrainThresholds {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            positive: cfg.first_model_positive_threshold,
            negative: cfg.first_model_negative_threshold,
            changed: cfg.changed_element_threshold,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetrainDecision {
    Train,
    Forced,
    IterationInFlight { index: usize, status: IterationStatus },
    NotEnoughPositives { have: u64, need: u64 },
    NotEnoughNegatives { have: u64, need: u64 },
    NotEnoughChanges { have: u64, need: u64 },
}

impl RetrainDecision {
    pub fn should_train(&self) -> bool {
        matches!(self, RetrainDecision::Train | RetrainDecision::Forced)
    }
}

/// Whether a category should get a new iteration.
///
/// An iteration still in the pipeline blocks even a forced retrain; ERROR
/// and other terminal iterations are history and never block.
pub fn evaluate(
    counts: &LabelCounts,
    changes_since_last_train: u64,
    iterations: &[Iteration],
    thresholds: &RetrainThresholds,
    force: bool,
) -> RetrainDecision {
    if let Some((index, it)) = iterations
        .iter()
        .enumerate()
        .rev()
        .find(|(_, it)| !it.status.is_terminal())
    {
        return RetrainDecision::IterationInFlight { index, status: it.status };
    }
    if force {
        return RetrainDecision::Forced;
    }
    if counts.positive < thresholds.positive {
        return RetrainDecision::NotEnoughPositives {
            have: counts.positive,
            need: thresholds.positive,
        };
    }
    if counts.negative < thresholds.negative {
        return RetrainDecision::NotEnoughNegatives {
            have: counts.negative,
            need: thresholds.negative,
        };
    }
    if changes_since_last_train < thresholds.changed {
        return RetrainDecision::NotEnoughChanges {
            have: changes_since_last_train,
            need: thresholds.changed,
        };
    }
    RetrainDecision::Train
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: RetrainThresholds = RetrainThresholds {
        positive: 2,
        negative: 0,
        changed: 3,
    };

    fn counts(positive: u64, negative: u64) -> LabelCounts {
        LabelCounts {
            positive,
            negative,
            ..LabelCounts::default()
        }
    }

    fn iteration(status: IterationStatus) -> Iteration {
        Iteration {
            status,
            ..Iteration::new()
        }
    }

    #[test]
    fn thresholds_must_both_be_met() {
        assert_eq!(
            evaluate(&counts(1, 0), 5, &[], &T, false),
            RetrainDecision::NotEnoughPositives { have: 1, need: 2 }
        );
        assert_eq!(
            evaluate(&counts(2, 0), 2, &[], &T, false),
            RetrainDecision::NotEnoughChanges { have: 2, need: 3 }
        );
        assert_eq!(evaluate(&counts(2, 0), 3, &[], &T, false), RetrainDecision::Train);
    }

    #[test]
    fn negative_threshold_applies_when_set() {
        let t = RetrainThresholds { negative: 1, ..T };
        assert!(!evaluate(&counts(5, 0), 5, &[], &t, false).should_train());
        assert!(evaluate(&counts(5, 1), 5, &[], &t, false).should_train());
    }

    #[test]
    fn error_iterations_do_not_block() {
        use IterationStatus::*;
        let its = [iteration(Ready), iteration(Error), iteration(InsufficientTrainData)];
        assert_eq!(evaluate(&counts(2, 0), 3, &its, &T, false), RetrainDecision::Train);
    }

    #[test]
    fn in_flight_iteration_blocks_even_forced() {
        use IterationStatus::*;
        let its = [iteration(Ready), iteration(RunningInference)];
        assert_eq!(
            evaluate(&counts(9, 9), 9, &its, &T, true),
            RetrainDecision::IterationInFlight { index: 1, status: RunningInference }
        );
    }

    #[test]
    fn force_skips_thresholds() {
        assert_eq!(evaluate(&counts(0, 0), 0, &[], &T, true), RetrainDecision::Forced);
    }
}
