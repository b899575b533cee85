use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use modelops::Prediction;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data_access::Element;

/// Picks which unlabeled elements a person should label next.
pub trait ActiveLearner: Send + Sync {
    /// Positions into `candidates`, best first, at most `sample_size` long.
    fn get_recommended_items_for_labeling(
        &self,
        candidates: &[Element],
        predictions: &[Prediction],
        sample_size: usize,
    ) -> anyhow::Result<Vec<usize>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Highest positive score first.
    Retrospective,
    /// Score closest to the decision boundary first.
    HardMining,
    Random,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Retrospective => "retrospective",
            Strategy::HardMining => "hard_mining",
            Strategy::Random => "random",
        }
    }

    pub fn learner(self, seed: u64) -> Box<dyn ActiveLearner> {
        match self {
            Strategy::Retrospective => Box::new(Retrospective),
            Strategy::HardMining => Box::new(HardMining),
            Strategy::Random => Box::new(RandomSampling { seed }),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retrospective" => Ok(Strategy::Retrospective),
            "hard_mining" => Ok(Strategy::HardMining),
            "random" => Ok(Strategy::Random),
            other => Err(anyhow!("unknown active learning strategy: {other}")),
        }
    }
}

/// Which strategy serves a given iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveLearningPolicy {
    Static(Strategy),
    /// `first` before iteration `index`, `second` from it on.
    SwitchAtIteration {
        first: Strategy,
        second: Strategy,
        index: usize,
    },
}

impl ActiveLearningPolicy {
    pub fn strategy_for(&self, iteration: usize) -> Strategy {
        match *self {
            ActiveLearningPolicy::Static(s) => s,
            ActiveLearningPolicy::SwitchAtIteration { first, second, index } => {
                if iteration < index {
                    first
                } else {
                    second
                }
            }
        }
    }
}

impl FromStr for ActiveLearningPolicy {
    type Err = anyhow::Error;

    /// `first:second:iteration`, e.g. `random:hard_mining:2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [first, second, index] = parts.as_slice() else {
            bail!("expected first:second:iteration, got {s}");
        };
        Ok(ActiveLearningPolicy::SwitchAtIteration {
            first: first.parse()?,
            second: second.parse()?,
            index: index.trim().parse()?,
        })
    }
}

fn check_lengths(candidates: &[Element], predictions: &[Prediction]) -> anyhow::Result<()> {
    if candidates.len() != predictions.len() {
        bail!(
            "{} predictions for {} candidates",
            predictions.len(),
            candidates.len()
        );
    }
    Ok(())
}

fn top_by(predictions: &[Prediction], sample_size: usize, key: impl Fn(&Prediction) -> f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..predictions.len()).collect();
    // stable: ties keep dataset order
    order.sort_by(|&a, &b| key(&predictions[a]).total_cmp(&key(&predictions[b])));
    order.truncate(sample_size);
    order
}

pub struct Retrospective;

impl ActiveLearner for Retrospective {
    fn get_recommended_items_for_labeling(
        &self,
        candidates: &[Element],
        predictions: &[Prediction],
        sample_size: usize,
    ) -> anyhow::Result<Vec<usize>> {
        check_lengths(candidates, predictions)?;
        Ok(top_by(predictions, sample_size, |p| -p.score))
    }
}

pub struct HardMining;

impl ActiveLearner for HardMining {
    fn get_recommended_items_for_labeling(
        &self,
        candidates: &[Element],
        predictions: &[Prediction],
        sample_size: usize,
    ) -> anyhow::Result<Vec<usize>> {
        check_lengths(candidates, predictions)?;
        Ok(top_by(predictions, sample_size, |p| (p.score - 0.5).abs()))
    }
}

pub struct RandomSampling {
    pub seed: u64,
}

impl ActiveLearner for RandomSampling {
    fn get_recommended_items_for_labeling(
        &self,
        candidates: &[Element],
        predictions: &[Prediction],
        sample_size: usize,
    ) -> anyhow::Result<Vec<usize>> {
        check_lengths(candidates, predictions)?;
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.seed));
        order.truncate(sample_size);
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(scores: &[f64]) -> (Vec<Element>, Vec<Prediction>) {
        let els = (0..scores.len()).map(|i| Element::new(format!("u{i}"), format!("t{i}"))).collect();
        let preds = scores
            .iter()
            .map(|&score| Prediction { label: score >= 0.5, score })
            .collect();
        (els, preds)
    }

    #[test]
    fn retrospective_prefers_high_scores() {
        let (els, preds) = fixture(&[0.2, 0.9, 0.6, 0.95]);
        let picked = Retrospective.get_recommended_items_for_labeling(&els, &preds, 2).unwrap();
        assert_eq!(picked, vec![3, 1]);
    }

    #[test]
    fn hard_mining_prefers_the_boundary() {
        let (els, preds) = fixture(&[0.1, 0.48, 0.9, 0.55]);
        let picked = HardMining.get_recommended_items_for_labeling(&els, &preds, 3).unwrap();
        assert_eq!(picked, vec![1, 3, 0]);
    }

    #[test]
    fn random_is_reproducible_for_a_seed() {
        let (els, preds) = fixture(&[0.5; 20]);
        let a = RandomSampling { seed: 7 }.get_recommended_items_for_labeling(&els, &preds, 5).unwrap();
        let b = RandomSampling { seed: 7 }.get_recommended_items_for_labeling(&els, &preds, 5).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn mismatched_predictions_are_rejected() {
        let (els, mut preds) = fixture(&[0.1, 0.2]);
        preds.pop();
        assert!(HardMining.get_recommended_items_for_labeling(&els, &preds, 1).is_err());
    }

    #[test]
    fn switching_policy_parses_and_switches() {
        let policy: ActiveLearningPolicy = "random:hard_mining:2".parse().unwrap();
        assert_eq!(policy.strategy_for(0), Strategy::Random);
        assert_eq!(policy.strategy_for(1), Strategy::Random);
        assert_eq!(policy.strategy_for(2), Strategy::HardMining);
        assert!("random:hard_mining".parse::<ActiveLearningPolicy>().is_err());
        assert!("random:nope:1".parse::<ActiveLearningPolicy>().is_err());
    }
}
