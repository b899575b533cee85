use modelops::TrainElement;
use serde_json::json;
use statestore::Statistics;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrainCounts {
    pub positive: u64,
    pub negative: u64,
    pub weak_positive: u64,
    pub weak_negative: u64,
}

impl TrainCounts {
    pub fn of(train: &[TrainElement]) -> Self {
        let mut c = Self::default();
        for t in train {
            match (t.weak, t.label) {
                (false, true) => c.positive += 1,
                (false, false) => c.negative += 1,
                (true, true) => c.weak_positive += 1,
                (true, false) => c.weak_negative += 1,
            }
        }
        c
    }

    pub fn total_positive(&self) -> u64 {
        self.positive + self.weak_positive
    }

    pub fn total_negative(&self) -> u64 {
        self.negative + self.weak_negative
    }

    pub fn to_statistics(&self) -> Statistics {
        let mut s = Statistics::new();
        s.insert("train_positive".into(), json!(self.positive));
        s.insert("train_negative".into(), json!(self.negative));
        s.insert("train_weak_positive".into(), json!(self.weak_positive));
        s.insert("train_weak_negative".into(), json!(self.weak_negative));
        s
    }
}

/// Why a train set cannot be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Insufficient {
    pub reason: String,
    pub counts: TrainCounts,
}

pub fn validate_train_set(counts: TrainCounts, min_per_class: usize) -> Result<TrainCounts, Insufficient> {
    let min = min_per_class.max(1) as u64;
    let mut problems: Vec<String> = vec![];

    if counts.total_positive() < min {
        problems.push(format!("{} positive examples, need {min}", counts.total_positive()));
    }
    if counts.total_negative() < min {
        problems.push(format!("{} negative examples, need {min}", counts.total_negative()));
    }

    if problems.is_empty() {
        Ok(counts)
    } else {
        Err(Insufficient {
            reason: problems.join("; "),
            counts,
        })
    }
}
