use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use jobs::SchedulerConfig;
use modelops::InferenceCache;

use crate::active_learning::{ActiveLearningPolicy, Strategy};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,

    pub cpu_workers: usize,
    pub gpu_workers: usize,

    pub first_model_positive_threshold: u64,
    pub first_model_negative_threshold: u64,
    pub changed_element_threshold: u64,

    /// READY models kept per category before older ones are pruned.
    pub max_models_per_category: usize,

    pub al_sample_size: usize,
    pub active_learning: ActiveLearningPolicy,

    pub apply_labels_to_duplicate_texts: bool,
    pub weak_negative_ratio: f64,
    pub min_train_per_class: usize,

    pub inference_cache_capacity: u64,
    pub model_type: String,
    pub language: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cpu_workers: 4,
            gpu_workers: 1,
            first_model_positive_threshold: 20,
            first_model_negative_threshold: 0,
            changed_element_threshold: 20,
            max_models_per_category: 2,
            al_sample_size: 100,
            active_learning: ActiveLearningPolicy::Static(Strategy::HardMining),
            apply_labels_to_duplicate_texts: true,
            weak_negative_ratio: 1.0,
            min_train_per_class: 1,
            inference_cache_capacity: 100_000,
            model_type: "default".to_string(),
            language: "english".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let active_learning = match std::env::var("ORCH_ACTIVE_LEARNING_SWITCH") {
            Ok(v) if !v.trim().is_empty() => v
                .parse::<ActiveLearningPolicy>()
                .with_context(|| format!("Invalid ORCH_ACTIVE_LEARNING_SWITCH: {v}"))?,
            _ => ActiveLearningPolicy::Static(parse_or("ORCH_ACTIVE_LEARNING", Strategy::HardMining)?),
        };

        let cfg = Self {
            data_dir: std::env::var("ORCH_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            cpu_workers: parse_or("ORCH_CPU_WORKERS", d.cpu_workers)?,
            gpu_workers: parse_or("ORCH_GPU_WORKERS", d.gpu_workers)?,
            first_model_positive_threshold: parse_or(
                "ORCH_FIRST_MODEL_POSITIVE_THRESHOLD",
                d.first_model_positive_threshold,
            )?,
            first_model_negative_threshold: parse_or(
                "ORCH_FIRST_MODEL_NEGATIVE_THRESHOLD",
                d.first_model_negative_threshold,
            )?,
            changed_element_threshold: parse_or("ORCH_CHANGED_ELEMENT_THRESHOLD", d.changed_element_threshold)?,
            max_models_per_category: parse_or("ORCH_MAX_MODELS_PER_CATEGORY", d.max_models_per_category)?,
            al_sample_size: parse_or("ORCH_AL_SAMPLE_SIZE", d.al_sample_size)?,
            active_learning,
            apply_labels_to_duplicate_texts: flag_or("ORCH_APPLY_LABELS_TO_DUPLICATES", d.apply_labels_to_duplicate_texts),
            weak_negative_ratio: parse_or("ORCH_WEAK_NEGATIVE_RATIO", d.weak_negative_ratio)?,
            min_train_per_class: parse_or("ORCH_MIN_TRAIN_PER_CLASS", d.min_train_per_class)?,
            inference_cache_capacity: parse_or("ORCH_INFERENCE_CACHE_CAPACITY", d.inference_cache_capacity)?,
            model_type: std::env::var("ORCH_MODEL_TYPE").unwrap_or(d.model_type),
            language: std::env::var("ORCH_LANGUAGE").unwrap_or(d.language),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    // Tiny sanity checks (fail fast, fail loud)
    pub fn validate(&self) -> Result<()> {
        if self.cpu_workers == 0 || self.gpu_workers == 0 {
            bail!("ORCH_CPU_WORKERS and ORCH_GPU_WORKERS must be at least 1");
        }
        if self.max_models_per_category == 0 {
            bail!("ORCH_MAX_MODELS_PER_CATEGORY must be at least 1");
        }
        if self.al_sample_size == 0 {
            bail!("ORCH_AL_SAMPLE_SIZE must be at least 1");
        }
        if !self.weak_negative_ratio.is_finite() || self.weak_negative_ratio < 0.0 {
            bail!("ORCH_WEAK_NEGATIVE_RATIO must be a non-negative number");
        }
        Ok(())
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            cpu_workers: self.cpu_workers,
            gpu_workers: self.gpu_workers,
        }
    }

    /// Prediction cache with its disk tier under `<data>/cache`.
    pub fn inference_cache(&self) -> InferenceCache {
        InferenceCache::new(self.inference_cache_capacity, Some(self.cache_dir()))
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.data_dir.join("datasets")
    }

    pub fn labels_dir(&self) -> PathBuf {
        self.data_dir.join("labels")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {key} ({v}): {e}")),
        Err(_) => Ok(default),
    }
}

fn flag_or(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_retention_is_rejected() {
        let cfg = AppConfig {
            max_models_per_category: 0,
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_or_reports_bad_values() {
        std::env::set_var("ORCH_TEST_PARSE_OR", "not-a-number");
        let err = parse_or::<usize>("ORCH_TEST_PARSE_OR", 3).unwrap_err();
        assert!(err.to_string().contains("ORCH_TEST_PARSE_OR"));
        assert_eq!(parse_or::<usize>("ORCH_TEST_UNSET_KEY", 3).unwrap(), 3);
    }
}
