//! Dataset elements and per-workspace labels.
//!
//! Elements of a dataset live in `<datasets>/<dataset>.json` and are held in
//! memory once read. Labels are kept per workspace and dataset in
//! `<labels>/<workspace>/<dataset>.json`, keyed by uri and category.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use modelops::{InferItem, TEXT_KEY};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use statestore::CategoryId;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("dataset {dataset} has no element {uri}")]
    UnknownUri { dataset: String, uri: String },

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Element {
    pub uri: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Element {
    pub fn new(uri: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// The classifier input for this element: text plus every metadata field.
    pub fn infer_item(&self) -> InferItem {
        let mut item = self.metadata.clone();
        item.insert(TEXT_KEY.to_string(), self.text.clone());
        item
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    #[default]
    Standard,
    Weak,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub value: bool,
    #[serde(default)]
    pub label_type: LabelType,
}

impl Label {
    pub fn positive() -> Self {
        Self { value: true, label_type: LabelType::Standard }
    }

    pub fn negative() -> Self {
        Self { value: false, label_type: LabelType::Standard }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LabelCounts {
    pub positive: u64,
    pub negative: u64,
    pub weak_positive: u64,
    pub weak_negative: u64,
}

impl LabelCounts {
    fn add(&mut self, label: &Label) {
        match (label.label_type, label.value) {
            (LabelType::Standard, true) => self.positive += 1,
            (LabelType::Standard, false) => self.negative += 1,
            (LabelType::Weak, true) => self.weak_positive += 1,
            (LabelType::Weak, false) => self.weak_negative += 1,
        }
    }
}

pub trait DataAccess: Send + Sync {
    /// Append elements to a dataset, creating it if needed. Elements whose
    /// uri is already present are skipped. Returns how many were added.
    fn add_elements(&self, dataset: &str, elements: Vec<Element>) -> Result<usize>;

    fn get_all_elements(&self, dataset: &str) -> Result<Vec<Element>>;

    fn get_elements_by_uris(&self, dataset: &str, uris: &[String]) -> Result<Vec<Element>>;

    /// Returns the number of elements whose label actually changed.
    fn set_labels(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        labels: &[(String, Label)],
    ) -> Result<usize>;

    fn unset_labels(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        uris: &[String],
    ) -> Result<usize>;

    fn get_labeled_elements(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
    ) -> Result<Vec<(Element, Label)>>;

    /// With `dedup`, only the first element of each distinct text is listed.
    fn get_unlabeled_elements(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        dedup: bool,
    ) -> Result<Vec<Element>>;

    fn get_label_counts(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        dedup: bool,
    ) -> Result<LabelCounts>;

    fn delete_all_labels(&self, workspace_id: &str, dataset: &str) -> Result<()>;

    fn delete_labels_for_category(&self, workspace_id: &str, dataset: &str, category_id: CategoryId) -> Result<()>;
}

type LabelFile = BTreeMap<String, BTreeMap<CategoryId, Label>>;

pub struct FileDataAccess {
    datasets_dir: PathBuf,
    labels_dir: PathBuf,
    apply_to_duplicates: bool,
    datasets: RwLock<HashMap<String, Arc<Vec<Element>>>>,
    labels: Mutex<HashMap<(String, String), LabelFile>>,
}

impl FileDataAccess {
    pub fn new(datasets_dir: impl Into<PathBuf>, labels_dir: impl Into<PathBuf>, apply_to_duplicates: bool) -> Self {
        Self {
            datasets_dir: datasets_dir.into(),
            labels_dir: labels_dir.into(),
            apply_to_duplicates,
            datasets: RwLock::new(HashMap::new()),
            labels: Mutex::new(HashMap::new()),
        }
    }

    fn dataset_path(&self, dataset: &str) -> PathBuf {
        self.datasets_dir.join(format!("{dataset}.json"))
    }

    fn label_path(&self, workspace_id: &str, dataset: &str) -> PathBuf {
        self.labels_dir.join(workspace_id).join(format!("{dataset}.json"))
    }

    fn elements(&self, dataset: &str) -> Result<Arc<Vec<Element>>> {
        if let Some(els) = self.datasets.read().get(dataset) {
            return Ok(els.clone());
        }
        let mut datasets = self.datasets.write();
        if let Some(els) = datasets.get(dataset) {
            return Ok(els.clone());
        }
        let els: Vec<Element> = match read_json(&self.dataset_path(dataset))? {
            Some(els) => els,
            None => return Err(DataError::DatasetNotFound(dataset.to_string())),
        };
        let els = Arc::new(els);
        datasets.insert(dataset.to_string(), els.clone());
        Ok(els)
    }

    /// Run `f` over the label file of one workspace and dataset, persisting
    /// it when `f` reports a change.
    fn with_labels<R>(
        &self,
        workspace_id: &str,
        dataset: &str,
        f: impl FnOnce(&mut LabelFile) -> Result<(R, bool)>,
    ) -> Result<R> {
        let mut cache = self.labels.lock();
        let key = (workspace_id.to_string(), dataset.to_string());
        if !cache.contains_key(&key) {
            let file = read_json(&self.label_path(workspace_id, dataset))?.unwrap_or_default();
            cache.insert(key.clone(), file);
        }
        let Some(current) = cache.get_mut(&key) else {
            return Err(DataError::DatasetNotFound(dataset.to_string()));
        };
        let mut draft = current.clone();
        let (out, changed) = f(&mut draft)?;
        if changed {
            let bytes = serde_json::to_vec(&draft)?;
            statestore::write_atomic(&self.label_path(workspace_id, dataset), &bytes)?;
            *current = draft;
        }
        Ok(out)
    }

    /// Uris that a label on `uri` applies to.
    fn label_targets<'a>(&self, elements: &'a [Element], dataset: &str, uri: &str) -> Result<Vec<&'a str>> {
        let el = elements
            .iter()
            .find(|e| e.uri == uri)
            .ok_or_else(|| DataError::UnknownUri {
                dataset: dataset.to_string(),
                uri: uri.to_string(),
            })?;
        if !self.apply_to_duplicates {
            return Ok(vec![el.uri.as_str()]);
        }
        Ok(elements
            .iter()
            .filter(|e| e.text == el.text)
            .map(|e| e.uri.as_str())
            .collect())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl DataAccess for FileDataAccess {
    fn add_elements(&self, dataset: &str, elements: Vec<Element>) -> Result<usize> {
        let mut datasets = self.datasets.write();
        let mut current: Vec<Element> = match datasets.get(dataset) {
            Some(els) => els.as_ref().clone(),
            None => read_json(&self.dataset_path(dataset))?.unwrap_or_default(),
        };
        let mut known: HashSet<String> = current.iter().map(|e| e.uri.clone()).collect();
        let before = current.len();
        for el in elements {
            if known.insert(el.uri.clone()) {
                current.push(el);
            }
        }
        let added = current.len() - before;
        statestore::write_atomic(&self.dataset_path(dataset), &serde_json::to_vec(&current)?)?;
        datasets.insert(dataset.to_string(), Arc::new(current));
        info!(dataset, added, "elements added");
        Ok(added)
    }

    fn get_all_elements(&self, dataset: &str) -> Result<Vec<Element>> {
        Ok(self.elements(dataset)?.as_ref().clone())
    }

    fn get_elements_by_uris(&self, dataset: &str, uris: &[String]) -> Result<Vec<Element>> {
        let elements = self.elements(dataset)?;
        let by_uri: HashMap<&str, &Element> = elements.iter().map(|e| (e.uri.as_str(), e)).collect();
        uris.iter()
            .map(|uri| {
                by_uri.get(uri.as_str()).map(|e| (*e).clone()).ok_or_else(|| DataError::UnknownUri {
                    dataset: dataset.to_string(),
                    uri: uri.clone(),
                })
            })
            .collect()
    }

    fn set_labels(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        labels: &[(String, Label)],
    ) -> Result<usize> {
        let elements = self.elements(dataset)?;
        let mut updates: Vec<(&str, Label)> = Vec::new();
        for (uri, label) in labels {
            for target in self.label_targets(&elements, dataset, uri)? {
                updates.push((target, *label));
            }
        }

        let changed = self.with_labels(workspace_id, dataset, |file| {
            let mut changed: HashSet<&str> = HashSet::new();
            for (uri, label) in &updates {
                let slot = file.entry(uri.to_string()).or_default();
                if slot.insert(category_id, *label) != Some(*label) {
                    changed.insert(*uri);
                }
            }
            Ok((changed.len(), !changed.is_empty()))
        })?;
        debug!(workspace_id, dataset, category_id, requested = labels.len(), changed, "labels set");
        Ok(changed)
    }

    fn unset_labels(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        uris: &[String],
    ) -> Result<usize> {
        let elements = self.elements(dataset)?;
        let mut targets: Vec<&str> = Vec::new();
        for uri in uris {
            targets.extend(self.label_targets(&elements, dataset, uri)?);
        }

        self.with_labels(workspace_id, dataset, |file| {
            let mut removed: HashSet<&str> = HashSet::new();
            for uri in &targets {
                if let Some(slot) = file.get_mut(*uri) {
                    if slot.remove(&category_id).is_some() {
                        removed.insert(*uri);
                    }
                    if slot.is_empty() {
                        file.remove(*uri);
                    }
                }
            }
            Ok((removed.len(), !removed.is_empty()))
        })
    }

    fn get_labeled_elements(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
    ) -> Result<Vec<(Element, Label)>> {
        let elements = self.elements(dataset)?;
        self.with_labels(workspace_id, dataset, |file| {
            let labeled: Vec<(Element, Label)> = elements
                .iter()
                .filter_map(|e| {
                    file.get(&e.uri)
                        .and_then(|slot| slot.get(&category_id))
                        .map(|l| (e.clone(), *l))
                })
                .collect();
            Ok((labeled, false))
        })
    }

    fn get_unlabeled_elements(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        dedup: bool,
    ) -> Result<Vec<Element>> {
        let elements = self.elements(dataset)?;
        self.with_labels(workspace_id, dataset, |file| {
            let mut seen: HashSet<&str> = HashSet::new();
            let unlabeled: Vec<Element> = elements
                .iter()
                .filter(|e| !file.get(&e.uri).is_some_and(|slot| slot.contains_key(&category_id)))
                .filter(|e| !dedup || seen.insert(e.text.as_str()))
                .cloned()
                .collect();
            Ok((unlabeled, false))
        })
    }

    fn get_label_counts(
        &self,
        workspace_id: &str,
        dataset: &str,
        category_id: CategoryId,
        dedup: bool,
    ) -> Result<LabelCounts> {
        let labeled = self.get_labeled_elements(workspace_id, dataset, category_id)?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut counts = LabelCounts::default();
        for (el, label) in &labeled {
            if dedup && !seen.insert(el.text.clone()) {
                continue;
            }
            counts.add(label);
        }
        Ok(counts)
    }

    fn delete_all_labels(&self, workspace_id: &str, dataset: &str) -> Result<()> {
        let mut cache = self.labels.lock();
        cache.remove(&(workspace_id.to_string(), dataset.to_string()));
        match std::fs::remove_file(self.label_path(workspace_id, dataset)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(workspace_id, dataset, "labels deleted");
        Ok(())
    }

    fn delete_labels_for_category(&self, workspace_id: &str, dataset: &str, category_id: CategoryId) -> Result<()> {
        self.with_labels(workspace_id, dataset, |file| {
            let before = file.len();
            let mut touched = false;
            for slot in file.values_mut() {
                touched |= slot.remove(&category_id).is_some();
            }
            file.retain(|_, slot| !slot.is_empty());
            Ok(((), touched || file.len() != before))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(apply_to_duplicates: bool) -> (tempfile::TempDir, FileDataAccess) {
        let dir = tempfile::tempdir().unwrap();
        let data = FileDataAccess::new(dir.path().join("datasets"), dir.path().join("labels"), apply_to_duplicates);
        data.add_elements(
            "ds",
            vec![
                Element::new("u1", "great product"),
                Element::new("u2", "terrible"),
                Element::new("u3", "great product"),
            ],
        )
        .unwrap();
        (dir, data)
    }

    #[test]
    fn labels_propagate_to_duplicate_texts() {
        let (_dir, data) = setup(true);
        let changed = data.set_labels("ws", "ds", 0, &[("u1".into(), Label::positive())]).unwrap();
        assert_eq!(changed, 2);

        // same label again changes nothing
        let changed = data.set_labels("ws", "ds", 0, &[("u3".into(), Label::positive())]).unwrap();
        assert_eq!(changed, 0);

        let counts = data.get_label_counts("ws", "ds", 0, true).unwrap();
        assert_eq!(counts.positive, 1);
        let counts = data.get_label_counts("ws", "ds", 0, false).unwrap();
        assert_eq!(counts.positive, 2);
    }

    #[test]
    fn without_propagation_only_the_uri_is_labeled() {
        let (_dir, data) = setup(false);
        let changed = data.set_labels("ws", "ds", 0, &[("u1".into(), Label::positive())]).unwrap();
        assert_eq!(changed, 1);
        let unlabeled = data.get_unlabeled_elements("ws", "ds", 0, false).unwrap();
        let uris: Vec<_> = unlabeled.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(uris, vec!["u2", "u3"]);
    }

    #[test]
    fn unlabeled_dedup_keeps_first_text() {
        let (_dir, data) = setup(false);
        let unlabeled = data.get_unlabeled_elements("ws", "ds", 0, true).unwrap();
        let uris: Vec<_> = unlabeled.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(uris, vec!["u1", "u2"]);
    }

    #[test]
    fn labels_are_per_category_and_persisted() {
        let (dir, data) = setup(false);
        data.set_labels("ws", "ds", 0, &[("u2".into(), Label::negative())]).unwrap();
        data.set_labels("ws", "ds", 1, &[("u2".into(), Label::positive())]).unwrap();

        let reopened = FileDataAccess::new(dir.path().join("datasets"), dir.path().join("labels"), false);
        let cat0 = reopened.get_labeled_elements("ws", "ds", 0).unwrap();
        assert_eq!(cat0.len(), 1);
        assert_eq!(cat0[0].1, Label::negative());

        reopened.delete_labels_for_category("ws", "ds", 0).unwrap();
        assert!(reopened.get_labeled_elements("ws", "ds", 0).unwrap().is_empty());
        assert_eq!(reopened.get_labeled_elements("ws", "ds", 1).unwrap().len(), 1);

        reopened.delete_all_labels("ws", "ds").unwrap();
        assert!(reopened.get_labeled_elements("ws", "ds", 1).unwrap().is_empty());
    }

    #[test]
    fn unset_reports_removed_labels() {
        let (_dir, data) = setup(true);
        data.set_labels("ws", "ds", 0, &[("u1".into(), Label::positive())]).unwrap();
        assert_eq!(data.unset_labels("ws", "ds", 0, &["u3".into()]).unwrap(), 2);
        assert_eq!(data.unset_labels("ws", "ds", 0, &["u3".into()]).unwrap(), 0);
    }

    #[test]
    fn unknown_dataset_and_uri_are_errors() {
        let (_dir, data) = setup(false);
        assert!(matches!(data.get_all_elements("nope"), Err(DataError::DatasetNotFound(_))));
        let err = data
            .set_labels("ws", "ds", 0, &[("missing".into(), Label::positive())])
            .unwrap_err();
        assert!(matches!(err, DataError::UnknownUri { .. }));
    }

    #[test]
    fn infer_item_carries_metadata() {
        let mut el = Element::new("u", "hello");
        el.metadata.insert("source".into(), "mail".into());
        let item = el.infer_item();
        assert_eq!(item.get(TEXT_KEY).map(String::as_str), Some("hello"));
        assert_eq!(item.get("source").map(String::as_str), Some("mail"));
    }
}
