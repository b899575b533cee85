//! Two-tier inference cache.
//!
//! L1: in-process bounded LRU (moka) keyed by `(model_id, fingerprint)`.
//! L2: one JSON file per model mapping fingerprint to prediction, loaded
//! lazily on the first L1 miss for that model and rewritten in full after
//! every computation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{item_fingerprint, InferItem, Prediction};

type DiskStore = BTreeMap<String, Prediction>;

pub struct InferenceCache {
    memory: Cache<(String, String), Prediction>,
    dir: Option<PathBuf>,
    loaded: Mutex<HashSet<String>>,
    model_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InferenceCache {
    /// `dir = None` keeps the cache in memory only.
    pub fn new(capacity: u64, dir: Option<PathBuf>) -> Self {
        let memory = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .support_invalidation_closures()
            .build();
        Self {
            memory,
            dir,
            loaded: Mutex::new(HashSet::new()),
            model_locks: Mutex::new(HashMap::new()),
        }
    }

    fn model_lock(&self, model_id: &str) -> Arc<Mutex<()>> {
        self.model_locks
            .lock()
            .entry(model_id.to_string())
            .or_default()
            .clone()
    }

    fn disk_path(&self, model_id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{model_id}.json")))
    }

    /// Predictions for `items`, in order, computing only what neither tier
    /// holds. Identical items in one call are computed once.
    ///
    /// One lock per model spans lookup through population, so the same
    /// batch is never computed twice; overlapping batches for the same
    /// model simply queue.
    pub fn get_or_compute<F>(&self, model_id: &str, items: &[InferItem], compute: F) -> anyhow::Result<Vec<Prediction>>
    where
        F: FnOnce(&[InferItem]) -> anyhow::Result<Vec<Prediction>>,
    {
        let lock = self.model_lock(model_id);
        let _guard = lock.lock();

        let fingerprints: Vec<String> = items.iter().map(item_fingerprint).collect();

        let mut found: HashMap<&str, Prediction> = HashMap::new();
        let mut missing: Vec<usize> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, fp) in fingerprints.iter().enumerate() {
            if !seen.insert(fp.as_str()) {
                continue;
            }
            match self.memory.get(&(model_id.to_string(), fp.clone())) {
                Some(p) => {
                    found.insert(fp.as_str(), p);
                }
                None => missing.push(i),
            }
        }

        if !missing.is_empty() && !self.loaded.lock().contains(model_id) {
            let disk = self.read_disk(model_id)?;
            self.loaded.lock().insert(model_id.to_string());
            for (fp, p) in &disk {
                self.memory.insert((model_id.to_string(), fp.clone()), p.clone());
            }
            missing.retain(|&i| {
                let fp = fingerprints[i].as_str();
                match disk.get(fp) {
                    Some(p) => {
                        found.insert(fp, p.clone());
                        false
                    }
                    None => true,
                }
            });
            debug!(model_id, restored = disk.len(), "merged disk cache");
        }

        if !missing.is_empty() {
            let to_compute: Vec<InferItem> = missing.iter().map(|&i| items[i].clone()).collect();
            let computed = compute(&to_compute)?;
            if computed.len() != to_compute.len() {
                bail!(
                    "model {model_id} returned {} predictions for {} items",
                    computed.len(),
                    to_compute.len()
                );
            }

            let mut new_entries = DiskStore::new();
            for (&i, p) in missing.iter().zip(computed) {
                let fp = fingerprints[i].as_str();
                self.memory.insert((model_id.to_string(), fp.to_string()), p.clone());
                new_entries.insert(fp.to_string(), p.clone());
                found.insert(fp, p);
            }
            self.write_disk(model_id, new_entries)?;
            debug!(model_id, computed = missing.len(), total = items.len(), "inference cache filled");
        }

        fingerprints
            .iter()
            .map(|fp| {
                found
                    .get(fp.as_str())
                    .cloned()
                    .with_context(|| format!("missing prediction for fingerprint {fp}"))
            })
            .collect()
    }

    fn read_disk(&self, model_id: &str) -> anyhow::Result<DiskStore> {
        let Some(path) = self.disk_path(model_id) else {
            return Ok(DiskStore::new());
        };
        read_store(&path)
    }

    fn write_disk(&self, model_id: &str, new_entries: DiskStore) -> anyhow::Result<()> {
        let Some(path) = self.disk_path(model_id) else {
            return Ok(());
        };
        let mut store = read_store(&path)?;
        store.extend(new_entries);
        let bytes = serde_json::to_vec(&store)?;
        statestore::write_atomic(&path, &bytes)
            .with_context(|| format!("writing prediction cache {}", path.display()))
    }

    /// Drop everything cached for a model, on disk and in memory.
    pub fn forget_model(&self, model_id: &str) -> anyhow::Result<()> {
        let lock = self.model_lock(model_id);
        let _guard = lock.lock();

        let id = model_id.to_string();
        if let Err(e) = self.memory.invalidate_entries_if(move |k, _| k.0 == id) {
            warn!(model_id, "could not invalidate memory cache: {e}");
        }
        self.loaded.lock().remove(model_id);
        if let Some(path) = self.disk_path(model_id) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
            }
        }
        self.model_locks.lock().remove(model_id);
        Ok(())
    }
}

fn read_store(path: &Path) -> anyhow::Result<DiskStore> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DiskStore::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    match serde_json::from_slice(&bytes) {
        Ok(store) => Ok(store),
        Err(e) => {
            // a broken cache file only costs recomputation
            warn!(path = %path.display(), "discarding unreadable prediction cache: {e}");
            Ok(DiskStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text_item;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn predict(items: &[InferItem]) -> Vec<Prediction> {
        items
            .iter()
            .map(|it| {
                let pos = it.get("text").map(|t| t.contains("good")).unwrap_or(false);
                Prediction {
                    label: pos,
                    score: if pos { 0.9 } else { 0.1 },
                }
            })
            .collect()
    }

    #[test]
    fn duplicates_in_one_call_are_computed_once() {
        let cache = InferenceCache::new(100, None);
        let items = vec![text_item("good"), text_item("bad"), text_item("good")];
        let calls = AtomicUsize::new(0);
        let preds = cache
            .get_or_compute("m", &items, |batch| {
                calls.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(predict(batch))
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(preds.len(), 3);
        assert_eq!(preds[0], preds[2]);
        assert!(!preds[1].label);
    }

    #[test]
    fn second_call_is_served_from_memory() {
        let cache = InferenceCache::new(100, None);
        let items = vec![text_item("good one"), text_item("meh")];
        let calls = AtomicUsize::new(0);
        let run = || {
            cache
                .get_or_compute("m", &items, |batch| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(predict(batch))
                })
                .unwrap()
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disk_tier_survives_a_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let items = vec![text_item("good"), text_item("bad")];
        {
            let cache = InferenceCache::new(100, Some(dir.path().to_path_buf()));
            cache.get_or_compute("m", &items, |b| Ok(predict(b))).unwrap();
        }
        let cache = InferenceCache::new(100, Some(dir.path().to_path_buf()));
        let preds = cache
            .get_or_compute("m", &items, |_| -> anyhow::Result<Vec<Prediction>> {
                panic!("should have been cached on disk")
            })
            .unwrap();
        assert!(preds[0].label);
    }

    #[test]
    fn compute_failure_propagates_and_caches_nothing() {
        let cache = InferenceCache::new(100, None);
        let items = vec![text_item("x")];
        let err = cache
            .get_or_compute("m", &items, |_| anyhow::bail!("model exploded"))
            .unwrap_err();
        assert!(err.to_string().contains("exploded"));
        let preds = cache.get_or_compute("m", &items, |b| Ok(predict(b))).unwrap();
        assert_eq!(preds.len(), 1);
    }

    #[test]
    fn forget_model_removes_disk_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InferenceCache::new(100, Some(dir.path().to_path_buf()));
        cache.get_or_compute("m", &[text_item("a")], |b| Ok(predict(b))).unwrap();
        assert!(dir.path().join("m.json").exists());
        cache.forget_model("m").unwrap();
        assert!(!dir.path().join("m.json").exists());
        assert!(!cache.model_locks.lock().contains_key("m"));
    }

    #[test]
    fn least_recently_touched_entry_is_evicted() {
        let cache = InferenceCache::new(2, None);
        let calls = AtomicUsize::new(0);
        let touch = |text: &str| {
            cache
                .get_or_compute("m", &[text_item(text)], |b| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(predict(b))
                })
                .unwrap();
            cache.memory.run_pending_tasks();
        };

        touch("a");
        touch("b");
        touch("a");
        touch("c");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.memory.entry_count(), 2);

        // the entry just set and the one touched before it both stay
        touch("c");
        touch("a");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        touch("b");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn disk_tier_is_retried_after_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InferenceCache::new(100, Some(dir.path().to_path_buf()));
        let path = dir.path().join("m.json");
        // a directory in place of the file makes the read fail
        std::fs::create_dir(&path).unwrap();
        assert!(cache.get_or_compute("m", &[text_item("good")], |b| Ok(predict(b))).is_err());

        std::fs::remove_dir(&path).unwrap();
        let mut disk = DiskStore::new();
        disk.insert(
            item_fingerprint(&text_item("good")),
            Prediction {
                label: false,
                score: 0.42,
            },
        );
        std::fs::write(&path, serde_json::to_vec(&disk).unwrap()).unwrap();

        let preds = cache
            .get_or_compute("m", &[text_item("good")], |_| -> anyhow::Result<Vec<Prediction>> {
                panic!("should have been read from disk")
            })
            .unwrap();
        assert_eq!(preds[0].score, 0.42);
    }
}
