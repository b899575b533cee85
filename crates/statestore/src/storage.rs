//! Storage trait and implementations
//!
//! A backend holds one opaque record per key. Records are always written
//! whole; there is no append or partial update.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    fn save(&self, key: &str, value: &[u8]) -> io::Result<()>;
    fn delete(&self, key: &str) -> io::Result<bool>;
    fn keys(&self) -> io::Result<Vec<String>>;
}

/// In-memory storage (for testing and demos)
#[derive(Default)]
pub struct InMemoryStorage {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// One `<key>.json` file per record under a root directory.
pub struct FileBackedStorage {
    root: PathBuf,
}

impl FileBackedStorage {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }
}

impl Storage for FileBackedStorage {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, key: &str, value: &[u8]) -> io::Result<()> {
        write_atomic(&self.path_for(key), value)
    }

    fn delete(&self, key: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(decode_key(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

// Keys may contain '/' or other path characters; keep file names flat.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_key(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_is_reversible() {
        for key in ["plain", "with space", "a/b", "ünï", "x%y"] {
            assert_eq!(decode_key(&encode_key(key)), key);
        }
    }

    #[test]
    fn file_storage_roundtrip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileBackedStorage::new(dir.path()).unwrap();

        storage.save("ws one", b"{}").unwrap();
        storage.save("ws/two", b"[]").unwrap();

        assert_eq!(storage.load("ws one").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(storage.load("missing").unwrap(), None);
        assert_eq!(storage.keys().unwrap(), vec!["ws one".to_string(), "ws/two".to_string()]);

        assert!(storage.delete("ws one").unwrap());
        assert!(!storage.delete("ws one").unwrap());
    }
}
