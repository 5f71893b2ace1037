//! Content-addressed cache of transpilation outputs and bundle artifacts
//! (spec.md §4.4). Writes are atomic (temp file + rename, grounded on the
//! same pattern used elsewhere in the pack for index persistence) and
//! concurrent writers for the same key are coalesced onto a single physical
//! write via a per-key lock, matching the design notes' call for "the
//! coalescing map... protected by a per-[key] mutex" in a multi-threaded
//! port of the original's single-threaded event loop.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::error::CacheError;

/// A transpiled module's cached code plus its (optional) source map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub code: String,
    pub map: Option<String>,
}

/// Digest of a module's raw source combined with the transpiler option
/// fingerprint (spec.md §4.4: "`sourceHash` is the digest of the raw source
/// combined with the transpiler option fingerprint").
pub fn source_hash(raw_source: &str, transpiler_fingerprint: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(raw_source.as_bytes());
    hasher.update(b"\0");
    hasher.update(transpiler_fingerprint.as_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    id: String,
    source_hash: String,
}

pub struct Cache {
    dest: PathBuf,
    /// One lock per in-flight (or most-recently-computed) key: concurrent
    /// `get_or_compute` callers for the same key block on the same `Mutex`
    /// rather than racing to write the same file.
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl Cache {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            locks: DashMap::new(),
        }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn paths_for(&self, key: &CacheKey) -> (PathBuf, PathBuf) {
        let digest = blake3::hash(format!("{}\0{}", key.id, key.source_hash).as_bytes());
        let hex = digest.to_hex();
        let dir = self.dest.join("cache").join(&hex[..2]);
        (dir.join(format!("{hex}.code")), dir.join(format!("{hex}.map")))
    }

    /// `Cache.read(id, sourceHash)`.
    pub fn read(&self, id: &str, source_hash: &str) -> Option<CacheEntry> {
        let key = CacheKey {
            id: id.to_string(),
            source_hash: source_hash.to_string(),
        };
        let (code_path, map_path) = self.paths_for(&key);
        let code = fs::read_to_string(&code_path).ok()?;
        let map = fs::read_to_string(&map_path).ok();
        Some(CacheEntry { code, map })
    }

    /// `Cache.write(id, sourceHash, code, map)`. Atomic: temp file + rename.
    pub fn write(
        &self,
        id: &str,
        source_hash: &str,
        code: &str,
        map: Option<&str>,
    ) -> Result<(), CacheError> {
        let key = CacheKey {
            id: id.to_string(),
            source_hash: source_hash.to_string(),
        };
        let (code_path, map_path) = self.paths_for(&key);
        atomic_write(&code_path, code.as_bytes())?;
        if let Some(map) = map {
            atomic_write(&map_path, map.as_bytes())?;
        }
        Ok(())
    }

    /// Reads the entry for `(id, source_hash)` if present, otherwise calls
    /// `compute` and stores its result. Concurrent callers for the same key
    /// coalesce onto a single `compute` invocation: the first caller holds
    /// the per-key lock while it transpiles and writes; later callers block
    /// on the same lock and then see the now-populated cache entry.
    pub fn get_or_compute<F>(
        &self,
        id: &str,
        source_hash: &str,
        compute: F,
    ) -> Result<CacheEntry, CacheError>
    where
        F: FnOnce() -> Result<CacheEntry, CacheError>,
    {
        let key = CacheKey {
            id: id.to_string(),
            source_hash: source_hash.to_string(),
        };
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().unwrap();

        if let Some(entry) = self.read(id, source_hash) {
            return Ok(entry);
        }
        let entry = compute()?;
        self.write(id, source_hash, &entry.code, entry.map.as_deref())?;
        Ok(entry)
    }

    /// Raw write under the destination root (`Cache.writeFile`).
    pub fn write_file(&self, rel_path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        atomic_write(&self.dest.join(rel_path), bytes)
    }

    pub fn read_file(&self, rel_path: &Path) -> Option<Vec<u8>> {
        fs::read(self.dest.join(rel_path)).ok()
    }

    /// Clears the destination except for the keep-set (relative paths,
    /// matched by prefix so a packet directory like `yen/1.2.4` can be kept
    /// as a whole).
    pub fn remove_all(&self, keep: &[String]) -> Result<(), CacheError> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        if !self.dest.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.dest).map_err(|source| CacheError::Io {
            path: self.dest.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| CacheError::Io {
                path: self.dest.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if keep.iter().any(|k| name_str.starts_with(k)) {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|source| CacheError::Io { path, source })?;
        }
        Ok(())
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CacheError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(&tmp, bytes).map_err(|source| CacheError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn round_trips_code_and_map() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path());
        cache
            .write("home.js", "hash1", "code", Some("map"))
            .unwrap();
        let entry = cache.read("home.js", "hash1").unwrap();
        assert_eq!(entry.code, "code");
        assert_eq!(entry.map.as_deref(), Some("map"));
    }

    #[test]
    fn miss_returns_none() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path());
        assert!(cache.read("missing.js", "h").is_none());
    }

    #[test]
    fn get_or_compute_runs_once_per_key() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(Cache::new(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                thread::spawn(move || {
                    cache
                        .get_or_compute("a.js", "h", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok(CacheEntry {
                                code: "computed".into(),
                                map: None,
                            })
                        })
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            let entry = h.join().unwrap();
            assert_eq!(entry.code, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_all_keeps_named_prefixes() {
        let dir = tempdir().unwrap();
        let cache = Cache::new(dir.path());
        fs::create_dir_all(dir.path().join("yen/1.2.4")).unwrap();
        fs::write(dir.path().join("yen/1.2.4/index.js"), "x").unwrap();
        fs::write(dir.path().join("home.js"), "x").unwrap();
        cache.remove_all(&["yen".to_string()]).unwrap();
        assert!(dir.path().join("yen/1.2.4/index.js").exists());
        assert!(!dir.path().join("home.js").exists());
    }
}
