//! Engine manager: cross-model bookkeeping layered on top of whatever
//! `Engine` a request resolves to — last-access tracking, refcounts, a
//! count/memory cap with LRU eviction, and an idle sweeper. Keyed by
//! canonical absolute path so the same file loaded through two different
//! descriptors is still recognised as one loaded model.

use crate::engine::interface::Engine;
use crate::models::descriptor::ModelDescriptor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    AlreadyLoaded,
    Loaded,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("path '{0}' is not under the models root")]
    OutsideModelsRoot(PathBuf),
    #[error("no loaded model could be evicted to satisfy limits")]
    NothingEvictable,
    #[error("engine load failed: {0}")]
    EngineLoad(#[from] crate::engine::interface::EngineError),
}

struct LoadedModel {
    descriptor: ModelDescriptor,
    engine: Arc<dyn Engine>,
    vram_bytes: u64,
    last_access: Mutex<Instant>,
    refcount: AtomicI64,
}

impl LoadedModel {
    fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }
}

pub struct EngineManager {
    models_root: PathBuf,
    max_loaded_models: usize,
    max_memory_bytes: u64,
    idle_timeout: Duration,
    loaded: Mutex<HashMap<PathBuf, LoadedModel>>,
}

impl EngineManager {
    pub fn new(models_root: impl Into<PathBuf>, max_loaded_models: usize, max_memory_bytes: u64, idle_timeout: Duration) -> Self {
        Self {
            models_root: models_root.into(),
            max_loaded_models,
            max_memory_bytes,
            idle_timeout,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    fn canonical(path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn total_memory_locked(loaded: &HashMap<PathBuf, LoadedModel>) -> u64 {
        loaded.values().map(|m| m.vram_bytes).sum()
    }

    fn least_recently_used_locked(loaded: &HashMap<PathBuf, LoadedModel>) -> Option<PathBuf> {
        loaded
            .iter()
            .filter(|(_, m)| m.refcount.load(Ordering::SeqCst) == 0)
            .min_by_key(|(_, m)| *m.last_access.lock().unwrap())
            .map(|(path, _)| path.clone())
    }

    pub fn least_recently_used(&self) -> Option<PathBuf> {
        Self::least_recently_used_locked(&self.loaded.lock().unwrap())
    }

    /// Evicts LRU entries with zero refcount until the configured count
    /// and memory caps are both satisfied. Engine calls happen with the
    /// lock released: the handle is copied out, the lock dropped, then
    /// `unload_model` is invoked.
    fn evict_to_fit(&self) -> Result<(), LoadError> {
        loop {
            let victim = {
                let loaded = self.loaded.lock().unwrap();
                let over_count = self.max_loaded_models != 0 && loaded.len() > self.max_loaded_models;
                let over_memory = self.max_memory_bytes != 0 && Self::total_memory_locked(&loaded) > self.max_memory_bytes;
                if !over_count && !over_memory {
                    return Ok(());
                }
                match Self::least_recently_used_locked(&loaded) {
                    Some(path) => path,
                    None => return Err(LoadError::NothingEvictable),
                }
            };
            self.unload(&victim);
        }
    }

    /// Evicts exactly one LRU, zero-refcount model. Used both for the
    /// manager's own OOM-retry-once path and by the resource monitor's
    /// watermark-triggered pressure relief.
    pub fn evict_one(&self) -> bool {
        let victim = self.least_recently_used();
        match victim {
            Some(path) => {
                self.unload(&path);
                true
            }
            None => false,
        }
    }

    /// Loads `descriptor` through `engine` if not already loaded,
    /// evicting LRU entries first if limits require it, and retrying once
    /// on `OOM_VRAM`.
    pub fn load_if_needed(&self, descriptor: &ModelDescriptor, engine: Arc<dyn Engine>) -> Result<LoadOutcome, LoadError> {
        let key = Self::canonical(&descriptor.primary_path);
        if !key.starts_with(&self.models_root) {
            return Err(LoadError::OutsideModelsRoot(key));
        }

        {
            let loaded = self.loaded.lock().unwrap();
            if let Some(record) = loaded.get(&key) {
                record.touch();
                return Ok(LoadOutcome::AlreadyLoaded);
            }
        }

        self.evict_to_fit()?;

        match engine.load_model(descriptor) {
            Ok(result) => {
                self.insert_record(key, descriptor.clone(), engine, result.vram_bytes);
                Ok(LoadOutcome::Loaded)
            }
            Err(e) if e.kind.is_recoverable_by_eviction() => {
                if !self.evict_one() {
                    return Err(LoadError::EngineLoad(e));
                }
                let result = engine.load_model(descriptor)?;
                self.insert_record(key, descriptor.clone(), engine, result.vram_bytes);
                Ok(LoadOutcome::Loaded)
            }
            Err(e) => Err(LoadError::EngineLoad(e)),
        }
    }

    fn insert_record(&self, key: PathBuf, descriptor: ModelDescriptor, engine: Arc<dyn Engine>, vram_bytes: u64) {
        let mut loaded = self.loaded.lock().unwrap();
        loaded.insert(
            key,
            LoadedModel {
                descriptor,
                engine,
                vram_bytes,
                last_access: Mutex::new(Instant::now()),
                refcount: AtomicI64::new(0),
            },
        );
    }

    pub fn touch(&self, path: &Path) {
        let key = Self::canonical(path);
        if let Some(record) = self.loaded.lock().unwrap().get(&key) {
            record.touch();
        }
    }

    pub fn begin_request(&self, path: &Path) -> Option<RequestGuard<'_>> {
        let key = Self::canonical(path);
        let loaded = self.loaded.lock().unwrap();
        let record = loaded.get(&key)?;
        record.refcount.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            manager: self,
            key,
        })
    }

    pub fn unload(&self, path: &Path) -> bool {
        let key = Self::canonical(path);
        let removed = self.loaded.lock().unwrap().remove(&key);
        match removed {
            Some(record) => {
                record.engine.unload_model(&record.descriptor);
                true
            }
            None => false,
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().unwrap().len()
    }

    /// Unloads every record whose refcount is zero and whose last access
    /// predates the idle timeout. Intended to be called on a fixed
    /// interval from a background sweeper.
    pub fn sweep_idle(&self) {
        let stale: Vec<PathBuf> = {
            let loaded = self.loaded.lock().unwrap();
            loaded
                .iter()
                .filter(|(_, m)| m.refcount.load(Ordering::SeqCst) == 0 && m.idle_for() >= self.idle_timeout)
                .map(|(path, _)| path.clone())
                .collect()
        };
        for path in stale {
            self.unload(&path);
        }
    }

    /// Unloads every currently loaded model, used during graceful shutdown.
    pub fn unload_all(&self) {
        let keys: Vec<PathBuf> = self.loaded.lock().unwrap().keys().cloned().collect();
        for key in keys {
            self.unload(&key);
        }
    }
}

/// RAII guard for an in-flight request against a specific loaded model.
/// Decrements the refcount on drop so `unload`/eviction can observe
/// refcount 0 even if the request path panics.
pub struct RequestGuard<'a> {
    manager: &'a EngineManager,
    key: PathBuf,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.manager.loaded.lock().unwrap().get(&self.key) {
            record.refcount.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::interface::{EngineResult, GenerationParams, LoadResult};

    struct StubEngine {
        vram_bytes: u64,
    }

    impl Engine for StubEngine {
        fn runtime(&self) -> &str {
            "fake"
        }
        fn load_model(&self, _: &ModelDescriptor) -> EngineResult<LoadResult> {
            Ok(LoadResult {
                vram_bytes: self.vram_bytes,
                max_context: 4096,
            })
        }
        fn unload_model(&self, _: &ModelDescriptor) {}
        fn generate_chat(&self, _: &[(String, String)], _: &ModelDescriptor, _: &GenerationParams) -> EngineResult<String> {
            Ok(String::new())
        }
        fn generate_completion(&self, _: &str, _: &ModelDescriptor, _: &GenerationParams) -> EngineResult<String> {
            Ok(String::new())
        }
        fn generate_chat_stream(
            &self,
            _: &[(String, String)],
            _: &ModelDescriptor,
            _: &GenerationParams,
            _: &mut dyn FnMut(&str),
        ) -> EngineResult<()> {
            Ok(())
        }
        fn generate_embeddings(&self, _: &[String], _: &ModelDescriptor) -> EngineResult<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
        fn get_model_max_context(&self, _: &ModelDescriptor) -> u32 {
            4096
        }
    }

    fn descriptor(root: &Path, name: &str) -> ModelDescriptor {
        let model_dir = root.join(name);
        std::fs::create_dir_all(&model_dir).unwrap();
        let primary_path = model_dir.join("model.gguf");
        std::fs::write(&primary_path, b"x").unwrap();
        ModelDescriptor {
            name: name.into(),
            runtime: "fake".into(),
            format: "gguf".into(),
            primary_path,
            model_dir,
            metadata: None,
        }
    }

    #[test]
    fn loading_twice_reports_already_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let manager = EngineManager::new(&root, 0, 0, Duration::from_secs(1800));
        let engine: Arc<dyn Engine> = Arc::new(StubEngine { vram_bytes: 10 });
        let d = descriptor(&root, "m1");

        assert_eq!(manager.load_if_needed(&d, engine.clone()).unwrap(), LoadOutcome::Loaded);
        assert_eq!(manager.load_if_needed(&d, engine).unwrap(), LoadOutcome::AlreadyLoaded);
        assert_eq!(manager.loaded_count(), 1);
    }

    #[test]
    fn count_limit_evicts_lru_before_loading_new_model() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let manager = EngineManager::new(&root, 1, 0, Duration::from_secs(1800));
        let engine: Arc<dyn Engine> = Arc::new(StubEngine { vram_bytes: 10 });

        let d1 = descriptor(&root, "m1");
        let d2 = descriptor(&root, "m2");
        manager.load_if_needed(&d1, engine.clone()).unwrap();
        manager.load_if_needed(&d2, engine).unwrap();

        assert_eq!(manager.loaded_count(), 1);
        assert!(manager.least_recently_used().unwrap().ends_with("model.gguf"));
    }

    #[test]
    fn refcounted_model_is_not_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let manager = EngineManager::new(&root, 1, 0, Duration::from_secs(1800));
        let engine: Arc<dyn Engine> = Arc::new(StubEngine { vram_bytes: 10 });

        let d1 = descriptor(&root, "m1");
        let d2 = descriptor(&root, "m2");
        manager.load_if_needed(&d1, engine.clone()).unwrap();
        let guard = manager.begin_request(&d1.primary_path).unwrap();

        // m1 has refcount 1, so it is not evictable; d2 load fails.
        assert!(manager.load_if_needed(&d2, engine).is_err());
        drop(guard);
    }

    #[test]
    fn rejects_path_outside_models_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let manager = EngineManager::new(&root, 0, 0, Duration::from_secs(1800));
        let engine: Arc<dyn Engine> = Arc::new(StubEngine { vram_bytes: 10 });
        let outside = ModelDescriptor {
            name: "m".into(),
            runtime: "fake".into(),
            format: "gguf".into(),
            primary_path: PathBuf::from("/etc/passwd"),
            model_dir: PathBuf::from("/etc"),
            metadata: None,
        };
        assert!(matches!(
            manager.load_if_needed(&outside, engine),
            Err(LoadError::OutsideModelsRoot(_))
        ));
    }
}
