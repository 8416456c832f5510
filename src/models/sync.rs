//! Model sync: reconciles the router's model catalog against what's on
//! disk locally, downloading what's missing and reporting (never
//! deleting, unless explicitly enabled) what's stale. Generalizes the
//! original sync implementation's catalog-diff and ETag-cache logic; the
//! per-file manifest download with priority grouping lives in the
//! downloader instead of here.

use crate::config::{DownloadConfig, NodeConfig};
use crate::download::ModelDownloader;
use crate::models::storage::ModelStorage;
use fs2::FileExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub state: Option<SyncState>,
    pub last_to_download: Vec<String>,
    pub last_to_delete: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub to_download: Vec<String>,
    pub to_delete: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteModelRaw {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    chat_template: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Clone)]
struct RemoteModel {
    id: String,
    path: Option<String>,
    download_url: Option<String>,
    chat_template: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogEnvelope {
    Array(Vec<RemoteModelRaw>),
    Object { data: Vec<RemoteModelRaw> },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct EtagEntry {
    etag: Option<String>,
    size: Option<u64>,
}

/// Keeps track of model sync state against the router's catalog.
pub struct ModelSync {
    base_url: String,
    models_dir: PathBuf,
    http: Client,
    node_token: Mutex<Option<String>>,
    etag_cache: Mutex<HashMap<String, EtagEntry>>,
    status: Mutex<SyncStatus>,
    downloader: ModelDownloader,
}

impl ModelSync {
    pub fn new(base_url: impl Into<String>, models_dir: impl Into<PathBuf>) -> Self {
        Self::with_download_config(base_url, models_dir, DownloadConfig::default())
    }

    pub fn with_download_config(
        base_url: impl Into<String>,
        models_dir: impl Into<PathBuf>,
        download_config: DownloadConfig,
    ) -> Self {
        let base_url = base_url.into();
        let models_dir = models_dir.into();
        let downloader = ModelDownloader::new(models_dir.clone(), Some(base_url.clone()), download_config);
        let sync = Self {
            base_url,
            models_dir,
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            node_token: Mutex::new(None),
            etag_cache: Mutex::new(HashMap::new()),
            status: Mutex::new(SyncStatus::default()),
            downloader,
        };
        sync.load_etag_cache();
        sync
    }

    pub fn set_node_token(&self, token: String) {
        *self.node_token.lock().unwrap() = Some(token);
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().unwrap().clone()
    }

    fn cache_path(&self) -> PathBuf {
        self.models_dir.join(".etag_cache.json")
    }

    fn load_etag_cache(&self) {
        let path = self.cache_path();
        let Ok(file) = std::fs::File::open(&path) else {
            return;
        };
        if file.try_lock_shared().is_err() {
            return;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return;
        };
        let _ = file.unlock();
        if let Ok(parsed) = serde_json::from_str::<HashMap<String, EtagEntry>>(&raw) {
            *self.etag_cache.lock().unwrap() = parsed;
        }
    }

    /// Persists the ETag/size cache. Tries an advisory exclusive file
    /// lock first; if that's unavailable (e.g. an NFS mount that doesn't
    /// honour `flock`), falls back to a lock directory, mirroring the
    /// portability fallback a prior sync implementation needed.
    fn persist_etag_cache(&self) {
        let cache_path = self.cache_path();
        let temp_path = cache_path.with_extension("json.tmp");
        let body = serde_json::to_string(&*self.etag_cache.lock().unwrap()).unwrap_or_default();

        let write_and_rename = || -> std::io::Result<()> {
            std::fs::write(&temp_path, &body)?;
            std::fs::rename(&temp_path, &cache_path)
        };

        if let Ok(lock_file) = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&cache_path)
        {
            if lock_file.try_lock_exclusive().is_ok() {
                let _ = write_and_rename();
                let _ = lock_file.unlock();
                return;
            }
        }

        let lock_dir = self.models_dir.join(".etag_cache.lock");
        if std::fs::create_dir(&lock_dir).is_ok() {
            let _ = write_and_rename();
            let _ = std::fs::remove_dir(&lock_dir);
        }
    }

    async fn fetch_remote_models(&self) -> Vec<RemoteModel> {
        let url = format!("{}/v0/models", self.base_url.trim_end_matches('/'));
        let mut request = self.http.get(&url);
        if let Some(token) = self.node_token.lock().unwrap().clone() {
            request = request.header("X-Node-Token", token);
        }
        let Ok(response) = request.send().await else {
            return Vec::new();
        };
        if !response.status().is_success() {
            return Vec::new();
        }
        let Ok(envelope) = response.json::<CatalogEnvelope>().await else {
            return Vec::new();
        };
        let raws = match envelope {
            CatalogEnvelope::Array(v) => v,
            CatalogEnvelope::Object { data } => data,
        };

        let mut out = Vec::new();
        let mut cache = self.etag_cache.lock().unwrap();
        for raw in raws {
            let Some(id) = raw.name.or(raw.id) else {
                continue;
            };
            if raw.etag.is_some() || raw.size.is_some() {
                let entry = cache.entry(id.clone()).or_default();
                if raw.etag.is_some() {
                    entry.etag = raw.etag.clone();
                }
                if raw.size.is_some() {
                    entry.size = raw.size;
                }
            }
            out.push(RemoteModel {
                id,
                path: raw.path,
                download_url: raw.download_url,
                chat_template: raw.chat_template,
            });
        }
        out
    }

    fn list_local_models(&self) -> Vec<String> {
        ModelStorage::new(&self.models_dir)
            .list_available_descriptors()
            .into_iter()
            .map(|d| ModelStorage::model_name_to_dir(&d.name))
            .collect()
    }

    fn write_chat_template(&self, model_id: &str, chat_template: &str) {
        let dir = self.models_dir.join(ModelStorage::model_name_to_dir(model_id));
        let _ = std::fs::create_dir_all(&dir);
        let meta = serde_json::json!({ "chat_template": chat_template });
        let _ = std::fs::write(dir.join("metadata.json"), meta.to_string());
    }

    /// Fetches a per-model manifest from the registry and downloads every
    /// file in it; falls back to a single-blob fetch when the model only
    /// carries a direct `download_url` and no manifest exists.
    async fn download_model(&self, model: &RemoteModel) {
        if let Some(manifest) = self.downloader.fetch_manifest(&model.id).await {
            if let Err(e) = self.downloader.download_manifest(&model.id, &manifest, None).await {
                warn!("manifest download failed for {}: {e}", model.id);
            }
            return;
        }
        let Some(url) = &model.download_url else {
            warn!("no manifest or download_url for model {}, skipping", model.id);
            return;
        };
        let file_name = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("model.bin");
        let relative_name = format!("{}/{file_name}", model.id);
        if let Err(e) = self.downloader.download_blob(url, &relative_name, None, None, None).await {
            warn!("blob download failed for {}: {e}", model.id);
        }
    }

    /// Reconciles remote and local catalogs, downloading each model
    /// missing locally (manifest-driven, falling back to a direct blob
    /// fetch) before returning. Never deletes by itself: `to_delete` is
    /// only ever acted on by a caller that opts into
    /// `apply_deletions` via `sync_delete_stale`.
    pub async fn sync(&self) -> SyncResult {
        {
            let mut status = self.status.lock().unwrap();
            status.state = Some(SyncState::Running);
        }

        let remote = self.fetch_remote_models().await;
        let local = self.list_local_models();
        self.persist_etag_cache();

        let remote_ids: HashSet<String> = remote.iter().map(|r| r.id.clone()).collect();
        let local_set: HashSet<String> = local.iter().cloned().collect();

        let mut result = SyncResult::default();
        for model in &remote {
            if local_set.contains(&model.id) {
                continue;
            }
            let mut reachable = false;
            if let Some(path) = &model.path {
                if Path::new(path).is_file() {
                    reachable = true;
                }
            }
            if reachable {
                if let Some(chat_template) = &model.chat_template {
                    self.write_chat_template(&model.id, chat_template);
                }
                continue;
            }
            self.download_model(model).await;
            if let Some(chat_template) = &model.chat_template {
                self.write_chat_template(&model.id, chat_template);
            }
            result.to_download.push(model.id.clone());
        }
        for id in &local {
            if !remote_ids.contains(id) {
                result.to_delete.push(id.clone());
            }
        }

        let mut status = self.status.lock().unwrap();
        status.state = Some(SyncState::Success);
        status.last_to_download = result.to_download.clone();
        status.last_to_delete = result.to_delete.clone();

        result
    }

    /// Removes every directory named in `to_delete` from the local models
    /// directory. Only ever called when `NodeConfig::sync_delete_stale`
    /// is set; `sync` itself never deletes anything.
    pub fn apply_deletions(&self, config: &NodeConfig, to_delete: &[String]) -> std::io::Result<()> {
        if !config.sync_delete_stale {
            return Ok(());
        }
        let storage = ModelStorage::new(&self.models_dir);
        for id in to_delete {
            storage.delete_model(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_envelope_parses_bare_array() {
        let raw = r#"[{"name":"qwen","path":"/models/qwen/model.gguf"}]"#;
        let parsed: CatalogEnvelope = serde_json::from_str(raw).unwrap();
        match parsed {
            CatalogEnvelope::Array(v) => assert_eq!(v.len(), 1),
            _ => panic!("expected array variant"),
        }
    }

    #[test]
    fn catalog_envelope_parses_data_wrapper() {
        let raw = r#"{"data":[{"id":"qwen"}]}"#;
        let parsed: CatalogEnvelope = serde_json::from_str(raw).unwrap();
        match parsed {
            CatalogEnvelope::Object { data } => assert_eq!(data[0].id.as_deref(), Some("qwen")),
            _ => panic!("expected object variant"),
        }
    }

    #[tokio::test]
    async fn sync_reports_to_delete_for_orphaned_local_model() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("orphan");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model.gguf"), b"bytes").unwrap();

        let sync = ModelSync::new("http://127.0.0.1:0", dir.path());
        // No router reachable: fetch_remote_models returns empty, so every
        // local model is reported as stale.
        let result = sync.sync().await;
        assert_eq!(result.to_delete, vec!["orphan".to_string()]);
    }

    #[test]
    fn apply_deletions_is_noop_unless_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("keep");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model.gguf"), b"bytes").unwrap();

        let sync = ModelSync::new("http://127.0.0.1:0", dir.path());
        let mut config = NodeConfig::default();
        config.sync_delete_stale = false;
        sync.apply_deletions(&config, &["keep".to_string()]).unwrap();
        assert!(model_dir.exists());

        config.sync_delete_stale = true;
        sync.apply_deletions(&config, &["keep".to_string()]).unwrap();
        assert!(!model_dir.exists());
    }
}
