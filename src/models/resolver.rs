//! Model resolver: finds a model by name across three tiers — local
//! models directory, a shared read-only directory (referenced directly,
//! never copied), and finally the router's blob endpoint. Generalizes
//! the original resolver's local/shared/router tiers, filling in the
//! router blob GET that tier left as a stub.

use crate::models::storage::ModelStorage;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("model '{0}' not found in local, shared, or router")]
    NotFound(String),
    #[error("router request failed: {0}")]
    RouterRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedFrom {
    Local,
    Shared,
    Router,
}

#[derive(Debug, Clone)]
pub struct ResolveResult {
    pub path: PathBuf,
    pub from: ResolvedFrom,
}

pub struct ModelResolver {
    local_dir: PathBuf,
    shared_dir: Option<PathBuf>,
    router_url: Option<String>,
    router_api_key: Option<String>,
    http: Client,
}

fn find_gguf(dir: &Path, model_name: &str) -> Option<PathBuf> {
    let candidate = dir.join(ModelStorage::model_name_to_dir(model_name)).join("model.gguf");
    candidate.is_file().then_some(candidate)
}

impl ModelResolver {
    pub fn new(
        local_dir: impl Into<PathBuf>,
        shared_dir: Option<PathBuf>,
        router_url: Option<String>,
        router_api_key: Option<String>,
    ) -> Self {
        Self {
            local_dir: local_dir.into(),
            shared_dir,
            router_url,
            router_api_key,
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn find_local(&self, model_name: &str) -> Option<PathBuf> {
        find_gguf(&self.local_dir, model_name)
    }

    pub fn find_shared(&self, model_name: &str) -> Option<PathBuf> {
        find_gguf(self.shared_dir.as_ref()?, model_name)
    }

    /// Downloads `model.gguf` from the router's per-model blob endpoint
    /// into the local models directory and returns the resulting path.
    pub async fn download_from_router(&self, model_name: &str) -> Result<PathBuf, ResolveError> {
        let base = self
            .router_url
            .as_ref()
            .ok_or_else(|| ResolveError::NotFound(model_name.to_string()))?;
        let encoded = url::form_urlencoded::byte_serialize(model_name.as_bytes()).collect::<String>();
        let blob_url = format!("{}/v0/models/blob/{}", base.trim_end_matches('/'), encoded);

        let mut request = self.http.get(&blob_url);
        if let Some(key) = &self.router_api_key {
            request = request.header("X-Node-Token", key.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::RouterRequest(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ResolveError::RouterRequest(format!(
                "status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ResolveError::RouterRequest(e.to_string()))?;

        let dest_dir = self.local_dir.join(ModelStorage::model_name_to_dir(model_name));
        std::fs::create_dir_all(&dest_dir).map_err(|e| ResolveError::RouterRequest(e.to_string()))?;
        let dest_path = dest_dir.join("model.gguf");
        std::fs::write(&dest_path, bytes).map_err(|e| ResolveError::RouterRequest(e.to_string()))?;
        Ok(dest_path)
    }

    pub async fn resolve(&self, model_name: &str) -> Result<ResolveResult, ResolveError> {
        if let Some(path) = self.find_local(model_name) {
            return Ok(ResolveResult {
                path,
                from: ResolvedFrom::Local,
            });
        }
        if let Some(path) = self.find_shared(model_name) {
            return Ok(ResolveResult {
                path,
                from: ResolvedFrom::Shared,
            });
        }
        if self.router_url.is_some() {
            let path = self.download_from_router(model_name).await?;
            return Ok(ResolveResult {
                path,
                from: ResolvedFrom::Router,
            });
        }
        Err(ResolveError::NotFound(model_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_local_before_shared() {
        let local = tempfile::tempdir().unwrap();
        let shared = tempfile::tempdir().unwrap();
        let local_model_dir = local.path().join("qwen");
        std::fs::create_dir_all(&local_model_dir).unwrap();
        std::fs::write(local_model_dir.join("model.gguf"), b"local").unwrap();
        let shared_model_dir = shared.path().join("qwen");
        std::fs::create_dir_all(&shared_model_dir).unwrap();
        std::fs::write(shared_model_dir.join("model.gguf"), b"shared").unwrap();

        let resolver = ModelResolver::new(local.path(), Some(shared.path().to_path_buf()), None, None);
        let result = resolver.resolve("qwen").await.unwrap();
        assert_eq!(result.from, ResolvedFrom::Local);
    }

    #[tokio::test]
    async fn falls_back_to_shared_when_local_missing() {
        let local = tempfile::tempdir().unwrap();
        let shared = tempfile::tempdir().unwrap();
        let shared_model_dir = shared.path().join("qwen");
        std::fs::create_dir_all(&shared_model_dir).unwrap();
        std::fs::write(shared_model_dir.join("model.gguf"), b"shared").unwrap();

        let resolver = ModelResolver::new(local.path(), Some(shared.path().to_path_buf()), None, None);
        let result = resolver.resolve("qwen").await.unwrap();
        assert_eq!(result.from, ResolvedFrom::Shared);
    }

    #[tokio::test]
    async fn reports_not_found_with_no_router() {
        let local = tempfile::tempdir().unwrap();
        let resolver = ModelResolver::new(local.path(), None, None, None);
        let err = resolver.resolve("missing").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }
}
