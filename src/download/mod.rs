//! Concurrent, rate-limited, prioritised file fetch used by the model
//! syncer for manifest-driven multi-file downloads. Single-blob fetch
//! (one URL, one destination) is the base primitive; manifest fetch
//! splits files into priority groups and runs each group through a
//! bounded worker pool, generalizing the hi/lo priority split a prior
//! downloader implementation drove from raw thread pools into a
//! `tokio::sync::Semaphore`-bounded task set.

use crate::config::DownloadConfig;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `(model_id, file, downloaded, total)`, fed monotonically.
pub type ProgressCallback = Arc<dyn Fn(&str, &str, u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub chunk: Option<u64>,
    #[serde(default)]
    pub max_bps: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadManifest {
    pub files: Vec<ManifestFile>,
}

pub struct ModelDownloader {
    models_dir: PathBuf,
    registry_base: Option<String>,
    http: Client,
    config: DownloadConfig,
}

fn rate_limiter_for(bytes_per_sec: u64) -> Option<Arc<governor::DefaultDirectRateLimiter>> {
    let bps = NonZeroU32::new(u32::try_from(bytes_per_sec).unwrap_or(u32::MAX))?;
    Some(Arc::new(RateLimiter::direct(Quota::per_second(bps))))
}

impl ModelDownloader {
    pub fn new(models_dir: impl Into<PathBuf>, registry_base: Option<String>, config: DownloadConfig) -> Self {
        Self {
            models_dir: models_dir.into(),
            registry_base,
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Downloads a single blob to `<models_dir>/<relative_name>`, honouring
    /// conditional `If-None-Match` and a digest check. Retries up to
    /// `config.max_retries` times with a linear backoff.
    pub async fn download_blob(
        &self,
        url: &str,
        relative_name: &str,
        expected_digest: Option<&str>,
        if_none_match: Option<&str>,
        progress: Option<(&str, ProgressCallback)>,
    ) -> Result<PathBuf, DownloadError> {
        let dest_path = self.models_dir.join(relative_name);
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut last_err = None;
        for attempt in 0..self.config.max_retries.max(1) {
            match self
                .download_blob_once(url, &dest_path, relative_name, expected_digest, if_none_match, progress.clone())
                .await
            {
                Ok(path) => return Ok(path),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(self.config.backoff_ms * u64::from(attempt + 1))).await;
                }
            }
        }
        Err(last_err.unwrap_or(DownloadError::Request("no attempts made".into())))
    }

    async fn download_blob_once(
        &self,
        url: &str,
        dest_path: &Path,
        relative_name: &str,
        expected_digest: Option<&str>,
        if_none_match: Option<&str>,
        progress: Option<(&str, ProgressCallback)>,
    ) -> Result<PathBuf, DownloadError> {
        let mut request = self.http.get(url);
        if let Some(etag) = if_none_match {
            if dest_path.is_file() {
                request = request.header("If-None-Match", etag.to_string());
            }
        }

        let response = request.send().await.map_err(|e| DownloadError::Request(e.to_string()))?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(dest_path.to_path_buf());
        }
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }

        let total = response.content_length().unwrap_or(0);
        let limiter = rate_limiter_for(self.config.max_bytes_per_sec);

        let temp_path = dest_path.with_extension("part");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        let mut stream = response.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::Request(e.to_string()))?;
            if let Some(limiter) = &limiter {
                if let Ok(n) = NonZeroU32::try_from(u32::try_from(chunk.len()).unwrap_or(u32::MAX).max(1)) {
                    limiter.until_n_ready(n).await.ok();
                }
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some((model_id, cb)) = &progress {
                cb(model_id, relative_name, downloaded, total);
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = expected_digest {
            let actual = hex::encode(hasher.finalize());
            if !expected.eq_ignore_ascii_case(&actual) {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(DownloadError::DigestMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        tokio::fs::rename(&temp_path, dest_path).await?;
        Ok(dest_path.to_path_buf())
    }

    pub async fn fetch_manifest(&self, model_id: &str) -> Option<DownloadManifest> {
        let base = self.registry_base.as_ref()?;
        let url = format!(
            "{}/v0/models/registry/{}/manifest.json",
            base.trim_end_matches('/'),
            model_id
        );
        let response = self.http.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<DownloadManifest>().await.ok()
    }

    /// Downloads every file in a manifest: high priority (`priority >= 0`)
    /// group first, then low priority, each with its own worker pool size.
    pub async fn download_manifest(
        &self,
        model_id: &str,
        manifest: &DownloadManifest,
        progress: Option<ProgressCallback>,
    ) -> Result<(), DownloadError> {
        let mut hi: Vec<&ManifestFile> = manifest.files.iter().filter(|f| f.priority >= 0).collect();
        let mut lo: Vec<&ManifestFile> = manifest.files.iter().filter(|f| f.priority < 0).collect();
        hi.sort_by(|a, b| b.priority.cmp(&a.priority));
        lo.sort_by(|a, b| b.priority.cmp(&a.priority));

        let base_concurrency = self.config.max_concurrency.max(1);

        if !hi.is_empty() {
            let hi_conc = base_concurrency.min(hi.len());
            self.run_group(model_id, &hi, hi_conc, progress.clone()).await?;
        }
        if !lo.is_empty() {
            let lowest = lo.iter().map(|f| f.priority).min().unwrap_or(0);
            let divisor = 1usize + usize::try_from(-lowest).unwrap_or(0);
            let lo_conc = (base_concurrency / divisor).max(1).min(lo.len());
            self.run_group(model_id, &lo, lo_conc, progress).await?;
        }
        Ok(())
    }

    async fn run_group(
        &self,
        model_id: &str,
        files: &[&ManifestFile],
        concurrency: usize,
        progress: Option<ProgressCallback>,
    ) -> Result<(), DownloadError> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::new();

        for file in files {
            let permit_sem = semaphore.clone();
            let url = file
                .url
                .clone()
                .or_else(|| {
                    self.registry_base
                        .as_ref()
                        .map(|base| format!("{}/{}", base.trim_end_matches('/'), file.name))
                })
                .ok_or_else(|| DownloadError::Request("no url for manifest file".into()))?;
            let relative_name = format!("{model_id}/{}", file.name);
            let digest = file.digest.clone();
            let model_id = model_id.to_string();
            let progress = progress.clone();

            let mut per_file_config = self.config.clone();
            if let Some(chunk) = file.chunk {
                per_file_config.chunk_size = chunk;
            }
            if let Some(bps) = file.max_bps {
                per_file_config.max_bytes_per_sec = if file.priority < 0 {
                    bps / (1 + u64::try_from(-file.priority).unwrap_or(0))
                } else {
                    bps
                };
            }

            let downloader = ModelDownloader::new(self.models_dir.clone(), self.registry_base.clone(), per_file_config);

            handles.push(tokio::spawn(async move {
                let _permit = permit_sem.acquire().await;
                let cb = progress.map(|p| (model_id, p));
                downloader
                    .download_blob(&url, &relative_name, digest.as_deref(), None, cb.as_ref().map(|(id, cb)| (id.as_str(), cb.clone())))
                    .await
            }));
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| DownloadError::Request(e.to_string()))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_splits_by_priority_sign() {
        let manifest = DownloadManifest {
            files: vec![
                ManifestFile {
                    name: "a".into(),
                    url: None,
                    digest: None,
                    priority: 5,
                    chunk: None,
                    max_bps: None,
                },
                ManifestFile {
                    name: "b".into(),
                    url: None,
                    digest: None,
                    priority: -2,
                    chunk: None,
                    max_bps: None,
                },
            ],
        };
        let hi: Vec<_> = manifest.files.iter().filter(|f| f.priority >= 0).collect();
        let lo: Vec<_> = manifest.files.iter().filter(|f| f.priority < 0).collect();
        assert_eq!(hi.len(), 1);
        assert_eq!(lo.len(), 1);
    }

    #[tokio::test]
    async fn download_blob_verifies_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = DownloadConfig::default();
        let downloader = ModelDownloader::new(dir.path(), None, config);

        // No network in unit tests: exercise the error path directly by
        // asserting an unreachable URL is reported as a request error.
        let result = downloader
            .download_blob("http://127.0.0.1:0/not-reachable", "m/model.bin", Some("deadbeef"), None, None)
            .await;
        assert!(result.is_err());
    }
}
