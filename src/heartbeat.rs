//! Router registration and heartbeat: registers this node with the router
//! at startup, falling back to standalone mode on failure, then emits a
//! periodic health report carrying loaded-model and sync state.

use crate::models::SyncStatus;
use crate::monitor::ResourceSnapshot;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub available: bool,
    pub count: u32,
    pub model: Option<String>,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub machine_name: String,
    pub ip_address: String,
    pub runtime_port: u16,
    pub gpu: GpuInfo,
    pub supported_runtimes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponse {
    pub node_id: String,
    pub node_token: String,
}

pub struct ModelsSnapshot {
    pub text: Vec<String>,
    pub embeddings: Vec<String>,
    pub asr: Vec<String>,
    pub tts: Vec<String>,
    pub image: Vec<String>,
}

/// Outbound HTTP client for the two calls this node makes to the router
/// outside of the model catalog/blob fetches the syncer owns.
pub struct RouterClient {
    base_url: String,
    api_key: Option<String>,
    http: Client,
    node_token: Mutex<Option<String>>,
}

impl RouterClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            node_token: Mutex::new(None),
        }
    }

    pub fn node_token(&self) -> Option<String> {
        self.node_token.lock().unwrap().clone()
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Attempts registration up to 3 times with a linear backoff. Returns
    /// `None` on exhausted retries, in which case the caller should enter
    /// standalone mode rather than treat this as fatal.
    pub async fn register(&self, request: &RegistrationRequest) -> Option<RegistrationResponse> {
        let url = format!("{}/v0/nodes", self.base_url.trim_end_matches('/'));
        for attempt in 0..3u32 {
            let builder = self.authed(self.http.post(&url)).json(request);
            match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    if let Ok(body) = response.json::<RegistrationResponse>().await {
                        *self.node_token.lock().unwrap() = Some(body.node_token.clone());
                        return Some(body);
                    }
                }
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt + 1))).await;
        }
        None
    }

    /// Sends one heartbeat. Errors are swallowed beyond a status-code
    /// check; a missed heartbeat is not fatal, the next tick retries.
    pub async fn send_heartbeat(
        &self,
        models: &ModelsSnapshot,
        supported_runtimes: &[String],
        resources: &ResourceSnapshot,
        sync_status: &SyncStatus,
    ) {
        let Some(token) = self.node_token() else {
            return;
        };
        let url = format!("{}/v0/health", self.base_url.trim_end_matches('/'));
        let body = json!({
            "models": {
                "text": models.text,
                "embeddings": models.embeddings,
                "asr": models.asr,
                "tts": models.tts,
                "image": models.image,
            },
            "supported_runtimes": supported_runtimes,
            "resources": {
                "mem_used": resources.mem_used_bytes,
                "mem_total": resources.mem_total_bytes,
                "vram_used": resources.vram_used_bytes,
                "vram_total": resources.vram_total_bytes,
            },
            "sync": {
                "state": sync_status
                    .state
                    .as_ref()
                    .map(|s| format!("{s:?}").to_lowercase())
                    .unwrap_or_else(|| "idle".to_string()),
                "to_download": sync_status.last_to_download,
                "to_delete": sync_status.last_to_delete,
            },
        });

        let _ = self
            .authed(self.http.post(&url))
            .header("X-Node-Token", token)
            .json(&body)
            .send()
            .await;
    }

    /// Runs the heartbeat loop until `running` flips false. Intended to be
    /// spawned as its own task and joined during shutdown.
    pub async fn run_heartbeat_loop(
        &self,
        interval: Duration,
        running: &std::sync::atomic::AtomicBool,
        mut sample: impl FnMut() -> (ModelsSnapshot, Vec<String>, ResourceSnapshot, SyncStatus),
    ) {
        let mut ticker = tokio::time::interval(interval);
        while running.load(std::sync::atomic::Ordering::SeqCst) {
            ticker.tick().await;
            if !running.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            let (models, runtimes, resources, sync_status) = sample();
            self.send_heartbeat(&models, &runtimes, &resources, &sync_status).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_info_serializes_with_expected_keys() {
        let gpu = GpuInfo {
            available: true,
            count: 1,
            model: Some("RTX 4090".into()),
            devices: vec!["cuda:0".into()],
        };
        let value = serde_json::to_value(&gpu).unwrap();
        assert_eq!(value["available"], true);
        assert_eq!(value["count"], 1);
    }

    #[tokio::test]
    async fn registration_against_unreachable_router_returns_none() {
        let client = RouterClient::new("http://127.0.0.1:0", None);
        let request = RegistrationRequest {
            machine_name: "test-host".into(),
            ip_address: "127.0.0.1".into(),
            runtime_port: 11434,
            gpu: GpuInfo {
                available: false,
                count: 0,
                model: None,
                devices: Vec::new(),
            },
            supported_runtimes: vec!["llama_cpp".into()],
        };
        assert!(client.register(&request).await.is_none());
        assert!(client.node_token().is_none());
    }
}
