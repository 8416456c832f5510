//! Compute-node runtime entry point: wires configuration, the engine
//! registry/plugin host, model storage/sync, the engine manager, resource
//! monitor, and router heartbeat together, then serves until asked to
//! shut down. No inbound HTTP listener lives in this crate — transport is
//! layered on top by whatever embeds the dispatcher.

use llm_node_runtime::config::NodeConfig;
use llm_node_runtime::dispatcher::Dispatcher;
use llm_node_runtime::engine::builtin::register_builtins;
use llm_node_runtime::engine::plugin_host::PluginHost;
use llm_node_runtime::engine::registry::EngineRegistry;
use llm_node_runtime::heartbeat::{GpuInfo, ModelsSnapshot, RegistrationRequest, RouterClient};
use llm_node_runtime::manager::EngineManager;
use llm_node_runtime::models::{ModelResolver, ModelStorage, ModelSync};
use llm_node_runtime::monitor::{NoVram, ResourceMonitor};
use llm_node_runtime::readiness::ReadinessGate;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn load_config() -> NodeConfig {
    let path = std::env::var("LLM_NODE_CONFIG").unwrap_or_else(|_| "node.toml".to_string());
    match std::fs::read_to_string(&path) {
        Ok(raw) => match NodeConfig::from_toml_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("failed to parse {path}: {e}, falling back to defaults");
                NodeConfig::default()
            }
        },
        Err(_) => NodeConfig::default(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("llm_node_runtime=info".parse().unwrap()))
        .init();

    let mut config = load_config();
    config.validate();
    info!("starting llm-node v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.models_dir).ok();

    let registry = Arc::new(EngineRegistry::new());
    if let Err(e) = register_builtins(&registry, 0) {
        error!("failed to register built-in engines: {e}");
    }

    let storage = ModelStorage::new(&config.models_dir);
    let resolver = ModelResolver::new(
        &config.models_dir,
        config.shared_models_dir.clone(),
        config.router_url.clone(),
        config.router_api_key.clone(),
    );
    let manager = Arc::new(EngineManager::new(
        std::fs::canonicalize(&config.models_dir).unwrap_or_else(|_| config.models_dir.clone()),
        config.engine_limits.max_loaded_models,
        config.engine_limits.max_memory_bytes,
        Duration::from_secs(config.engine_limits.idle_timeout_sec),
    ));
    let readiness = Arc::new(ReadinessGate::new());
    let monitor = Arc::new(ResourceMonitor::new(config.resource_watermark, Box::new(NoVram)));

    let host_backend = "cpu".to_string();
    let plugin_host = PluginHost::new(config.engine_plugins_dir.clone(), host_backend.clone(), config.models_dir.clone())
        .with_manager(manager.clone());
    match plugin_host.stage_all() {
        Ok(staged) => {
            let count = staged.len();
            if let Err(e) = PluginHost::apply_staged(&registry, staged) {
                error!("plugin apply failed: {e}");
            } else if count > 0 {
                info!("loaded {count} engine plugin(s)");
            }
        }
        Err((dir, e)) => error!("plugin staging failed at {}: {e}", dir.display()),
    }

    let running = Arc::new(AtomicBool::new(true));

    let router_client = config.router_url.as_ref().map(|url| {
        Arc::new(RouterClient::new(url.clone(), config.router_api_key.clone()))
    });

    if let Some(client) = &router_client {
        let request = RegistrationRequest {
            machine_name: hostname(),
            ip_address: "0.0.0.0".to_string(),
            runtime_port: config.node_port,
            gpu: GpuInfo {
                available: false,
                count: 0,
                model: None,
                devices: Vec::new(),
            },
            supported_runtimes: vec![
                "llama_cpp".into(),
                "safetensors_cpp".into(),
                "gptoss_cpp".into(),
                "nemotron_cpp".into(),
                "whisper_cpp".into(),
            ],
        };
        if client.register(&request).await.is_some() {
            info!("registered with router, entering normal mode");
        } else {
            warn!("router registration failed after retries, entering standalone mode");
        }
    } else {
        info!("no router configured, running standalone");
    }

    let sync = config
        .router_url
        .as_ref()
        .map(|url| Arc::new(ModelSync::with_download_config(url.clone(), &config.models_dir, config.download.clone())));
    if let (Some(sync), Some(client)) = (&sync, &router_client) {
        if let Some(token) = client.node_token() {
            sync.set_node_token(token);
        }
        let result = sync.sync().await;
        info!(
            "initial sync: {} to download, {} stale",
            result.to_download.len(),
            result.to_delete.len()
        );
    }

    readiness.set_ready();
    info!("node ready on port {}", config.node_port);

    let _dispatcher = Dispatcher::new(storage, resolver, registry.clone(), manager.clone(), readiness.clone(), host_backend);

    if let Some(client) = router_client.clone() {
        let running_for_heartbeat = running.clone();
        let monitor_for_heartbeat = monitor.clone();
        let sync_for_heartbeat = sync.clone();
        let interval = Duration::from_secs(config.heartbeat_interval_sec);
        tokio::spawn(async move {
            client
                .run_heartbeat_loop(interval, &running_for_heartbeat, || {
                    let snapshot = monitor_for_heartbeat.sample();
                    let models = ModelsSnapshot {
                        text: Vec::new(),
                        embeddings: Vec::new(),
                        asr: Vec::new(),
                        tts: Vec::new(),
                        image: Vec::new(),
                    };
                    let status = sync_for_heartbeat
                        .as_ref()
                        .map(|s| s.status())
                        .unwrap_or_default();
                    (models, vec!["llama_cpp".into()], snapshot, status)
                })
                .await;
        });
    }

    {
        let manager_for_sweep = manager.clone();
        let running_for_sweep = running.clone();
        let idle_check = Duration::from_secs(60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle_check);
            while running_for_sweep.load(std::sync::atomic::Ordering::SeqCst) {
                ticker.tick().await;
                manager_for_sweep.sweep_idle();
            }
        });
    }

    {
        let monitor_for_resample = monitor.clone();
        let manager_for_watermark = manager.clone();
        let readiness_for_watermark = readiness.clone();
        let sample_interval = Duration::from_secs(config.resource_sample_interval_sec);
        monitor.clone().spawn_loop(sample_interval, move |mut snapshot| {
            while monitor_for_resample.is_over_watermark(&snapshot) {
                if readiness_for_watermark.active_requests() != 0 {
                    break;
                }
                if !manager_for_watermark.evict_one() {
                    break;
                }
                snapshot = monitor_for_resample.sample();
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    running.store(false, std::sync::atomic::Ordering::SeqCst);
    readiness.begin_shutdown();
    manager.unload_all();
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "llm-node".to_string())
}
