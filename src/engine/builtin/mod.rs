//! Built-in engines registered before any plugin, per the registration
//! order the registry's tie-break relies on.

mod llama_cpp;
mod stub;

pub use llama_cpp::LlamaCppEngine;
pub use stub::{gptoss_cpp_engine, nemotron_cpp_engine, safetensors_cpp_engine, WhisperCppEngine};

use crate::engine::interface::Capability;
use crate::engine::registry::{EngineRegistration, EngineRegistry, EngineSource, RegistrationError};
use std::sync::Arc;

/// Registers every built-in engine this crate ships. `gpu_layers` is
/// forwarded to the llama.cpp engine only; the stub engines ignore GPU
/// configuration entirely.
pub fn register_builtins(registry: &EngineRegistry, gpu_layers: u32) -> Result<(), RegistrationError> {
    if let Ok(llama) = LlamaCppEngine::new(gpu_layers) {
        registry.register(
            Arc::new(llama),
            EngineRegistration {
                engine_id: "builtin.llama_cpp".into(),
                engine_version: env!("CARGO_PKG_VERSION").into(),
                runtimes: vec!["llama_cpp".into()],
                formats: vec!["gguf".into()],
                architectures: vec![],
                capabilities: vec![Capability::Text],
                gpu_targets: vec![],
                source: EngineSource::BuiltIn,
            },
        )?;
    }

    registry.register(
        Arc::new(safetensors_cpp_engine()),
        EngineRegistration {
            engine_id: "builtin.safetensors_cpp".into(),
            engine_version: env!("CARGO_PKG_VERSION").into(),
            runtimes: vec!["safetensors_cpp".into()],
            formats: vec!["safetensors".into()],
            architectures: vec![],
            capabilities: vec![Capability::Text],
            gpu_targets: vec![],
            source: EngineSource::BuiltIn,
        },
    )?;

    registry.register(
        Arc::new(gptoss_cpp_engine()),
        EngineRegistration {
            engine_id: "builtin.gptoss_cpp".into(),
            engine_version: env!("CARGO_PKG_VERSION").into(),
            runtimes: vec!["gptoss_cpp".into()],
            formats: vec!["safetensors".into()],
            architectures: vec![],
            capabilities: vec![Capability::Text],
            gpu_targets: vec![],
            source: EngineSource::BuiltIn,
        },
    )?;

    registry.register(
        Arc::new(nemotron_cpp_engine()),
        EngineRegistration {
            engine_id: "builtin.nemotron_cpp".into(),
            engine_version: env!("CARGO_PKG_VERSION").into(),
            runtimes: vec!["nemotron_cpp".into()],
            formats: vec!["safetensors".into()],
            architectures: vec![],
            capabilities: vec![Capability::Text],
            gpu_targets: vec![],
            source: EngineSource::BuiltIn,
        },
    )?;

    registry.register(
        Arc::new(WhisperCppEngine::default()),
        EngineRegistration {
            engine_id: "builtin.whisper_cpp".into(),
            engine_version: env!("CARGO_PKG_VERSION").into(),
            runtimes: vec!["whisper_cpp".into()],
            formats: vec!["gguf".into()],
            architectures: vec![],
            capabilities: vec![Capability::Asr],
            gpu_targets: vec![],
            source: EngineSource::BuiltIn,
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_one_engine_per_known_runtime() {
        let registry = EngineRegistry::new();
        // gpu_layers = 0; LlamaCppEngine::new may fail in a test sandbox
        // without a usable llama.cpp backend, which is fine: the other
        // four built-ins still register.
        let _ = register_builtins(&registry, 0);

        let d = |runtime: &str, format: &str| crate::models::descriptor::ModelDescriptor {
            name: "m".into(),
            runtime: runtime.into(),
            format: format.into(),
            primary_path: "/m/x".into(),
            model_dir: "/m".into(),
            metadata: None,
        };
        assert!(registry
            .resolve(&d("safetensors_cpp", "safetensors"), None, "cpu")
            .is_ok());
        assert!(registry
            .resolve(&d("whisper_cpp", "gguf"), None, "cpu")
            .is_ok());
    }
}
