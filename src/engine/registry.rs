//! Engine registry
//!
//! Stores engines indexed by runtime tag, each runtime mapping to an
//! ordered list of engine entries, so several engines can compete for the
//! same runtime and resolution can pick among them. Resolution runs a
//! filter/tie-break chain and reports which filter rejected which
//! descriptor field when nothing survives.

use crate::engine::interface::{Capability, Engine};
use crate::models::descriptor::ModelDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSource {
    BuiltIn,
    Plugin,
}

#[derive(Clone)]
pub struct EngineRegistration {
    pub engine_id: String,
    pub engine_version: String,
    pub runtimes: Vec<String>,
    pub formats: Vec<String>,
    pub architectures: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub gpu_targets: Vec<String>,
    pub source: EngineSource,
}

struct EngineEntry {
    registration: EngineRegistration,
    engine: Arc<dyn Engine>,
}

/// Why resolution failed, naming the filter and the descriptor field it
/// inspected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("no engine registered for runtime '{0}'")]
    NoRuntimeMatch(String),
    #[error("no engine for runtime '{runtime}' supports format '{format}'")]
    NoFormatMatch { runtime: String, format: String },
    #[error("no engine for runtime '{runtime}' supports capability '{capability}'")]
    NoCapabilityMatch { runtime: String, capability: String },
    #[error("no engine for runtime '{runtime}' supports architectures {architectures:?}")]
    NoArchitectureMatch {
        runtime: String,
        architectures: Vec<String>,
    },
    #[error("no engine for runtime '{runtime}' supports gpu target '{gpu_target}'")]
    NoGpuTargetMatch { runtime: String, gpu_target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("engine_id must not be empty")]
    EmptyEngineId,
    #[error("engine_id '{0}' is already registered")]
    DuplicateEngineId(String),
}

pub struct EngineRegistry {
    /// Indexed by runtime tag; within each runtime, entries preserve
    /// registration order (built-ins register before plugins).
    by_runtime: Mutex<HashMap<String, Vec<EngineEntry>>>,
    known_ids: Mutex<std::collections::HashSet<String>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            by_runtime: Mutex::new(HashMap::new()),
            known_ids: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn register(
        &self,
        engine: Arc<dyn Engine>,
        registration: EngineRegistration,
    ) -> Result<(), RegistrationError> {
        if registration.engine_id.is_empty() {
            return Err(RegistrationError::EmptyEngineId);
        }
        let mut known = self.known_ids.lock().unwrap();
        if known.contains(&registration.engine_id) {
            return Err(RegistrationError::DuplicateEngineId(
                registration.engine_id.clone(),
            ));
        }
        known.insert(registration.engine_id.clone());
        drop(known);

        let mut by_runtime = self.by_runtime.lock().unwrap();
        for runtime in &registration.runtimes {
            by_runtime
                .entry(runtime.clone())
                .or_default()
                .push(EngineEntry {
                    registration: registration.clone(),
                    engine: engine.clone(),
                });
        }
        Ok(())
    }

    /// Resolves the best engine for `(descriptor, capability)` following
    /// the runtime/format/capability/architecture/gpu-target filter chain,
    /// then a benchmark-score/source/registration-order tie-break.
    pub fn resolve(
        &self,
        descriptor: &ModelDescriptor,
        capability: Option<Capability>,
        host_backend: &str,
    ) -> Result<Arc<dyn Engine>, ResolutionError> {
        let by_runtime = self.by_runtime.lock().unwrap();
        let candidates = by_runtime
            .get(&descriptor.runtime)
            .ok_or_else(|| ResolutionError::NoRuntimeMatch(descriptor.runtime.clone()))?;
        if candidates.is_empty() {
            return Err(ResolutionError::NoRuntimeMatch(descriptor.runtime.clone()));
        }

        // Step 2: format filter (empty format list matches anything).
        let after_format: Vec<&EngineEntry> = candidates
            .iter()
            .filter(|e| {
                e.registration.formats.is_empty()
                    || e.registration.formats.iter().any(|f| f == &descriptor.format)
            })
            .collect();
        if after_format.is_empty() {
            return Err(ResolutionError::NoFormatMatch {
                runtime: descriptor.runtime.clone(),
                format: descriptor.format.clone(),
            });
        }

        // Step 3: capability filter, if requested.
        let after_capability: Vec<&EngineEntry> = if let Some(cap) = capability {
            let filtered: Vec<&EngineEntry> = after_format
                .iter()
                .copied()
                .filter(|e| e.registration.capabilities.contains(&cap))
                .collect();
            if filtered.is_empty() {
                return Err(ResolutionError::NoCapabilityMatch {
                    runtime: descriptor.runtime.clone(),
                    capability: cap.as_str().to_string(),
                });
            }
            filtered
        } else {
            after_format
        };

        // Step 4: architecture filter (empty architecture list on the
        // entry matches anything; descriptor naming none skips the filter).
        let descriptor_archs = descriptor.architectures();
        let after_arch: Vec<&EngineEntry> = if descriptor_archs.is_empty() {
            after_capability
        } else {
            let filtered: Vec<&EngineEntry> = after_capability
                .iter()
                .copied()
                .filter(|e| {
                    e.registration.architectures.is_empty()
                        || e.registration
                            .architectures
                            .iter()
                            .any(|a| descriptor_archs.contains(a))
                })
                .collect();
            if filtered.is_empty() {
                return Err(ResolutionError::NoArchitectureMatch {
                    runtime: descriptor.runtime.clone(),
                    architectures: descriptor_archs.clone(),
                });
            }
            filtered
        };

        // Step 5: gpu_targets filter against the host backend (empty
        // gpu_targets means "no restriction").
        let after_gpu: Vec<&EngineEntry> = after_arch
            .iter()
            .copied()
            .filter(|e| {
                e.registration.gpu_targets.is_empty()
                    || e.registration
                        .gpu_targets
                        .iter()
                        .any(|t| t == host_backend)
            })
            .collect();
        if after_gpu.is_empty() {
            return Err(ResolutionError::NoGpuTargetMatch {
                runtime: descriptor.runtime.clone(),
                gpu_target: host_backend.to_string(),
            });
        }

        // Step 6: tie-break.
        // 6a. Benchmark scores from descriptor metadata, if present.
        if let Some(best) = after_gpu.iter().copied().max_by(|a, b| {
            let sa = descriptor.engine_score(&a.registration.engine_id);
            let sb = descriptor.engine_score(&b.registration.engine_id);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        }) {
            let any_scored = after_gpu
                .iter()
                .any(|e| descriptor.engine_score(&e.registration.engine_id).is_some());
            if any_scored {
                return Ok(best.engine.clone());
            }
        }

        // 6b. Prefer plugin-sourced engines over built-ins.
        if let Some(plugin) = after_gpu
            .iter()
            .find(|e| e.registration.source == EngineSource::Plugin)
        {
            return Ok(plugin.engine.clone());
        }

        // 6c. Preserve registration order (first survivor).
        Ok(after_gpu[0].engine.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::interface::{EngineResult, GenerationParams, LoadResult};

    struct StubEngine {
        runtime: &'static str,
        caps: Vec<Capability>,
    }

    impl Engine for StubEngine {
        fn runtime(&self) -> &str {
            self.runtime
        }
        fn supports_text_generation(&self) -> bool {
            self.caps.contains(&Capability::Text)
        }
        fn supports_embeddings(&self) -> bool {
            self.caps.contains(&Capability::Embeddings)
        }
        fn load_model(&self, _: &ModelDescriptor) -> EngineResult<LoadResult> {
            Ok(LoadResult {
                vram_bytes: 0,
                max_context: 4096,
            })
        }
        fn unload_model(&self, _: &ModelDescriptor) {}
        fn generate_chat(
            &self,
            _: &[(String, String)],
            _: &ModelDescriptor,
            _: &GenerationParams,
        ) -> EngineResult<String> {
            Ok(String::new())
        }
        fn generate_completion(
            &self,
            _: &str,
            _: &ModelDescriptor,
            _: &GenerationParams,
        ) -> EngineResult<String> {
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
        fn generate_embeddings(
            &self,
            _: &[String],
            _: &ModelDescriptor,
        ) -> EngineResult<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
        fn get_model_max_context(&self, _: &ModelDescriptor) -> u32 {
            4096
        }
    }

    fn descriptor(runtime: &str, format: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: "m".into(),
            runtime: runtime.into(),
            format: format.into(),
            primary_path: "/m/model.gguf".into(),
            model_dir: "/m".into(),
            metadata: None,
        }
    }

    fn registration(id: &str, runtime: &str, caps: Vec<Capability>) -> EngineRegistration {
        EngineRegistration {
            engine_id: id.into(),
            engine_version: "1.0".into(),
            runtimes: vec![runtime.into()],
            formats: vec![],
            architectures: vec![],
            capabilities: caps,
            gpu_targets: vec![],
            source: EngineSource::BuiltIn,
        }
    }

    #[test]
    fn resolves_by_capability() {
        let registry = EngineRegistry::new();
        registry
            .register(
                Arc::new(StubEngine {
                    runtime: "fake",
                    caps: vec![Capability::Text],
                }),
                registration("engine_text", "fake", vec![Capability::Text]),
            )
            .unwrap();
        registry
            .register(
                Arc::new(StubEngine {
                    runtime: "fake",
                    caps: vec![Capability::Embeddings],
                }),
                registration("engine_embeddings", "fake", vec![Capability::Embeddings]),
            )
            .unwrap();

        let d = descriptor("fake", "gguf");
        let embeddings_engine = registry
            .resolve(&d, Some(Capability::Embeddings), "cpu")
            .unwrap();
        assert!(embeddings_engine.supports_embeddings());

        let text_engine = registry.resolve(&d, Some(Capability::Text), "cpu").unwrap();
        assert!(text_engine.supports_text_generation());

        let err = registry.resolve(&d, Some(Capability::Asr), "cpu").unwrap_err();
        assert!(matches!(err, ResolutionError::NoCapabilityMatch { .. }));
    }

    #[test]
    fn benchmark_score_breaks_ties() {
        let registry = EngineRegistry::new();
        registry
            .register(
                Arc::new(StubEngine {
                    runtime: "fake",
                    caps: vec![Capability::Text],
                }),
                registration("engine_a", "fake", vec![Capability::Text]),
            )
            .unwrap();
        registry
            .register(
                Arc::new(StubEngine {
                    runtime: "fake",
                    caps: vec![Capability::Text],
                }),
                registration("engine_b", "fake", vec![Capability::Text]),
            )
            .unwrap();

        let mut d = descriptor("fake", "gguf");
        d.metadata = Some(serde_json::json!({
            "benchmarks": {"engine_scores": {"engine_a": 1.0, "engine_b": 5.0}}
        }));

        let chosen = registry.resolve(&d, Some(Capability::Text), "cpu").unwrap();
        assert_eq!(chosen.runtime(), "fake");
        // engine_b should win; verified indirectly via registration lookup below.
        let by_runtime = registry.by_runtime.lock().unwrap();
        let entries = &by_runtime["fake"];
        let winner_id = entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.engine, &chosen))
            .unwrap()
            .registration
            .engine_id
            .clone();
        assert_eq!(winner_id, "engine_b");
    }

    #[test]
    fn duplicate_engine_id_rejected() {
        let registry = EngineRegistry::new();
        registry
            .register(
                Arc::new(StubEngine {
                    runtime: "fake",
                    caps: vec![Capability::Text],
                }),
                registration("dup", "fake", vec![Capability::Text]),
            )
            .unwrap();
        let err = registry
            .register(
                Arc::new(StubEngine {
                    runtime: "fake2",
                    caps: vec![Capability::Text],
                }),
                registration("dup", "fake2", vec![Capability::Text]),
            )
            .unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateEngineId("dup".into()));
    }

    #[test]
    fn unknown_runtime_reports_no_runtime_match() {
        let registry = EngineRegistry::new();
        let d = descriptor("missing", "gguf");
        let err = registry.resolve(&d, None, "cpu").unwrap_err();
        assert_eq!(err, ResolutionError::NoRuntimeMatch("missing".into()));
    }
}
