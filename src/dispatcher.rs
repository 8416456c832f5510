//! Dispatcher: the top-level entry point chat/completion/embeddings
//! requests flow through, independent of whatever transport (if any) sits
//! in front of it. Resolves a model name to a descriptor, resolves a
//! descriptor to an engine, ensures the engine has it loaded, then invokes
//! the requested operation inside the readiness gate's in-flight guard.

use crate::engine::interface::{Capability, GenerationParams};
use crate::error::NodeError;
use crate::manager::EngineManager;
use crate::models::descriptor::ModelDescriptor;
use crate::models::resolver::ModelResolver;
use crate::models::storage::ModelStorage;
use crate::readiness::ReadinessGate;
use crate::engine::registry::EngineRegistry;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_STOP_SEQUENCES: &[&str] = &[
    "<|im_end|>",
    "<|end|>",
    "<|start|>",
    "<|eot_id|>",
    "</s>",
    "<|endoftext|>",
];

pub struct Dispatcher {
    storage: ModelStorage,
    resolver: ModelResolver,
    registry: Arc<EngineRegistry>,
    manager: Arc<EngineManager>,
    readiness: Arc<ReadinessGate>,
    host_backend: String,
}

impl Dispatcher {
    pub fn new(
        storage: ModelStorage,
        resolver: ModelResolver,
        registry: Arc<EngineRegistry>,
        manager: Arc<EngineManager>,
        readiness: Arc<ReadinessGate>,
        host_backend: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            resolver,
            registry,
            manager,
            readiness,
            host_backend: host_backend.into(),
        }
    }

    /// Resolves a model name to a descriptor from the local storage
    /// layout first, falling back to the resolver's local/shared tiers
    /// when storage doesn't recognise the directory shape. The
    /// resolver's router-blob tier runs asynchronously and is handled up
    /// front by model sync instead of on the request path, so a
    /// dispatch-time miss there is a genuine not-found.
    fn resolve_descriptor(&self, model_name: &str) -> Result<ModelDescriptor, NodeError> {
        if let Some(descriptor) = self.storage.resolve_descriptor(model_name) {
            return Ok(descriptor);
        }

        let path = self
            .resolver
            .find_local(model_name)
            .or_else(|| self.resolver.find_shared(model_name))
            .ok_or_else(|| NodeError::not_found(format!("model '{model_name}' not found")))?;

        Ok(ModelDescriptor {
            name: model_name.to_string(),
            runtime: "llama_cpp".to_string(),
            format: "gguf".to_string(),
            model_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            primary_path: path,
            metadata: None,
        })
    }

    fn resolve_and_load(
        &self,
        model_name: &str,
        capability: Capability,
    ) -> Result<(ModelDescriptor, Arc<dyn crate::engine::interface::Engine>), NodeError> {
        let descriptor = self.resolve_descriptor(model_name)?;
        let engine = self
            .registry
            .resolve(&descriptor, Some(capability), &self.host_backend)
            .map_err(|e| match e {
                crate::engine::registry::ResolutionError::NoCapabilityMatch { .. } => {
                    NodeError::capability_unsupported(e.to_string())
                }
                other => NodeError::not_found(other.to_string()),
            })?;

        match self.manager.load_if_needed(&descriptor, engine.clone()) {
            Ok(_) => Ok((descriptor, engine)),
            Err(crate::manager::LoadError::EngineLoad(e)) => {
                Err(NodeError::new(e.kind, e.message))
            }
            Err(e) => Err(NodeError::internal(e.to_string())),
        }
    }

    /// Strips a single trailing default or caller-supplied stop sequence,
    /// then for channel-tagged output keeps only the content between the
    /// last `<|channel|>final<|message|>` marker and the next `<|end|>`.
    pub fn post_process(text: &str, caller_stops: &[String]) -> String {
        let mut out = text;
        if let Some(marker_pos) = out.rfind("<|channel|>final<|message|>") {
            let after_marker = &out[marker_pos + "<|channel|>final<|message|>".len()..];
            out = match after_marker.find("<|end|>") {
                Some(end_pos) => &after_marker[..end_pos],
                None => after_marker,
            };
        }

        let mut trimmed = out.to_string();
        for stop in DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).chain(caller_stops.iter().cloned()) {
            if let Some(stripped) = trimmed.strip_suffix(stop.as_str()) {
                trimmed = stripped.to_string();
            }
        }
        trimmed
    }

    pub fn generate_chat(
        &self,
        model_name: &str,
        messages: &[(String, String)],
        params: &GenerationParams,
    ) -> Result<String, NodeError> {
        let _guard = self
            .readiness
            .admit()
            .ok_or_else(|| NodeError::service_unavailable("node is not ready"))?;

        let (descriptor, engine) = self.resolve_and_load(model_name, Capability::Text)?;
        let raw = engine
            .generate_chat(messages, &descriptor, params)
            .map_err(|e| NodeError::new(e.kind, e.message))?;
        Ok(Self::post_process(&raw, &params.stop_sequences))
    }

    pub fn generate_completion(
        &self,
        model_name: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, NodeError> {
        let _guard = self
            .readiness
            .admit()
            .ok_or_else(|| NodeError::service_unavailable("node is not ready"))?;

        let (descriptor, engine) = self.resolve_and_load(model_name, Capability::Text)?;
        let raw = engine
            .generate_completion(prompt, &descriptor, params)
            .map_err(|e| NodeError::new(e.kind, e.message))?;
        Ok(Self::post_process(&raw, &params.stop_sequences))
    }

    pub fn generate_chat_stream(
        &self,
        model_name: &str,
        messages: &[(String, String)],
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), NodeError> {
        let _guard = self
            .readiness
            .admit()
            .ok_or_else(|| NodeError::service_unavailable("node is not ready"))?;

        let (descriptor, engine) = self.resolve_and_load(model_name, Capability::Text)?;
        engine
            .generate_chat_stream(messages, &descriptor, params, on_token)
            .map_err(|e| NodeError::new(e.kind, e.message))?;
        on_token(crate::engine::interface::STREAM_DONE_SENTINEL);
        Ok(())
    }

    pub fn generate_embeddings(&self, model_name: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, NodeError> {
        let _guard = self
            .readiness
            .admit()
            .ok_or_else(|| NodeError::service_unavailable("node is not ready"))?;

        let (descriptor, engine) = self.resolve_and_load(model_name, Capability::Embeddings)?;
        engine
            .generate_embeddings(inputs, &descriptor)
            .map_err(|e| NodeError::new(e.kind, e.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_process_strips_default_stop_sequence() {
        let out = Dispatcher::post_process("hello there<|im_end|>", &[]);
        assert_eq!(out, "hello there");
    }

    #[test]
    fn post_process_strips_caller_supplied_stop_sequence() {
        let out = Dispatcher::post_process("hello###", &["###".to_string()]);
        assert_eq!(out, "hello");
    }

    #[test]
    fn post_process_extracts_final_channel_content() {
        let raw = "<|channel|>analysis<|message|>thinking...<|end|><|channel|>final<|message|>the answer<|end|>";
        let out = Dispatcher::post_process(raw, &[]);
        assert_eq!(out, "the answer");
    }

    #[test]
    fn post_process_leaves_plain_text_untouched() {
        let out = Dispatcher::post_process("plain text", &[]);
        assert_eq!(out, "plain text");
    }
}
