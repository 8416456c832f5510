//! Engine interface
//!
//! Every inference backend, built-in or plugin-supplied, implements
//! `Engine`. Represented as a trait object (`Arc<dyn Engine>`) rather than
//! a union of concrete engines so the registry can hold a closed built-in
//! set and an open plugin set uniformly — mixed static and dynamic
//! dispatch behind one interface.
//!
//! Generation parameters and the streaming callback contract are
//! generalized from a single-model worker-thread engine into a contract
//! any number of concurrently loaded models can share.

use crate::models::descriptor::ModelDescriptor;
use std::sync::Arc;

/// Inference capability a descriptor/engine can be resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Text,
    Embeddings,
    Asr,
    Tts,
    Image,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Embeddings => "embeddings",
            Capability::Asr => "asr",
            Capability::Tts => "tts",
            Capability::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Capability::Text),
            "embeddings" => Some(Capability::Embeddings),
            "asr" => Some(Capability::Asr),
            "tts" => Some(Capability::Tts),
            "image" => Some(Capability::Image),
            _ => None,
        }
    }
}

/// Generation parameters shared by chat/completion/streaming calls.
/// `seed = 0` means "derive from clock"; callers that want a reproducible
/// sequence must pass a non-zero seed explicitly.
#[derive(Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub seed: u32,
    pub stop_sequences: Vec<String>,
    /// Polled by the engine between tokens, never inside a GPU kernel.
    /// `Some(cb)` where `cb()` returning true means "abort now".
    pub abort_callback: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl std::fmt::Debug for GenerationParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationParams")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("top_k", &self.top_k)
            .field("repeat_penalty", &self.repeat_penalty)
            .field("presence_penalty", &self.presence_penalty)
            .field("frequency_penalty", &self.frequency_penalty)
            .field("seed", &self.seed)
            .field("stop_sequences", &self.stop_sequences)
            .field("abort_callback", &self.abort_callback.is_some())
            .finish()
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            seed: 0,
            stop_sequences: Vec::new(),
            abort_callback: None,
        }
    }
}

impl GenerationParams {
    pub fn is_aborted(&self) -> bool {
        self.abort_callback.as_ref().map(|cb| cb()).unwrap_or(false)
    }
}

/// Result of a `load_model` call that succeeded.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub vram_bytes: u64,
    pub max_context: u32,
}

/// The flat error taxonomy, scoped to engine operations. Only `OomVram`
/// and `LoadFailed` are recoverable at the manager level (evict one LRU,
/// retry once); everything else surfaces.
pub use crate::error::ErrorKind as EngineErrorKind;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Terminal sentinel contract for streaming: the callback is invoked on
/// every produced chunk in order, then the caller issues this sentinel
/// exactly once on normal completion (never on abort). Kept as a free
/// constant rather than baking it into the trait signature so callers can
/// pattern-match on it the way the dispatcher's post-processing does.
pub const STREAM_DONE_SENTINEL: &str = "[DONE]";

/// Uniform contract every inference backend implements.
///
/// Chat/completion calls are synchronous from the caller's perspective but
/// may internally suspend on a GPU batch; this crate models that with a
/// dedicated worker thread per loaded model (see `manager`), not `async
/// fn`, so `Engine` stays object-safe and plugins built against a stable
/// C ABI don't need an async runtime.
pub trait Engine: Send + Sync {
    fn runtime(&self) -> &str;

    fn supports_text_generation(&self) -> bool {
        false
    }
    fn supports_embeddings(&self) -> bool {
        false
    }
    fn supports_asr(&self) -> bool {
        false
    }
    fn supports_tts(&self) -> bool {
        false
    }
    fn supports_image(&self) -> bool {
        false
    }

    fn supports_capability(&self, cap: Capability) -> bool {
        match cap {
            Capability::Text => self.supports_text_generation(),
            Capability::Embeddings => self.supports_embeddings(),
            Capability::Asr => self.supports_asr(),
            Capability::Tts => self.supports_tts(),
            Capability::Image => self.supports_image(),
        }
    }

    fn load_model(&self, descriptor: &ModelDescriptor) -> EngineResult<LoadResult>;

    fn unload_model(&self, descriptor: &ModelDescriptor);

    fn generate_chat(
        &self,
        messages: &[(String, String)],
        descriptor: &ModelDescriptor,
        params: &GenerationParams,
    ) -> EngineResult<String>;

    fn generate_completion(
        &self,
        prompt: &str,
        descriptor: &ModelDescriptor,
        params: &GenerationParams,
    ) -> EngineResult<String>;

    /// Streams generated chunks through `on_token`, in order, followed by
    /// the `STREAM_DONE_SENTINEL` on normal completion (not on abort).
    fn generate_chat_stream(
        &self,
        messages: &[(String, String)],
        descriptor: &ModelDescriptor,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str),
    ) -> EngineResult<()>;

    fn generate_embeddings(
        &self,
        inputs: &[String],
        descriptor: &ModelDescriptor,
    ) -> EngineResult<Vec<Vec<f32>>>;

    fn get_model_max_context(&self, descriptor: &ModelDescriptor) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_string() {
        for cap in [
            Capability::Text,
            Capability::Embeddings,
            Capability::Asr,
            Capability::Tts,
            Capability::Image,
        ] {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("bogus"), None);
    }

    #[test]
    fn default_seed_is_zero_meaning_derive_from_clock() {
        let params = GenerationParams::default();
        assert_eq!(params.seed, 0);
    }

    #[test]
    fn abort_callback_defaults_to_not_aborted() {
        let params = GenerationParams::default();
        assert!(!params.is_aborted());

        let aborting = GenerationParams {
            abort_callback: Some(Arc::new(|| true)),
            ..GenerationParams::default()
        };
        assert!(aborting.is_aborted());
    }
}
