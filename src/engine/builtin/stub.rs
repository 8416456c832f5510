//! Minimal built-in engines for runtimes this crate registers a slot for
//! but does not implement inference math for: `safetensors_cpp`,
//! `gptoss_cpp`, `nemotron_cpp`, and `whisper_cpp` (ASR). Real math for
//! any one engine is out of scope; these exist so the registry has
//! something to resolve against for every runtime model storage can
//! detect, and so integration tests can exercise load/unload bookkeeping
//! without a GPU.

use crate::engine::interface::{
    Engine, EngineError, EngineErrorKind, EngineResult, GenerationParams, LoadResult,
};
use crate::models::descriptor::ModelDescriptor;
use dashmap::DashSet;
use std::path::PathBuf;

fn unsupported(op: &str) -> EngineError {
    EngineError::new(
        EngineErrorKind::Unsupported,
        format!("{op} is not implemented by this engine"),
    )
}

/// Shared skeleton for the text-capable stub engines: tracks which model
/// paths are "loaded" without doing anything with them.
struct TextStubEngine {
    runtime: &'static str,
    loaded: DashSet<PathBuf>,
}

impl TextStubEngine {
    fn new(runtime: &'static str) -> Self {
        Self {
            runtime,
            loaded: DashSet::new(),
        }
    }
}

impl Engine for TextStubEngine {
    fn runtime(&self) -> &str {
        self.runtime
    }

    fn supports_text_generation(&self) -> bool {
        true
    }

    fn load_model(&self, descriptor: &ModelDescriptor) -> EngineResult<LoadResult> {
        self.loaded.insert(descriptor.primary_path.clone());
        Ok(LoadResult {
            vram_bytes: 0,
            max_context: 4096,
        })
    }

    fn unload_model(&self, descriptor: &ModelDescriptor) {
        self.loaded.remove(&descriptor.primary_path);
    }

    fn generate_chat(
        &self,
        _messages: &[(String, String)],
        _descriptor: &ModelDescriptor,
        _params: &GenerationParams,
    ) -> EngineResult<String> {
        Err(unsupported("generate_chat"))
    }

    fn generate_completion(
        &self,
        _prompt: &str,
        _descriptor: &ModelDescriptor,
        _params: &GenerationParams,
    ) -> EngineResult<String> {
        Err(unsupported("generate_completion"))
    }

    fn generate_chat_stream(
        &self,
        _messages: &[(String, String)],
        _descriptor: &ModelDescriptor,
        _params: &GenerationParams,
        _on_token: &mut dyn FnMut(&str),
    ) -> EngineResult<()> {
        Err(unsupported("generate_chat_stream"))
    }

    fn generate_embeddings(
        &self,
        _inputs: &[String],
        _descriptor: &ModelDescriptor,
    ) -> EngineResult<Vec<Vec<f32>>> {
        Err(unsupported("generate_embeddings"))
    }

    fn get_model_max_context(&self, descriptor: &ModelDescriptor) -> u32 {
        if self.loaded.contains(&descriptor.primary_path) {
            4096
        } else {
            0
        }
    }
}

pub fn safetensors_cpp_engine() -> impl Engine {
    TextStubEngine::new("safetensors_cpp")
}

pub fn gptoss_cpp_engine() -> impl Engine {
    TextStubEngine::new("gptoss_cpp")
}

pub fn nemotron_cpp_engine() -> impl Engine {
    TextStubEngine::new("nemotron_cpp")
}

/// ASR stub for `whisper_cpp`. Kept separate from `TextStubEngine` because
/// its capability predicate differs and a real implementation's
/// `generate_embeddings`/`generate_chat` would stay unsupported forever,
/// not just until someone fills in the math.
pub struct WhisperCppEngine {
    loaded: DashSet<PathBuf>,
}

impl Default for WhisperCppEngine {
    fn default() -> Self {
        Self {
            loaded: DashSet::new(),
        }
    }
}

impl Engine for WhisperCppEngine {
    fn runtime(&self) -> &str {
        "whisper_cpp"
    }

    fn supports_asr(&self) -> bool {
        true
    }

    fn load_model(&self, descriptor: &ModelDescriptor) -> EngineResult<LoadResult> {
        self.loaded.insert(descriptor.primary_path.clone());
        Ok(LoadResult {
            vram_bytes: 0,
            max_context: 0,
        })
    }

    fn unload_model(&self, descriptor: &ModelDescriptor) {
        self.loaded.remove(&descriptor.primary_path);
    }

    fn generate_chat(
        &self,
        _messages: &[(String, String)],
        _descriptor: &ModelDescriptor,
        _params: &GenerationParams,
    ) -> EngineResult<String> {
        Err(unsupported("generate_chat"))
    }

    fn generate_completion(
        &self,
        _prompt: &str,
        _descriptor: &ModelDescriptor,
        _params: &GenerationParams,
    ) -> EngineResult<String> {
        Err(unsupported("generate_completion"))
    }

    fn generate_chat_stream(
        &self,
        _messages: &[(String, String)],
        _descriptor: &ModelDescriptor,
        _params: &GenerationParams,
        _on_token: &mut dyn FnMut(&str),
    ) -> EngineResult<()> {
        Err(unsupported("generate_chat_stream"))
    }

    fn generate_embeddings(
        &self,
        _inputs: &[String],
        _descriptor: &ModelDescriptor,
    ) -> EngineResult<Vec<Vec<f32>>> {
        Err(unsupported("generate_embeddings"))
    }

    fn get_model_max_context(&self, _descriptor: &ModelDescriptor) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(runtime: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: "m".into(),
            runtime: runtime.into(),
            format: "safetensors".into(),
            primary_path: "/m/config.json".into(),
            model_dir: "/m".into(),
            metadata: None,
        }
    }

    #[test]
    fn stub_engines_report_correct_capability() {
        let e = safetensors_cpp_engine();
        assert!(e.supports_text_generation());
        assert!(!e.supports_asr());

        let w = WhisperCppEngine::default();
        assert!(w.supports_asr());
        assert!(!w.supports_text_generation());
    }

    #[test]
    fn load_then_unload_clears_max_context() {
        let e = gptoss_cpp_engine();
        let d = descriptor("gptoss_cpp");
        e.load_model(&d).unwrap();
        assert_eq!(e.get_model_max_context(&d), 4096);
        e.unload_model(&d);
        assert_eq!(e.get_model_max_context(&d), 0);
    }

    #[test]
    fn generation_calls_report_unsupported() {
        let e = nemotron_cpp_engine();
        let d = descriptor("nemotron_cpp");
        let err = e
            .generate_completion("hi", &d, &GenerationParams::default())
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Unsupported);
    }
}
