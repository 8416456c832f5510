//! Model descriptor
//!
//! Immutable value produced by model storage: identifies and locates a
//! model on disk.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    pub runtime: String,
    pub format: String,
    pub primary_path: PathBuf,
    pub model_dir: PathBuf,
    pub metadata: Option<serde_json::Value>,
}

impl ModelDescriptor {
    /// Benchmark engine-score tie-break used by the registry resolver:
    /// `metadata.benchmarks.engine_scores`.
    pub fn engine_score(&self, engine_id: &str) -> Option<f64> {
        self.metadata
            .as_ref()?
            .get("benchmarks")?
            .get("engine_scores")?
            .get(engine_id)?
            .as_f64()
    }

    pub fn architectures(&self) -> Vec<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("architectures"))
            .and_then(|a| a.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn chat_template(&self) -> Option<String> {
        self.metadata
            .as_ref()?
            .get("chat_template")?
            .as_str()
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor_with_metadata(metadata: serde_json::Value) -> ModelDescriptor {
        ModelDescriptor {
            name: "qwen".into(),
            runtime: "llama_cpp".into(),
            format: "gguf".into(),
            primary_path: PathBuf::from("/models/qwen/model.gguf"),
            model_dir: PathBuf::from("/models/qwen"),
            metadata: Some(metadata),
        }
    }

    #[test]
    fn engine_score_reads_nested_benchmarks() {
        let d = descriptor_with_metadata(json!({
            "benchmarks": {"engine_scores": {"engine_a": 1.0, "engine_b": 5.0}}
        }));
        assert_eq!(d.engine_score("engine_b"), Some(5.0));
        assert_eq!(d.engine_score("missing"), None);
    }

    #[test]
    fn architectures_defaults_to_empty() {
        let d = descriptor_with_metadata(json!({}));
        assert!(d.architectures().is_empty());
    }
}
