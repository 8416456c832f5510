//! Model storage: scans the models directory, sanitises model names into
//! directory names, and resolves a model name to a concrete descriptor.
//! Generalizes a plain "list .gguf files" directory scan into detecting
//! gguf, safetensors, and the runtime-sniffing rules safetensors models
//! need.

use crate::models::descriptor::ModelDescriptor;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub format: String,
    pub primary_path: PathBuf,
}

pub struct ModelStorage {
    models_dir: PathBuf,
}

fn is_valid_file(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => (meta.is_file() || meta.file_type().is_symlink()) && file_len(path) > 0,
        Err(_) => false,
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Sanitises a model name into a directory-safe identifier. `/` is kept
/// as a path separator so nested names (`openai/gpt-oss-20b`) map to
/// nested directories; everything else non-alphanumeric collapses to `_`.
pub fn sanitize_model_id(input: &str) -> String {
    if input.is_empty() || input.contains("..") || input.contains('\0') {
        return "_latest".to_string();
    }

    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' || c == '.' {
            out.push(c);
        } else if c.is_ascii_uppercase() {
            out.push(c.to_ascii_lowercase());
        } else if c == '/' {
            out.push('/');
        } else {
            out.push('_');
        }
    }

    let trimmed = out.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "_latest".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

#[derive(Deserialize, Default)]
struct ConfigJson {
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default)]
    model_type: Option<String>,
}

fn detect_runtime_from_config(model_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(model_dir.join("config.json")).ok()?;
    let config: ConfigJson = serde_json::from_str(&raw).ok()?;

    for arch in &config.architectures {
        if arch.to_lowercase().contains("gptoss") || arch.contains("GptOss") {
            return Some("gptoss_cpp".to_string());
        }
        if arch.contains("Nemotron") {
            return Some("nemotron_cpp".to_string());
        }
    }
    if let Some(model_type) = config.model_type.as_deref() {
        let lower = model_type.to_lowercase();
        if lower.contains("gpt_oss") || lower.contains("gptoss") {
            return Some("gptoss_cpp".to_string());
        }
        if lower.contains("nemotron") {
            return Some("nemotron_cpp".to_string());
        }
    }
    Some("safetensors_cpp".to_string())
}

fn validate_index_shards(model_dir: &Path, index_path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(index_path) else {
        return false;
    };
    let Ok(index) = serde_json::from_str::<SafetensorsIndex>(&raw) else {
        return false;
    };
    let shards: HashSet<&String> = index.weight_map.values().collect();
    shards
        .into_iter()
        .all(|shard| is_valid_file(&model_dir.join(shard)))
}

fn resolve_safetensors_primary(model_dir: &Path) -> Option<PathBuf> {
    if !is_valid_file(&model_dir.join("config.json")) || !is_valid_file(&model_dir.join("tokenizer.json")) {
        return None;
    }

    let mut index_files = Vec::new();
    let mut safetensors_files = Vec::new();

    for entry in std::fs::read_dir(model_dir).ok()?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let lower = path.file_name()?.to_str()?.to_lowercase();
        if lower.ends_with(".safetensors.index.json") {
            if is_valid_file(&path) {
                index_files.push(path);
            }
        } else if lower.ends_with(".safetensors") && is_valid_file(&path) {
            safetensors_files.push(path);
        }
    }

    if index_files.len() == 1 {
        return validate_index_shards(model_dir, &index_files[0]).then(|| index_files.remove(0));
    }
    if !index_files.is_empty() {
        return None; // ambiguous
    }
    if safetensors_files.len() == 1 {
        return Some(safetensors_files.remove(0));
    }
    None
}

impl ModelStorage {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn model_name_to_dir(name: &str) -> String {
        sanitize_model_id(name)
    }

    pub fn dir_name_to_model(dir_name: &str) -> String {
        sanitize_model_id(dir_name)
    }

    fn metadata_override(model_dir: &Path) -> Option<serde_json::Value> {
        let raw = std::fs::read_to_string(model_dir.join("metadata.json")).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn build_descriptor(&self, name: String, model_dir: PathBuf) -> Option<ModelDescriptor> {
        let gguf_path = model_dir.join("model.gguf");
        let (runtime, format, primary_path) = if is_valid_file(&gguf_path) {
            ("llama_cpp".to_string(), "gguf".to_string(), gguf_path)
        } else if let Some(primary) = resolve_safetensors_primary(&model_dir) {
            let runtime = detect_runtime_from_config(&model_dir)?;
            (runtime, "safetensors".to_string(), primary)
        } else {
            return None;
        };

        let metadata = Self::metadata_override(&model_dir);
        let (runtime, format, primary_path) = match &metadata {
            Some(m) => (
                m.get("runtime").and_then(|v| v.as_str()).map(str::to_string).unwrap_or(runtime),
                m.get("format").and_then(|v| v.as_str()).map(str::to_string).unwrap_or(format),
                m.get("primary_path")
                    .and_then(|v| v.as_str())
                    .map(PathBuf::from)
                    .unwrap_or(primary_path),
            ),
            None => (runtime, format, primary_path),
        };

        Some(ModelDescriptor {
            name,
            runtime,
            format,
            primary_path,
            model_dir,
            metadata,
        })
    }

    /// Lists every model detectable under the models directory. Skips
    /// directories that match neither the gguf nor the safetensors shape.
    pub fn list_available_descriptors(&self) -> Vec<ModelDescriptor> {
        let mut out = Vec::new();
        if !self.models_dir.is_dir() {
            return out;
        }
        self.scan_dir(&self.models_dir, &mut out);
        out
    }

    fn scan_dir(&self, dir: &Path, out: &mut Vec<ModelDescriptor>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.models_dir) else {
                continue;
            };
            let name = Self::dir_name_to_model(&relative.to_string_lossy());
            if let Some(descriptor) = self.build_descriptor(name, path.clone()) {
                out.push(descriptor);
            } else {
                self.scan_dir(&path, out);
            }
        }
    }

    pub fn resolve_descriptor(&self, model_name: &str) -> Option<ModelDescriptor> {
        let dir_name = Self::model_name_to_dir(model_name);
        let model_dir = self.models_dir.join(dir_name);
        self.build_descriptor(model_name.to_string(), model_dir)
    }

    pub fn validate_model(&self, model_name: &str) -> bool {
        self.resolve_descriptor(model_name).is_some()
    }

    pub fn delete_model(&self, model_name: &str) -> std::io::Result<()> {
        let dir_name = Self::model_name_to_dir(model_name);
        let model_dir = self.models_dir.join(dir_name);
        if !model_dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(model_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_nested_path_and_lowercases() {
        assert_eq!(sanitize_model_id("openai/GPT-OSS-20b"), "openai/gpt-oss-20b");
        assert_eq!(sanitize_model_id(""), "_latest");
        assert_eq!(sanitize_model_id("../etc/passwd"), "_latest");
    }

    #[test]
    fn resolve_descriptor_finds_gguf() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("qwen");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model.gguf"), b"fake-gguf-bytes").unwrap();

        let storage = ModelStorage::new(dir.path());
        let descriptor = storage.resolve_descriptor("qwen").unwrap();
        assert_eq!(descriptor.runtime, "llama_cpp");
        assert_eq!(descriptor.format, "gguf");
    }

    #[test]
    fn resolve_descriptor_detects_nemotron_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("nemo");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("config.json"), r#"{"architectures":["NemotronForCausalLM"]}"#).unwrap();
        std::fs::write(model_dir.join("tokenizer.json"), "{}").unwrap();
        std::fs::write(model_dir.join("model.safetensors"), b"fake-weights").unwrap();

        let storage = ModelStorage::new(dir.path());
        let descriptor = storage.resolve_descriptor("nemo").unwrap();
        assert_eq!(descriptor.runtime, "nemotron_cpp");
        assert_eq!(descriptor.format, "safetensors");
    }

    #[test]
    fn resolve_descriptor_returns_none_for_incomplete_directory() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("broken");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("config.json"), "{}").unwrap();

        let storage = ModelStorage::new(dir.path());
        assert!(storage.resolve_descriptor("broken").is_none());
    }

    #[test]
    fn metadata_json_overrides_detected_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("custom");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model.gguf"), b"fake-gguf-bytes").unwrap();
        std::fs::write(
            model_dir.join("metadata.json"),
            r#"{"runtime":"my_custom_cpp"}"#,
        )
        .unwrap();

        let storage = ModelStorage::new(dir.path());
        let descriptor = storage.resolve_descriptor("custom").unwrap();
        assert_eq!(descriptor.runtime, "my_custom_cpp");
    }
}
