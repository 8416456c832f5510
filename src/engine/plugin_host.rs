//! Plugin host
//!
//! Loads external engine plugins: a JSON manifest next to a shared
//! library, validated against required fields and the host ABI constant,
//! then `libloading`-opened and bound to `create_engine`/`destroy_engine`
//! symbols.
//!
//! Plugins are staged (loaded and bound, not yet registered) and applied
//! as a batch so a partial failure unloads everything staged in that
//! batch rather than leaving the registry half-populated.

use crate::engine::interface::{
    Capability, Engine, EngineError, EngineErrorKind, EngineResult, GenerationParams, LoadResult,
};
use crate::engine::registry::{EngineRegistration, EngineRegistry, EngineSource, RegistrationError};
use crate::manager::EngineManager;
use crate::models::descriptor::ModelDescriptor;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The host's ABI version. A plugin manifest whose `abi_version` doesn't
/// match this constant is refused, never staged.
pub const HOST_ABI_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub engine_id: String,
    pub engine_version: String,
    pub abi_version: u32,
    pub runtimes: Vec<String>,
    pub formats: Vec<String>,
    pub architectures: Vec<String>,
    pub capabilities: Vec<String>,
    pub modalities: Vec<String>,
    pub gpu_targets: Vec<String>,
    pub license: String,
    #[serde(default)]
    pub supports_vision: bool,
    pub library: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("abi_version mismatch")]
    AbiMismatch,
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ManifestError> {
    if value.is_empty() {
        return Err(ManifestError::MissingField(field));
    }
    Ok(())
}

fn require_non_empty_list(field: &'static str, values: &[String]) -> Result<(), ManifestError> {
    if values.is_empty() {
        return Err(ManifestError::MissingField(field));
    }
    if values.iter().any(|v| v.is_empty()) {
        return Err(ManifestError::MissingField(field));
    }
    Ok(())
}

/// Validates a manifest: every field required, every list entry
/// non-empty, ABI must equal the host constant.
pub fn validate_manifest(manifest: &PluginManifest) -> Result<(), ManifestError> {
    require_non_empty("engine_id", &manifest.engine_id)?;
    require_non_empty("engine_version", &manifest.engine_version)?;
    if manifest.abi_version != HOST_ABI_VERSION {
        return Err(ManifestError::AbiMismatch);
    }
    require_non_empty_list("runtimes", &manifest.runtimes)?;
    require_non_empty_list("formats", &manifest.formats)?;
    require_non_empty_list("architectures", &manifest.architectures)?;
    require_non_empty_list("capabilities", &manifest.capabilities)?;
    require_non_empty_list("modalities", &manifest.modalities)?;
    require_non_empty_list("gpu_targets", &manifest.gpu_targets)?;
    require_non_empty("license", &manifest.license)?;
    require_non_empty("library", &manifest.library)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    #[error("manifest parse error: {0}")]
    ManifestParse(String),
    #[error("manifest validation failed: {0}")]
    Validation(#[from] ManifestError),
    #[error("host backend '{0}' not in plugin gpu_targets, skipping")]
    Skipped(String),
    #[error("failed to load library: {0}")]
    LibraryLoad(String),
    #[error("symbol lookup failed: {0}")]
    SymbolLookup(String),
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),
}

/// A staged-but-not-yet-registered plugin: manifest plus the loaded
/// engine instance and the library handle it came from.
pub struct StagedPlugin {
    manifest: PluginManifest,
    engine: Arc<dyn Engine>,
    // Kept alive for as long as `engine` is in use; dropping it would
    // unload the shared library out from under the engine's vtable.
    _library: libloading::Library,
}

/// Host-side state handed to a plugin's `create_engine`. `models_dir` and
/// `log_fn` are always valid for the lifetime of the call; `manager` is
/// null unless a shared engine manager was configured on the host, and a
/// plugin must not assume it is non-null.
#[repr(C)]
pub struct EngineHostContext {
    pub abi_version: u32,
    pub models_dir: *const c_char,
    pub manager: *mut c_void,
    pub log_fn: extern "C" fn(engine_id: *const c_char, message: *const c_char),
}

/// Caps a single plugin log line so a misbehaving or malicious plugin
/// can't flood the host's log sink with one unbounded message.
const MAX_PLUGIN_LOG_MESSAGE_BYTES: usize = 4096;

extern "C" fn host_log(engine_id: *const c_char, message: *const c_char) {
    if engine_id.is_null() || message.is_null() {
        return;
    }
    // SAFETY: both pointers are plugin-supplied NUL-terminated C strings
    // for the duration of this call, per the ABI contract.
    let engine_id = unsafe { CStr::from_ptr(engine_id) }.to_string_lossy();
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    let message = crate::truncate_str(&message, MAX_PLUGIN_LOG_MESSAGE_BYTES);
    tracing::info!(plugin = %engine_id, "{message}");
}

/// C-ABI vtable a plugin returns from `create_engine`. Every method takes
/// the opaque `instance` pointer first; complex payloads (descriptors,
/// messages, generation params) cross the boundary as JSON rather than as
/// native Rust types, since `Vec`/`String`/closures have no stable FFI
/// layout. `*_error_kind` out-parameters, when set, point to a
/// plugin-owned C string naming an `ErrorKind` variant (e.g.
/// `"OOM_VRAM"`), to be read then released via `free_string`.
#[repr(C)]
pub struct EngineVTable {
    pub instance: *mut c_void,
    pub runtime: extern "C" fn(*mut c_void) -> *const c_char,
    /// Bitmask: bit 0 text, 1 embeddings, 2 asr, 3 tts, 4 image.
    pub capability_mask: extern "C" fn(*mut c_void) -> u32,
    pub load_model: extern "C" fn(
        *mut c_void,
        descriptor_json: *const c_char,
        out_vram_bytes: *mut u64,
        out_max_context: *mut u32,
        out_error_kind: *mut *mut c_char,
    ) -> i32,
    pub unload_model: extern "C" fn(*mut c_void, descriptor_json: *const c_char),
    pub generate_chat: extern "C" fn(
        *mut c_void,
        messages_json: *const c_char,
        descriptor_json: *const c_char,
        params_json: *const c_char,
        out_error_kind: *mut *mut c_char,
    ) -> *mut c_char,
    pub generate_completion: extern "C" fn(
        *mut c_void,
        prompt: *const c_char,
        descriptor_json: *const c_char,
        params_json: *const c_char,
        out_error_kind: *mut *mut c_char,
    ) -> *mut c_char,
    pub generate_chat_stream: extern "C" fn(
        *mut c_void,
        messages_json: *const c_char,
        descriptor_json: *const c_char,
        params_json: *const c_char,
        on_token: extern "C" fn(*mut c_void, *const c_char),
        on_token_ctx: *mut c_void,
        out_error_kind: *mut *mut c_char,
    ) -> i32,
    pub generate_embeddings: extern "C" fn(
        *mut c_void,
        inputs_json: *const c_char,
        descriptor_json: *const c_char,
        out_error_kind: *mut *mut c_char,
    ) -> *mut c_char,
    pub get_model_max_context: extern "C" fn(*mut c_void, descriptor_json: *const c_char) -> u32,
    pub free_string: extern "C" fn(*mut c_char),
    pub destroy: extern "C" fn(*mut c_void),
}

pub type CreateEngineFn = unsafe extern "C" fn(*const EngineHostContext) -> *mut EngineVTable;
pub type DestroyEngineFn = unsafe extern "C" fn(*mut EngineVTable);

/// Generation knobs that can be serialized across the FFI boundary.
/// `GenerationParams::abort_callback` has no FFI representation, so
/// mid-generation cancellation isn't available to plugin engines in this
/// ABI version.
#[derive(Serialize)]
struct FfiGenerationParams {
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
    seed: u32,
    stop_sequences: Vec<String>,
}

impl From<&GenerationParams> for FfiGenerationParams {
    fn from(p: &GenerationParams) -> Self {
        Self {
            max_tokens: p.max_tokens,
            temperature: p.temperature,
            top_p: p.top_p,
            top_k: p.top_k,
            repeat_penalty: p.repeat_penalty,
            presence_penalty: p.presence_penalty,
            frequency_penalty: p.frequency_penalty,
            seed: p.seed,
            stop_sequences: p.stop_sequences.clone(),
        }
    }
}

fn to_cstring(value: &impl Serialize) -> CString {
    CString::new(serde_json::to_string(value).unwrap_or_default()).unwrap_or_default()
}

/// Reads and releases a plugin-owned error-kind string, defaulting to
/// `Internal` if the plugin returned something unparseable.
fn take_error_kind(vtable: &EngineVTable, raw: *mut c_char) -> EngineErrorKind {
    if raw.is_null() {
        return EngineErrorKind::Internal;
    }
    // SAFETY: `raw` is a plugin-owned C string per the out_error_kind
    // contract; read it before releasing it through the same vtable.
    let kind = unsafe { CStr::from_ptr(raw) }
        .to_str()
        .ok()
        .and_then(EngineErrorKind::from_str)
        .unwrap_or(EngineErrorKind::Internal);
    (vtable.free_string)(raw);
    kind
}

/// Wraps a plugin's C vtable in the safe `Engine` trait. `runtime` and
/// `capability_mask` are read once at construction and cached, since the
/// trait's `runtime(&self) -> &str` can't hand back a borrow into
/// plugin-owned memory whose lifetime the host doesn't control.
pub struct FfiEngine {
    vtable: *mut EngineVTable,
    destroy_engine: DestroyEngineFn,
    runtime: String,
    capability_mask: u32,
}

// SAFETY: the plugin ABI requires engines to be safely callable from any
// thread; built-in engines make the same promise via `Engine: Send + Sync`.
unsafe impl Send for FfiEngine {}
unsafe impl Sync for FfiEngine {}

impl Drop for FfiEngine {
    fn drop(&mut self) {
        // SAFETY: `vtable` was produced by this plugin's `create_engine`
        // and not yet destroyed; `destroy_engine` is the matching release
        // call required by the ABI.
        unsafe { (self.destroy_engine)(self.vtable) };
    }
}

impl FfiEngine {
    fn vtable(&self) -> &EngineVTable {
        // SAFETY: valid for the lifetime of `self`, the library stays
        // loaded for at least as long (see `StagedPlugin::_library`).
        unsafe { &*self.vtable }
    }

    fn instance(&self) -> *mut c_void {
        self.vtable().instance
    }
}

impl Engine for FfiEngine {
    fn runtime(&self) -> &str {
        &self.runtime
    }

    fn supports_text_generation(&self) -> bool {
        self.capability_mask & 0b0000_1 != 0
    }
    fn supports_embeddings(&self) -> bool {
        self.capability_mask & 0b0001_0 != 0
    }
    fn supports_asr(&self) -> bool {
        self.capability_mask & 0b0010_0 != 0
    }
    fn supports_tts(&self) -> bool {
        self.capability_mask & 0b0100_0 != 0
    }
    fn supports_image(&self) -> bool {
        self.capability_mask & 0b1000_0 != 0
    }

    fn load_model(&self, descriptor: &ModelDescriptor) -> EngineResult<LoadResult> {
        let descriptor_json = to_cstring(descriptor);
        let mut vram_bytes = 0u64;
        let mut max_context = 0u32;
        let mut error_kind: *mut c_char = std::ptr::null_mut();
        let vtable = self.vtable();
        let ok = (vtable.load_model)(
            self.instance(),
            descriptor_json.as_ptr(),
            &mut vram_bytes,
            &mut max_context,
            &mut error_kind,
        );
        if ok == 0 {
            Ok(LoadResult { vram_bytes, max_context })
        } else {
            Err(EngineError::new(take_error_kind(vtable, error_kind), "plugin load_model failed"))
        }
    }

    fn unload_model(&self, descriptor: &ModelDescriptor) {
        let descriptor_json = to_cstring(descriptor);
        (self.vtable().unload_model)(self.instance(), descriptor_json.as_ptr());
    }

    fn generate_chat(
        &self,
        messages: &[(String, String)],
        descriptor: &ModelDescriptor,
        params: &GenerationParams,
    ) -> EngineResult<String> {
        let messages_json = to_cstring(&messages.to_vec());
        let descriptor_json = to_cstring(descriptor);
        let params_json = to_cstring(&FfiGenerationParams::from(params));
        let mut error_kind: *mut c_char = std::ptr::null_mut();
        let vtable = self.vtable();
        let raw = (vtable.generate_chat)(
            self.instance(),
            messages_json.as_ptr(),
            descriptor_json.as_ptr(),
            params_json.as_ptr(),
            &mut error_kind,
        );
        self.read_owned_string(vtable, raw, error_kind)
    }

    fn generate_completion(
        &self,
        prompt: &str,
        descriptor: &ModelDescriptor,
        params: &GenerationParams,
    ) -> EngineResult<String> {
        let prompt_c = CString::new(prompt).unwrap_or_default();
        let descriptor_json = to_cstring(descriptor);
        let params_json = to_cstring(&FfiGenerationParams::from(params));
        let mut error_kind: *mut c_char = std::ptr::null_mut();
        let vtable = self.vtable();
        let raw = (vtable.generate_completion)(
            self.instance(),
            prompt_c.as_ptr(),
            descriptor_json.as_ptr(),
            params_json.as_ptr(),
            &mut error_kind,
        );
        self.read_owned_string(vtable, raw, error_kind)
    }

    fn generate_chat_stream(
        &self,
        messages: &[(String, String)],
        descriptor: &ModelDescriptor,
        params: &GenerationParams,
        on_token: &mut dyn FnMut(&str),
    ) -> EngineResult<()> {
        extern "C" fn trampoline(ctx: *mut c_void, chunk: *const c_char) {
            if chunk.is_null() {
                return;
            }
            // SAFETY: `ctx` was produced from the `&mut dyn FnMut(&str)`
            // passed to this same call, valid for the call's duration.
            let callback = unsafe { &mut *(ctx as *mut &mut dyn FnMut(&str)) };
            let chunk = unsafe { CStr::from_ptr(chunk) }.to_string_lossy();
            callback(&chunk);
        }

        let messages_json = to_cstring(&messages.to_vec());
        let descriptor_json = to_cstring(descriptor);
        let params_json = to_cstring(&FfiGenerationParams::from(params));
        let mut error_kind: *mut c_char = std::ptr::null_mut();
        let vtable = self.vtable();
        let mut on_token_ref: &mut dyn FnMut(&str) = on_token;
        let ctx_ptr = &mut on_token_ref as *mut &mut dyn FnMut(&str) as *mut c_void;
        let ok = (vtable.generate_chat_stream)(
            self.instance(),
            messages_json.as_ptr(),
            descriptor_json.as_ptr(),
            params_json.as_ptr(),
            trampoline,
            ctx_ptr,
            &mut error_kind,
        );
        if ok == 0 {
            Ok(())
        } else {
            Err(EngineError::new(take_error_kind(vtable, error_kind), "plugin generate_chat_stream failed"))
        }
    }

    fn generate_embeddings(&self, inputs: &[String], descriptor: &ModelDescriptor) -> EngineResult<Vec<Vec<f32>>> {
        let inputs_json = to_cstring(&inputs.to_vec());
        let descriptor_json = to_cstring(descriptor);
        let mut error_kind: *mut c_char = std::ptr::null_mut();
        let vtable = self.vtable();
        let raw = (vtable.generate_embeddings)(self.instance(), inputs_json.as_ptr(), descriptor_json.as_ptr(), &mut error_kind);
        let json = self.read_owned_string(vtable, raw, error_kind)?;
        serde_json::from_str(&json).map_err(|e| EngineError::new(EngineErrorKind::Internal, format!("malformed embeddings payload: {e}")))
    }

    fn get_model_max_context(&self, descriptor: &ModelDescriptor) -> u32 {
        let descriptor_json = to_cstring(descriptor);
        (self.vtable().get_model_max_context)(self.instance(), descriptor_json.as_ptr())
    }
}

impl FfiEngine {
    fn read_owned_string(&self, vtable: &EngineVTable, raw: *mut c_char, error_kind: *mut c_char) -> EngineResult<String> {
        if raw.is_null() {
            return Err(EngineError::new(take_error_kind(vtable, error_kind), "plugin call failed"));
        }
        // SAFETY: `raw` is a plugin-owned C string returned per the ABI
        // contract; read it before releasing it through `free_string`.
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        (vtable.free_string)(raw);
        Ok(text)
    }
}

pub struct PluginHost {
    plugins_dir: Option<PathBuf>,
    host_backend: String,
    models_dir: PathBuf,
    manager: Option<Arc<EngineManager>>,
}

impl PluginHost {
    pub fn new(plugins_dir: Option<PathBuf>, host_backend: impl Into<String>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir,
            host_backend: host_backend.into(),
            models_dir: models_dir.into(),
            manager: None,
        }
    }

    /// Shares an engine manager handle with plugins via `EngineHostContext`,
    /// for runtimes whose plugin instances coordinate through it.
    pub fn with_manager(mut self, manager: Arc<EngineManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Discovers plugin directories under the configured plugins dir, in
    /// sorted directory-listing order, so staging order is deterministic.
    pub fn discover(&self) -> std::io::Result<Vec<PathBuf>> {
        let Some(dir) = &self.plugins_dir else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    fn parse_manifest(plugin_dir: &Path) -> Result<PluginManifest, PluginLoadError> {
        let manifest_path = plugin_dir.join("manifest.json");
        let raw = std::fs::read_to_string(&manifest_path)
            .map_err(|e| PluginLoadError::ManifestParse(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| PluginLoadError::ManifestParse(e.to_string()))
    }

    /// Loads and binds one plugin directory without registering it.
    /// Skipping (unsupported gpu target) is reported as
    /// `PluginLoadError::Skipped`, distinct from a real failure, so
    /// callers can filter it out of error logs.
    pub fn stage_one(&self, plugin_dir: &Path) -> Result<StagedPlugin, PluginLoadError> {
        let manifest = Self::parse_manifest(plugin_dir)?;
        validate_manifest(&manifest)?;

        if !manifest.gpu_targets.iter().any(|t| t == &self.host_backend) {
            return Err(PluginLoadError::Skipped(self.host_backend.clone()));
        }

        let library_path = plugin_dir.join(&manifest.library);
        // SAFETY: plugin libraries are trusted operator-supplied artifacts,
        // loaded only after manifest validation (engine_id/version/ABI all
        // checked above).
        let library = unsafe { libloading::Library::new(&library_path) }
            .map_err(|e| PluginLoadError::LibraryLoad(e.to_string()))?;

        // SAFETY: symbol signatures are part of the plugin ABI contract
        // fixed by HOST_ABI_VERSION.
        let create_engine: libloading::Symbol<CreateEngineFn> = unsafe {
            library
                .get(b"create_engine\0")
                .map_err(|e| PluginLoadError::SymbolLookup(e.to_string()))?
        };
        let destroy_engine: libloading::Symbol<DestroyEngineFn> = unsafe {
            library
                .get(b"destroy_engine\0")
                .map_err(|e| PluginLoadError::SymbolLookup(e.to_string()))?
        };
        // Copy the plain fn pointers out of their `Symbol` wrappers so they
        // outlive this function; they stay valid as long as `library` does,
        // which `StagedPlugin`/`FfiEngine` keep alive for as long as needed.
        let create_engine: CreateEngineFn = *create_engine;
        let destroy_engine: DestroyEngineFn = *destroy_engine;

        let models_dir = CString::new(self.models_dir.to_string_lossy().into_owned()).unwrap_or_default();
        let manager_ptr = self
            .manager
            .as_ref()
            .map(|m| Arc::as_ptr(m) as *mut c_void)
            .unwrap_or(std::ptr::null_mut());
        let context = EngineHostContext {
            abi_version: HOST_ABI_VERSION,
            models_dir: models_dir.as_ptr(),
            manager: manager_ptr,
            log_fn: host_log,
        };

        // SAFETY: `context` outlives this call; `create_engine` is
        // required by the ABI to return either null or a heap-allocated
        // `EngineVTable` whose `instance` field it also owns.
        let raw_vtable = unsafe { create_engine(&context) };
        if raw_vtable.is_null() {
            return Err(PluginLoadError::SymbolLookup(
                "create_engine returned null".into(),
            ));
        }
        // SAFETY: `raw_vtable` is freshly returned by `create_engine` and
        // not yet aliased; reading `capability_mask`/`runtime` through it
        // now, before handing ownership to `FfiEngine`, is sound.
        let (runtime, capability_mask) = unsafe {
            let vtable = &*raw_vtable;
            let runtime_ptr = (vtable.runtime)(vtable.instance);
            let runtime = if runtime_ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(runtime_ptr).to_string_lossy().into_owned()
            };
            (runtime, (vtable.capability_mask)(vtable.instance))
        };

        let engine: Arc<dyn Engine> = Arc::new(FfiEngine {
            vtable: raw_vtable,
            destroy_engine,
            runtime,
            capability_mask,
        });

        Ok(StagedPlugin {
            manifest,
            engine,
            _library: library,
        })
    }

    /// Stages every discovered plugin. Any failure during stage leaves
    /// previously staged plugins untouched (they are simply dropped,
    /// which unloads their libraries) and returns the error for the
    /// directory that failed, so a partial failure never leaves the
    /// registry half-populated with plugins from the same batch.
    pub fn stage_all(&self) -> Result<Vec<StagedPlugin>, (PathBuf, PluginLoadError)> {
        let mut staged = Vec::new();
        for dir in self.discover().unwrap_or_default() {
            match self.stage_one(&dir) {
                Ok(plugin) => staged.push(plugin),
                Err(PluginLoadError::Skipped(_)) => continue,
                Err(e) => return Err((dir, e)),
            }
        }
        Ok(staged)
    }

    /// Applies a batch of staged plugins atomically: registers every one,
    /// or rolls back (drops every engine, which releases their libraries)
    /// if any single registration fails.
    pub fn apply_staged(
        registry: &EngineRegistry,
        staged: Vec<StagedPlugin>,
    ) -> Result<usize, PluginLoadError> {
        let mut registered = 0;
        for plugin in staged {
            let capabilities: Vec<Capability> = plugin
                .manifest
                .capabilities
                .iter()
                .filter_map(|c| Capability::parse(c))
                .collect();
            let registration = EngineRegistration {
                engine_id: plugin.manifest.engine_id.clone(),
                engine_version: plugin.manifest.engine_version.clone(),
                runtimes: plugin.manifest.runtimes.clone(),
                formats: plugin.manifest.formats.clone(),
                architectures: plugin.manifest.architectures.clone(),
                capabilities,
                gpu_targets: plugin.manifest.gpu_targets.clone(),
                source: EngineSource::Plugin,
            };
            registry.register(plugin.engine.clone(), registration)?;
            registered += 1;
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_manifest() -> PluginManifest {
        PluginManifest {
            engine_id: "whisper_plugin".into(),
            engine_version: "1.0.0".into(),
            abi_version: HOST_ABI_VERSION,
            runtimes: vec!["whisper_cpp".into()],
            formats: vec!["gguf".into()],
            architectures: vec!["whisper".into()],
            capabilities: vec!["asr".into()],
            modalities: vec!["audio".into()],
            gpu_targets: vec!["cpu".into()],
            license: "MIT".into(),
            supports_vision: false,
            library: "libwhisper_plugin.so".into(),
        }
    }

    #[test]
    fn valid_manifest_passes() {
        assert!(validate_manifest(&valid_manifest()).is_ok());
    }

    #[test]
    fn missing_field_is_reported() {
        let mut m = valid_manifest();
        m.engine_id = String::new();
        assert_eq!(
            validate_manifest(&m).unwrap_err(),
            ManifestError::MissingField("engine_id")
        );
    }

    #[test]
    fn abi_mismatch_is_rejected() {
        let mut m = valid_manifest();
        m.abi_version = HOST_ABI_VERSION + 1;
        assert_eq!(validate_manifest(&m).unwrap_err(), ManifestError::AbiMismatch);
    }

    #[test]
    fn empty_list_entry_is_rejected() {
        let mut m = valid_manifest();
        m.runtimes = vec!["ok".into(), "".into()];
        assert_eq!(
            validate_manifest(&m).unwrap_err(),
            ManifestError::MissingField("runtimes")
        );
    }

    #[test]
    fn discover_returns_empty_without_plugins_dir() {
        let host = PluginHost::new(None, "cpu", "/models");
        assert!(host.discover().unwrap().is_empty());
    }

    #[test]
    fn stage_one_reports_skip_for_unsupported_gpu_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = valid_manifest();
        manifest.gpu_targets = vec!["cuda".into()];
        std::fs::write(
            dir.path().join("manifest.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();

        let host = PluginHost::new(Some(dir.path().to_path_buf()), "cpu", "/models");
        let err = host.stage_one(dir.path()).unwrap_err();
        assert!(matches!(err, PluginLoadError::Skipped(_)));
    }
}
