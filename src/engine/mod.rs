//! Inference engine abstraction: the trait every backend implements, the
//! registry that resolves a model descriptor to a concrete engine, the
//! plugin host that loads external engines, and the built-in engine set
//! registered before any plugin.

pub mod builtin;
pub mod interface;
pub mod plugin_host;
pub mod registry;

pub use interface::{
    Capability, Engine, EngineError, EngineErrorKind, EngineResult, GenerationParams, LoadResult,
    STREAM_DONE_SENTINEL,
};
pub use plugin_host::{PluginHost, PluginLoadError, PluginManifest, HOST_ABI_VERSION};
pub use registry::{EngineRegistration, EngineRegistry, EngineSource, RegistrationError, ResolutionError};
