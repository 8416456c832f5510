//! Crate-wide error taxonomy
//!
//! Every component returns its own `thiserror` enum for local detail, but
//! the dispatcher boundary and anything crossing into a future HTTP layer
//! needs one flat kind so callers can map to a status code without knowing
//! about every component error type. `ErrorKind` is that kind; `NodeError`
//! pairs it with a human-readable message.

use thiserror::Error;

/// Flat error taxonomy shared across every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ok,
    OomVram,
    OomRam,
    ModelCorrupt,
    Timeout,
    Cancelled,
    Unsupported,
    Internal,
    AbiMismatch,
    LoadFailed,
    NotFound,
    CapabilityUnsupported,
    ServiceUnavailable,
    TooManyRequests,
}

impl ErrorKind {
    /// Only these two kinds are recoverable at the engine-manager level
    /// (evict one LRU model, retry once).
    pub fn is_recoverable_by_eviction(self) -> bool {
        matches!(self, ErrorKind::OomVram | ErrorKind::LoadFailed)
    }

    /// Inverse of [`ErrorKind::as_str`], used to parse a kind name a
    /// plugin engine reports across the FFI boundary.
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "OK" => ErrorKind::Ok,
            "OOM_VRAM" => ErrorKind::OomVram,
            "OOM_RAM" => ErrorKind::OomRam,
            "MODEL_CORRUPT" => ErrorKind::ModelCorrupt,
            "TIMEOUT" => ErrorKind::Timeout,
            "CANCELLED" => ErrorKind::Cancelled,
            "UNSUPPORTED" => ErrorKind::Unsupported,
            "INTERNAL" => ErrorKind::Internal,
            "ABI_MISMATCH" => ErrorKind::AbiMismatch,
            "LOAD_FAILED" => ErrorKind::LoadFailed,
            "NOT_FOUND" => ErrorKind::NotFound,
            "CAPABILITY_UNSUPPORTED" => ErrorKind::CapabilityUnsupported,
            "SERVICE_UNAVAILABLE" => ErrorKind::ServiceUnavailable,
            "TOO_MANY_REQUESTS" => ErrorKind::TooManyRequests,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Ok => "OK",
            ErrorKind::OomVram => "OOM_VRAM",
            ErrorKind::OomRam => "OOM_RAM",
            ErrorKind::ModelCorrupt => "MODEL_CORRUPT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::AbiMismatch => "ABI_MISMATCH",
            ErrorKind::LoadFailed => "LOAD_FAILED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::CapabilityUnsupported => "CAPABILITY_UNSUPPORTED",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::TooManyRequests => "TOO_MANY_REQUESTS",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kinded error with a caller-facing message, used at the dispatcher
/// boundary and anywhere a component error needs to cross into generic
/// handling.
#[derive(Debug, Error, Clone)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn capability_unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapabilityUnsupported, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyRequests, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_and_load_failed_are_recoverable() {
        assert!(ErrorKind::OomVram.is_recoverable_by_eviction());
        assert!(ErrorKind::LoadFailed.is_recoverable_by_eviction());
        assert!(!ErrorKind::Internal.is_recoverable_by_eviction());
        assert!(!ErrorKind::Cancelled.is_recoverable_by_eviction());
    }

    #[test]
    fn from_str_is_inverse_of_as_str() {
        for kind in [
            ErrorKind::Ok,
            ErrorKind::OomVram,
            ErrorKind::ModelCorrupt,
            ErrorKind::CapabilityUnsupported,
            ErrorKind::TooManyRequests,
        ] {
            assert_eq!(ErrorKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_str("NOT_A_REAL_KIND"), None);
    }

    #[test]
    fn display_uses_kind_string() {
        let e = NodeError::not_found("model 'foo' missing");
        assert_eq!(e.to_string(), "NOT_FOUND: model 'foo' missing");
    }
}
