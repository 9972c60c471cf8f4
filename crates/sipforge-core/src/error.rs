//! Error types for SIP Forge.
//!
//! Errors are grouped by the unit they belong to: selection errors reject a rule
//! before any walk starts, traversal and resolution errors are recorded against a
//! single entry or preview, packaging errors mark a single SIP unsuccessful.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the SIP Forge engine.
#[derive(Debug, Error)]
pub enum SipError {
    // Selection errors
    #[error("Invalid selection: {message}")]
    InvalidSelection { message: String },

    #[error("Folder depth {requested} out of range (0..={max})")]
    DepthOutOfRange { requested: usize, max: usize },

    #[error("Unknown classification node: {0}")]
    UnknownNode(String),

    // Traversal errors
    #[error("Traversal failed at {path:?}: {message}")]
    Traversal { path: PathBuf, message: String },

    // Metadata resolution errors
    #[error("No metadata file matching {pattern} in {dir:?}")]
    MetadataNotFound { dir: PathBuf, pattern: String },

    #[error("Ambiguous metadata for {dir:?}: {candidates:?}")]
    MetadataAmbiguous {
        dir: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("Metadata template not found: {0}")]
    TemplateNotFound(String),

    // Packaging errors
    #[error("Packaging failed for SIP {sip_id}: {message}")]
    Packaging { sip_id: String, message: String },

    #[error("Archive error: {message}")]
    Archive {
        message: String,
        #[source]
        source: Option<zip::result::ZipError>,
    },

    #[error("XML error: {0}")]
    Xml(String),

    // Rule lifecycle errors
    #[error("Rule {rule_id} cannot go from {from} to {to}")]
    InvalidTransition {
        rule_id: String,
        from: String,
        to: String,
    },

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("SIP not found: {0}")]
    SipNotFound(String),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for SIP Forge operations.
pub type Result<T> = std::result::Result<T, SipError>;

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SipError {
    fn from(err: serde_json::Error) -> Self {
        SipError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<walkdir::Error> for SipError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        SipError::Traversal {
            path,
            message: err.to_string(),
        }
    }
}

impl From<zip::result::ZipError> for SipError {
    fn from(err: zip::result::ZipError) -> Self {
        SipError::Archive {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<quick_xml::DeError> for SipError {
    fn from(err: quick_xml::DeError) -> Self {
        SipError::Xml(err.to_string())
    }
}

impl From<globset::Error> for SipError {
    fn from(err: globset::Error) -> Self {
        SipError::InvalidPattern {
            pattern: err.glob().unwrap_or_default().to_string(),
            message: err.kind().to_string(),
        }
    }
}

impl SipError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            return SipError::FileNotFound(path);
        }
        SipError::Io {
            message: err.to_string(),
            path: Some(path),
            source: Some(err),
        }
    }

    /// Error for a worker that panicked, keeping the panic message.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        SipError::WorkerPanicked(message)
    }

    /// Whether this error belongs to a single file, preview or SIP.
    ///
    /// Unit-scoped errors are recorded and the surrounding operation continues.
    pub fn is_unit_scoped(&self) -> bool {
        matches!(
            self,
            SipError::Traversal { .. }
                | SipError::MetadataNotFound { .. }
                | SipError::MetadataAmbiguous { .. }
                | SipError::TemplateNotFound(_)
                | SipError::Packaging { .. }
                | SipError::Archive { .. }
                | SipError::Xml(_)
                | SipError::Io { .. }
                | SipError::FileNotFound(_)
                | SipError::WorkerPanicked(_)
        )
    }

    /// Whether this error rejects a selection before any walk starts.
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self,
            SipError::InvalidSelection { .. }
                | SipError::DepthOutOfRange { .. }
                | SipError::UnknownNode(_)
        )
    }
}
