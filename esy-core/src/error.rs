//! Error types for the esy build core.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Operations stack a human-readable context string on the way up via
//! [`ErrorExt::with_context`]; the rendered chain is what the user sees on stderr.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for esy operations.
pub type Result<T> = std::result::Result<T, EsyError>;

/// Main error type for the build core.
#[derive(Error, Debug)]
pub enum EsyError {
    // Manifest errors
    #[error("no manifest found at {path:?}")]
    ManifestMissing { path: PathBuf },

    #[error("failed to parse manifest at {path:?}: {message}")]
    ManifestParse { path: PathBuf, message: String },

    // Planning errors
    #[error("cyclic dependency: {}", chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("undefined reference ${name} in environment binding {binding}")]
    UnknownEnvRef { name: String, binding: String },

    // Scheduling errors
    #[error("build of {package} failed")]
    BuildFailed {
        package: String,
        #[source]
        source: AdapterError,
    },

    #[error("build cancelled")]
    Cancelled,

    #[error("store lock for build {id} is held by another process")]
    LockContention { id: String },

    // Cache errors (recovered locally, never fatal)
    #[error("sandbox cache error at {path:?}: {detail}")]
    CacheIo { path: PathBuf, detail: String },

    // File system errors
    #[error("i/o error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Context wrapper, stacked on error construction
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<EsyError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EsyError {
    /// Create an i/o error carrying the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Walk to the innermost error in a context chain.
    pub fn root(&self) -> &EsyError {
        match self {
            EsyError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Error returned by a builder adapter for a single package build.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{category}: {detail}")]
pub struct AdapterError {
    pub category: AdapterErrorCategory,
    pub detail: String,
}

impl AdapterError {
    pub fn new(category: AdapterErrorCategory, detail: impl Into<String>) -> Self {
        Self { category, detail: detail.into() }
    }
}

/// Failure category reported by a builder adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorCategory {
    /// Build or install command exited with a non-zero status.
    ExitNonZero,
    /// The sandboxed process could not be spawned.
    Spawn,
    /// Sandbox setup or teardown failed.
    Sandbox,
    /// A patch failed to apply.
    Patch,
    /// A substitution failed to render.
    Subst,
}

impl AdapterErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterErrorCategory::ExitNonZero => "command exited with non-zero status",
            AdapterErrorCategory::Spawn => "failed to spawn build process",
            AdapterErrorCategory::Sandbox => "sandbox failure",
            AdapterErrorCategory::Patch => "failed to apply patch",
            AdapterErrorCategory::Subst => "failed to render substitution",
        }
    }
}

impl std::fmt::Display for AdapterErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extension trait stacking a context string onto an error result.
pub trait ErrorExt<T> {
    /// Wrap the error with a context line, e.g. `reading package metadata from <path>`.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EsyError::Context { context: f(), source: Box::new(e) })
    }
}
