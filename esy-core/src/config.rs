//! Build configuration and store layout.
//!
//! All store paths go through this module so the planner, scheduler and cache
//! agree on where build, stage and install directories live. Absolute store
//! paths are padded to a fixed length so artifacts with embedded paths stay
//! valid when the store prefix is relocated.

use crate::error::{EsyError, Result};
use crate::graph::SourceType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Store schema version, bumped when the store layout changes.
pub const STORE_VERSION: u32 = 3;

/// Target length absolute store paths are padded to.
const STORE_PATH_PADDED_LENGTH: usize = 108;

/// Environment variable overriding the default prefix path.
pub const ESY_PREFIX_VAR: &str = "ESY__PREFIX";

/// Environment variable overriding the default sandbox path.
pub const ESY_SANDBOX_VAR: &str = "ESY__SANDBOX";

/// Environment variable selecting the log level. Read by the logging setup
/// of the embedding tool, not by this crate.
pub const ESY_LOG_VAR: &str = "ESY__LOG";

/// Resolved configuration for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Prefix directory holding the global store (default `~/.esy`).
    pub prefix_path: PathBuf,

    /// Global content-addressed store, `prefix_path/<store version><pad>`.
    /// The version directory name carries the padding, so the store path and
    /// everything under it sit at a fixed length regardless of the prefix.
    pub store_path: PathBuf,

    /// Per-sandbox store for transient (linked) packages.
    pub local_store_path: PathBuf,

    /// Project sandbox root.
    pub sandbox_path: PathBuf,

    /// Version of the esy tool, part of the sandbox cache identity.
    pub esy_version: String,

    /// Store schema version, part of every task id.
    pub store_version: u32,

    /// Pad appended to the store version directory name, bringing
    /// `store_path` to the fixed target length.
    pub store_padding: String,
}

impl Config {
    /// Create a configuration from explicit prefix and sandbox paths.
    pub fn new(
        prefix_path: impl Into<PathBuf>,
        sandbox_path: impl Into<PathBuf>,
        esy_version: impl Into<String>,
    ) -> Self {
        let prefix_path = prefix_path.into();
        let sandbox_path = sandbox_path.into();
        let store_padding = store_padding(&prefix_path);
        let store_path = prefix_path.join(format!("{}{}", STORE_VERSION, store_padding));
        let local_store_path = sandbox_path.join("node_modules/.cache/_esy/store");

        Self {
            prefix_path,
            store_path,
            local_store_path,
            sandbox_path,
            esy_version: esy_version.into(),
            store_version: STORE_VERSION,
            store_padding,
        }
    }

    /// Create a configuration from the environment.
    ///
    /// Resolution order:
    /// 1. `ESY__PREFIX` / `ESY__SANDBOX` environment variables
    /// 2. `~/.esy` for the prefix, the current directory for the sandbox
    pub fn from_env(esy_version: impl Into<String>) -> Result<Self> {
        let prefix_path = match std::env::var_os(ESY_PREFIX_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?
                .join(".esy"),
        };

        let sandbox_path = match std::env::var_os(ESY_SANDBOX_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()
                .map_err(|e| EsyError::io(PathBuf::from("."), e))?,
        };

        Ok(Self::new(prefix_path, sandbox_path, esy_version))
    }

    /// Store root holding artifacts for the given source type.
    ///
    /// Transient sources live in the per-sandbox local store; everything else
    /// goes to the global store.
    pub fn store_for(&self, source_type: SourceType) -> &Path {
        match source_type {
            SourceType::Transient => &self.local_store_path,
            SourceType::Immutable | SourceType::ImmutableWithTransient => &self.store_path,
        }
    }

    /// Build working directory for a task, `<store>/b/<id>`.
    pub fn build_path(&self, source_type: SourceType, id: &str) -> PathBuf {
        self.store_for(source_type).join("b").join(id)
    }

    /// Stage directory for a task, `<store>/s/<id>`. Renamed to the install
    /// path on full success.
    pub fn stage_path(&self, source_type: SourceType, id: &str) -> PathBuf {
        self.store_for(source_type).join("s").join(id)
    }

    /// Installed artifact directory for a task, `<store>/i/<id>`.
    pub fn install_path(&self, source_type: SourceType, id: &str) -> PathBuf {
        self.store_for(source_type).join("i").join(id)
    }

    /// Advisory lock file guarding a single task's build, `<store>/b/<id>.lock`.
    pub fn lock_path(&self, source_type: SourceType, id: &str) -> PathBuf {
        self.store_for(source_type).join("b").join(format!("{}.lock", id))
    }
}

/// Compute the pad bringing `prefix_path/<store version>` up to the fixed
/// target length.
///
/// An empty pad is returned when the unpadded store path is already at or
/// beyond the target; such stores are not length-stable.
fn store_padding(prefix_path: &Path) -> String {
    let len = prefix_path.as_os_str().len() + 1 + STORE_VERSION.to_string().len();
    if len >= STORE_PATH_PADDED_LENGTH {
        String::new()
    } else {
        "_".repeat(STORE_PATH_PADDED_LENGTH - len)
    }
}
