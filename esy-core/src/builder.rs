//! Builder adapter abstraction.
//!
//! The scheduler drives builds through the [`Builder`] trait and treats the
//! implementation as opaque. A conforming adapter, given a realized task,
//! must: materialize the source into the build path, apply patches and
//! substitutions, run the build commands in the build path, run the install
//! commands, and finally rename the stage path to the install path — unless
//! told to skip the install commit for this task. The stage directory is left
//! behind on failure for diagnostics.

use crate::config::Config;
use crate::error::AdapterError;
use crate::manifest::Command;
use crate::plan::BuildTask;
use async_trait::async_trait;

/// What to run inside the task's sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildMode {
    /// Run the task's build and install plan.
    Build,
    /// Drop into an interactive shell inside the build environment.
    BuildShell,
    /// Run an arbitrary command inside the build environment.
    Exec(Command),
}

/// Executes a single package build inside a sandbox.
///
/// Implementations spawn external processes; all methods are async. Tests use
/// a recording fake returning pre-programmed outcomes.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Execute `task` under `mode`. `commit_install` controls whether the
    /// staged artifacts are renamed into the install path on success;
    /// everything else of the build runs either way.
    async fn execute(
        &self,
        config: &Config,
        task: &BuildTask,
        mode: BuildMode,
        commit_install: bool,
    ) -> Result<(), AdapterError>;
}
