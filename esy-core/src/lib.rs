//! esy build orchestration core.
//!
//! Given a project sandbox with a resolved dependency installation, this
//! crate plans, schedules and executes isolated package builds, producing
//! content-addressed artifacts in a shared store and the environments needed
//! to invoke tools against them.

pub mod builder;
pub mod config;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod plan;
pub mod sandbox;
pub mod scheduler;


// Re-export commonly used items
pub use builder::{BuildMode, Builder};
pub use config::Config;
pub use error::{AdapterError, AdapterErrorCategory, ErrorExt, EsyError, Result};
pub use graph::{DepKind, Package, PackageGraph, SourceType};
pub use manifest::{BuildManifest, BuildType, Command, CommandList, EnvScope, ManifestHint};
pub use plan::env::Environment;
pub use plan::{BuildPlan, BuildTask, EnvCollision, Planner, TaskEnv};
pub use sandbox::{Installation, Sandbox, SandboxInfo};
pub use scheduler::{BuildOnly, CancelFlag, Force, ProgressReporter, Scheduler};
