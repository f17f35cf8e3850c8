//! Build-task planning.
//!
//! The planner walks the package graph bottom-up and derives, for every
//! package, a content-addressed task id, the store paths keyed by it, and the
//! three environment layers (sandbox, command, build). Exported environment
//! propagates upward through dependents: `local` entries reach direct
//! dependents only, `global` entries are re-exported transitively.

pub mod env;

use crate::config::Config;
use crate::error::Result;
use crate::graph::{DepKind, Package, PackageGraph, PackageIx, SourceType};
use crate::manifest::{BuildType, CommandList, EnvScope};
use env::Environment;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

/// The three environment layers of a task, all closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnv {
    /// Minimal platform environment plus the global exports of the task's
    /// dependency closure.
    pub sandbox: Environment,
    /// Environment for invoking tools against the built artifacts.
    pub command: Environment,
    /// Command environment plus the `cur__*` build-only variables.
    pub build: Environment,
}

/// A fully realized, executable build description for one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    /// Hex digest over the full reproducible input of this build.
    pub id: String,
    pub name: String,
    pub version: String,
    pub source_type: SourceType,
    pub build_type: BuildType,
    /// Build commands followed by install commands.
    pub plan: Vec<CommandList>,
    pub source_path: PathBuf,
    pub build_path: PathBuf,
    pub stage_path: PathBuf,
    pub install_path: PathBuf,
    pub env: TaskEnv,
    /// Ids of dependency tasks, in deterministic edge order.
    pub dependencies: Vec<String>,
}

impl BuildTask {
    /// Human-readable package identity for progress and error output.
    pub fn pkg_id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Planned sandbox: the realized tasks in a flat map keyed by task id, plus
/// the root task's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub root: String,
    pub tasks: BTreeMap<String, BuildTask>,
}

impl BuildPlan {
    pub fn root_task(&self) -> &BuildTask {
        &self.tasks[&self.root]
    }

    pub fn task(&self, id: &str) -> Option<&BuildTask> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Dependency tasks of `task`, in its recorded order.
    pub fn dependencies_of<'a>(
        &'a self,
        task: &'a BuildTask,
    ) -> impl Iterator<Item = &'a BuildTask> {
        task.dependencies.iter().filter_map(|id| self.tasks.get(id))
    }
}

/// Warning recorded when two packages export the same variable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvCollision {
    pub name: String,
    /// Package whose export won.
    pub kept: String,
    /// Package whose export was shadowed.
    pub dropped: String,
}

/// A global export with the provenance needed for collision resolution:
/// depth below the consuming package, and the exporting package's name.
#[derive(Debug, Clone)]
struct ExportEntry {
    value: String,
    depth: usize,
    origin: String,
}

/// Per-node planning output threaded through the post-order fold.
struct NodePlan {
    task_id: String,
    install_path: PathBuf,
    /// Global exports visible to dependents of this node, own exports at
    /// depth 0.
    globals: BTreeMap<String, ExportEntry>,
}

/// Plans build tasks for a package graph under one configuration.
///
/// `dev` selects the dev-sandbox build policy: when set, the root package's
/// `build-dev` commands replace `build`, and the root's dev dependencies are
/// planned.
pub struct Planner<'g> {
    graph: &'g PackageGraph,
    config: &'g Config,
    dev: bool,
    base_env: Environment,
}

impl<'g> Planner<'g> {
    pub fn new(graph: &'g PackageGraph, config: &'g Config, dev: bool) -> Self {
        Self { graph, config, dev, base_env: platform_base_env() }
    }

    /// Replace the platform base environment. Used by tests to keep planned
    /// environments independent of the host.
    pub fn with_base_env(mut self, base_env: Environment) -> Self {
        self.base_env = base_env;
        self
    }

    /// Plan the whole sandbox, returning the realized plan and any exported
    /// environment collisions observed along the way.
    pub fn plan(self) -> Result<(BuildPlan, Vec<EnvCollision>)> {
        let Planner { graph, config, dev, base_env } = self;
        let root_ix = graph.root_ix();

        let mut tasks: BTreeMap<String, BuildTask> = BTreeMap::new();
        let mut warnings: Vec<EnvCollision> = Vec::new();

        let root_plan = graph.fold_post_order(
            root_ix,
            |ix, kind| match kind {
                DepKind::Runtime | DepKind::Build => true,
                DepKind::Dev => dev && ix == root_ix,
            },
            |ix, deps: &[(DepKind, PackageIx, &NodePlan)]| {
                let pkg = graph.package(ix);
                let is_root = ix == root_ix;

                // Global exports arriving from dependency subtrees, one step
                // deeper than where each subtree recorded them.
                let mut dep_globals: BTreeMap<String, ExportEntry> = BTreeMap::new();
                for (_, _, dep_plan) in deps {
                    for (name, entry) in &dep_plan.globals {
                        let promoted = ExportEntry { depth: entry.depth + 1, ..entry.clone() };
                        merge_global(&mut dep_globals, name, promoted, &mut warnings);
                    }
                }

                // Local exports of direct dependencies. A global always wins
                // over a local of the same name; between locals the
                // lexicographically smaller package name wins.
                let mut local_exports: Vec<(String, String)> = Vec::new();
                let mut local_origin: BTreeMap<String, String> = BTreeMap::new();
                for (_, dep_ix, _) in deps {
                    let dep_pkg = graph.package(*dep_ix);
                    for (name, exp) in &dep_pkg.manifest.exported_env {
                        if exp.scope != EnvScope::Local {
                            continue;
                        }
                        if let Some(global) = dep_globals.get(name) {
                            warn!(name = %name, local = %dep_pkg.name, global = %global.origin,
                                "global export shadows local export");
                            warnings.push(EnvCollision {
                                name: name.clone(),
                                kept: global.origin.clone(),
                                dropped: dep_pkg.name.clone(),
                            });
                            continue;
                        }
                        if let Some(origin) = local_origin.get(name) {
                            warn!(name = %name, kept = %origin, dropped = %dep_pkg.name,
                                "conflicting local exports");
                            warnings.push(EnvCollision {
                                name: name.clone(),
                                kept: origin.clone(),
                                dropped: dep_pkg.name.clone(),
                            });
                            continue;
                        }
                        local_origin.insert(name.clone(), dep_pkg.name.clone());
                        local_exports.push((name.clone(), exp.value.clone()));
                    }
                }

                let dep_ids: Vec<String> =
                    deps.iter().map(|(_, _, dep_plan)| dep_plan.task_id.clone()).collect();
                let mut sorted_dep_ids = dep_ids.clone();
                sorted_dep_ids.sort();

                let id = task_digest(pkg, &sorted_dep_ids, config);

                let source_type = pkg.source_type;
                let build_path = config.build_path(source_type, &id);
                let stage_path = config.stage_path(source_type, &id);
                let install_path = config.install_path(source_type, &id);

                let mut sandbox_env = base_env.clone();
                for (name, entry) in &dep_globals {
                    sandbox_env.set(name.clone(), entry.value.clone());
                }

                let mut command_env = sandbox_env.clone();
                let mut build_env = sandbox_env.clone();

                for (name, value) in &local_exports {
                    command_env.set(name.clone(), value.clone());
                    build_env.set(name.clone(), value.clone());
                }

                // Installed dependency binaries go onto PATH.
                for (_, _, dep_plan) in deps {
                    let bin = dep_plan.install_path.join("bin").display().to_string();
                    command_env.set("PATH", bin.clone());
                    build_env.set("PATH", bin);
                }

                // Build-only variables. Builds that mutate their source run
                // from the build copy; out-of-source builds run from the
                // pristine source.
                let cur_root = match pkg.manifest.build_type {
                    BuildType::OutOfSource => &pkg.source_path,
                    BuildType::InSource | BuildType::JbuilderLike | BuildType::Unsafe => {
                        &build_path
                    }
                };
                build_env.set("cur__name", pkg.name.clone());
                build_env.set("cur__version", pkg.version.clone());
                build_env.set("cur__root", cur_root.display().to_string());
                build_env.set("cur__target_dir", build_path.display().to_string());
                build_env.set("cur__install", stage_path.display().to_string());
                build_env.set("cur__stage", stage_path.display().to_string());
                build_env.set("cur__depends", dep_ids.join(" "));
                build_env.set("cur__toplevel", stage_path.join("toplevel").display().to_string());
                for sub in ["bin", "sbin", "lib", "man", "doc", "share", "etc"] {
                    build_env
                        .set(format!("cur__{}", sub), stage_path.join(sub).display().to_string());
                }

                // The package's own build environment binds last so it can
                // reference anything above, including `cur__*`.
                for (name, value) in &pkg.manifest.build_env {
                    command_env.set(name.clone(), value.clone());
                    build_env.set(name.clone(), value.clone());
                }

                let build_commands = if dev && is_root {
                    match &pkg.manifest.build_dev {
                        Some(cmds) => CommandList::Esy(cmds.clone()),
                        None => pkg.manifest.build.clone(),
                    }
                } else {
                    pkg.manifest.build.clone()
                };

                let task = BuildTask {
                    id: id.clone(),
                    name: pkg.name.clone(),
                    version: pkg.version.clone(),
                    source_type,
                    build_type: pkg.manifest.build_type,
                    plan: vec![build_commands, pkg.manifest.install.clone()],
                    source_path: pkg.source_path.clone(),
                    build_path,
                    stage_path,
                    install_path: install_path.clone(),
                    env: TaskEnv {
                        sandbox: sandbox_env.close()?,
                        command: command_env.close()?,
                        build: build_env.close()?,
                    },
                    dependencies: dep_ids,
                };
                tasks.insert(id.clone(), task);

                // Exports visible to this node's dependents: the merged
                // subtree globals plus this package's own.
                let mut globals = dep_globals;
                for (name, exp) in &pkg.manifest.exported_env {
                    if exp.scope == EnvScope::Global {
                        let entry = ExportEntry {
                            value: exp.value.clone(),
                            depth: 0,
                            origin: pkg.name.clone(),
                        };
                        merge_global(&mut globals, name, entry, &mut warnings);
                    }
                }

                Ok(NodePlan { task_id: id, install_path, globals })
            },
        )?;

        Ok((BuildPlan { root: root_plan.task_id, tasks }, warnings))
    }
}

/// Merge a global export into a map, resolving name collisions: the deepest
/// package wins, ties go to the lexicographically smaller package name.
/// Collisions between distinct packages are recorded, never fatal.
fn merge_global(
    map: &mut BTreeMap<String, ExportEntry>,
    name: &str,
    entry: ExportEntry,
    warnings: &mut Vec<EnvCollision>,
) {
    use std::collections::btree_map::Entry;

    match map.entry(name.to_string()) {
        Entry::Vacant(slot) => {
            slot.insert(entry);
        }
        Entry::Occupied(mut slot) => {
            let current = slot.get_mut();
            if current.origin == entry.origin {
                // The same export arriving along two paths of a diamond.
                current.depth = current.depth.max(entry.depth);
                return;
            }

            let replace = entry.depth > current.depth
                || (entry.depth == current.depth && entry.origin < current.origin);
            let (kept, dropped) = if replace {
                (entry.origin.clone(), current.origin.clone())
            } else {
                (current.origin.clone(), entry.origin.clone())
            };
            warn!(name = %name, kept = %kept, dropped = %dropped,
                "conflicting global exports");
            warnings.push(EnvCollision { name: name.to_string(), kept, dropped });
            if replace {
                *current = entry;
            }
        }
    }
}

/// Digest capturing the full reproducible input of a package's build.
fn task_digest(pkg: &Package, sorted_dep_ids: &[String], config: &Config) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pkg.name.as_bytes());
    hasher.update(b"\0");
    hasher.update(pkg.version.as_bytes());
    hasher.update(b"\0");
    hasher.update(pkg.manifest.normalized_json().as_bytes());
    hasher.update(b"\0");
    for id in sorted_dep_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\0");
    }
    for digest in &pkg.patch_digests {
        hasher.update(digest.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(config.store_version.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(pkg.manifest.build_type.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Minimal platform environment every task environment starts from.
fn platform_base_env() -> Environment {
    let mut env = Environment::new();
    env.set(
        "PATH",
        std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
    );
    env.set("SHELL", std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()));
    if let Ok(home) = std::env::var("HOME") {
        env.set("HOME", home);
    }
    if let Ok(term) = std::env::var("TERM") {
        env.set("TERM", term);
    }
    env
}
