//! Build overrides and their fold onto a manifest.
//!
//! Overrides form an ordered stack pushed in discovery order; folding applies
//! them left to right, so the outermost override wins. Every field application
//! is total: an override never fails to apply.

use super::{BuildManifest, BuildType, Command, CommandList, ExportedEnv};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A layered patch modifying specific fields of a build manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOverride {
    pub build_type: Option<BuildType>,
    pub build: Option<Vec<Command>>,
    pub install: Option<Vec<Command>>,
    pub build_dev: Option<Vec<Command>>,
    pub exported_env: Option<BTreeMap<String, ExportedEnv>>,
    pub exported_env_override: Option<EnvMapDiff<ExportedEnv>>,
    pub build_env: Option<BTreeMap<String, String>>,
    pub build_env_override: Option<EnvMapDiff<String>>,
}

/// A three-operation diff against an environment mapping, applied in the
/// order remove, add, update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvMapDiff<V> {
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub add: BTreeMap<String, V>,
    #[serde(default)]
    pub update: BTreeMap<String, V>,
}

impl<V: Clone> EnvMapDiff<V> {
    fn apply(&self, map: &mut BTreeMap<String, V>) {
        for key in &self.remove {
            map.remove(key);
        }
        for (key, value) in &self.add {
            map.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.update {
            map.insert(key.clone(), value.clone());
        }
    }
}

/// Apply a single override to a manifest.
pub fn apply(mut manifest: BuildManifest, ov: &BuildOverride) -> BuildManifest {
    if let Some(build_type) = ov.build_type {
        manifest.build_type = build_type;
    }
    if let Some(build) = &ov.build {
        manifest.build = CommandList::Esy(build.clone());
    }
    if let Some(install) = &ov.install {
        manifest.install = CommandList::Esy(install.clone());
    }
    if let Some(build_dev) = &ov.build_dev {
        manifest.build_dev = Some(build_dev.clone());
    }
    if let Some(exported_env) = &ov.exported_env {
        manifest.exported_env = exported_env.clone();
    }
    if let Some(diff) = &ov.exported_env_override {
        diff.apply(&mut manifest.exported_env);
    }
    if let Some(build_env) = &ov.build_env {
        manifest.build_env = build_env.clone();
    }
    if let Some(diff) = &ov.build_env_override {
        diff.apply(&mut manifest.build_env);
    }
    manifest
}

/// Fold a stack of overrides onto a manifest, outermost last.
pub fn fold_all(manifest: BuildManifest, overrides: &[BuildOverride]) -> BuildManifest {
    overrides.iter().fold(manifest, apply)
}
