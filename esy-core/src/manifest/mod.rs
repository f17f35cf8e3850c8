//! Build manifest model and loading.
//!
//! Manifests arrive in one of two on-disk formats: `esy.json` / `package.json`
//! carrying an `"esy"` object, or opam-format files. Both collapse to the
//! uniform [`BuildManifest`] at this boundary; the rest of the core never sees
//! the origin format.

pub mod esy_json;
pub mod opam;
pub mod overrides;

use crate::error::{EsyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a package's build relates to its source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BuildType {
    /// Build commands run against a copy of the source in the build directory.
    InSource,
    /// In-source, but only the `_build` subtree is mutated (dune/jbuilder).
    JbuilderLike,
    /// Build commands run against the pristine source, outputs go to the
    /// build directory.
    #[default]
    OutOfSource,
    /// Build mutates the source tree in place with no isolation.
    Unsafe,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::InSource => "in-source",
            BuildType::JbuilderLike => "jbuilder-like",
            BuildType::OutOfSource => "out-of-source",
            BuildType::Unsafe => "unsafe",
        }
    }
}

/// A single build or install command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub args: Vec<String>,
    /// Raw opam filter guarding the command, preserved verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl Command {
    pub fn new<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        Self { args: args.into_iter().map(Into::into).collect(), filter: None }
    }

    /// Tokenize a single command line on whitespace.
    pub fn line(line: &str) -> Self {
        Self::new(line.split_whitespace())
    }
}

/// An ordered list of commands, tagged with the syntax they were written in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "commands", rename_all = "lowercase")]
pub enum CommandList {
    Esy(Vec<Command>),
    Opam(Vec<Command>),
}

impl CommandList {
    pub fn commands(&self) -> &[Command] {
        match self {
            CommandList::Esy(cmds) | CommandList::Opam(cmds) => cmds,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands().is_empty()
    }
}

impl Default for CommandList {
    fn default() -> Self {
        CommandList::Esy(Vec::new())
    }
}

/// Visibility of an exported environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvScope {
    /// Visible to direct dependents only.
    #[default]
    Local,
    /// Re-exported transitively to the full closure of dependents.
    Global,
}

/// An environment variable a package contributes to its dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedEnv {
    #[serde(rename = "val")]
    pub value: String,
    #[serde(default)]
    pub scope: EnvScope,
}

/// A patch applied to the source before building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Path relative to the package source.
    pub path: PathBuf,
    /// Raw opam filter guarding the patch, preserved verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Normalized build description, independent of the manifest's origin format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildManifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub build_type: BuildType,
    pub build: CommandList,
    pub install: CommandList,
    /// Commands replacing `build` when a dev sandbox builds its root.
    pub build_dev: Option<Vec<Command>>,
    pub exported_env: BTreeMap<String, ExportedEnv>,
    pub build_env: BTreeMap<String, String>,
    pub patches: Vec<Patch>,
    pub substs: Vec<PathBuf>,
}

impl BuildManifest {
    /// The empty manifest: valid, builds nothing, installs nothing.
    pub fn empty(name: Option<String>) -> Self {
        Self { name, ..Self::default() }
    }

    /// A manifest without build and install commands is a no-op.
    pub fn is_noop(&self) -> bool {
        self.build.is_empty() && self.install.is_empty()
    }

    /// Canonical serialization used as task digest input. Maps are ordered,
    /// so byte-equality follows from semantic equality.
    pub fn normalized_json(&self) -> String {
        serde_json::to_string(self).expect("manifest serialization cannot fail")
    }
}

/// Manifest origin format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Esy,
    Opam,
}

/// Explicit pointer at a manifest file within a package directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHint {
    pub kind: ManifestKind,
    pub filename: String,
}

impl ManifestHint {
    pub fn esy(filename: impl Into<String>) -> Self {
        Self { kind: ManifestKind::Esy, filename: filename.into() }
    }

    pub fn opam(filename: impl Into<String>) -> Self {
        Self { kind: ManifestKind::Opam, filename: filename.into() }
    }
}

/// Filenames probed, in order, when no hint is given. Both parse as the esy
/// JSON format.
const PROBE_ORDER: [&str; 2] = ["esy.json", "package.json"];

/// Load a manifest from a package directory.
///
/// Returns the manifest (if one was found and carries build metadata) together
/// with the list of file paths that contributed to the result; callers record
/// these for cache invalidation.
///
/// With no hint the directory is probed for `esy.json` then `package.json`; an
/// absent file tries the next, and if none exists the result is `(None, [])`.
/// With an explicit hint the named file must exist.
pub async fn load_from_path(
    dir: &Path,
    hint: Option<&ManifestHint>,
) -> Result<(Option<BuildManifest>, Vec<PathBuf>)> {
    match hint {
        Some(hint) => {
            let path = dir.join(&hint.filename);
            let text = read_manifest_file(&path).await?;
            let fallback = name_fallback_for(hint, &path);
            let manifest = parse(hint.kind, &text, fallback.as_deref())
                .map_err(|message| EsyError::ManifestParse { path: path.clone(), message })?;
            Ok((manifest, vec![path]))
        }
        None => {
            for filename in PROBE_ORDER {
                let path = dir.join(filename);
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => {
                        let manifest = parse(ManifestKind::Esy, &text, None).map_err(|message| {
                            EsyError::ManifestParse { path: path.clone(), message }
                        })?;
                        return Ok((manifest, vec![path]));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(EsyError::io(path, e)),
                }
            }
            Ok((None, Vec::new()))
        }
    }
}

/// Parse manifest data already in memory.
///
/// Esy-format data missing the `"esy"` section yields `Ok(None)`.
pub fn load_from_data(
    kind: ManifestKind,
    data: &str,
    name_fallback: Option<&str>,
) -> Result<Option<BuildManifest>> {
    parse(kind, data, name_fallback)
        .map_err(|message| EsyError::ManifestParse { path: PathBuf::from("<data>"), message })
}

fn parse(
    kind: ManifestKind,
    data: &str,
    name_fallback: Option<&str>,
) -> std::result::Result<Option<BuildManifest>, String> {
    match kind {
        ManifestKind::Esy => esy_json::parse(data, name_fallback),
        ManifestKind::Opam => opam::parse(data, name_fallback).map(Some),
    }
}

async fn read_manifest_file(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(EsyError::ManifestMissing { path: path.to_path_buf() })
        }
        Err(e) => Err(EsyError::io(path.to_path_buf(), e)),
    }
}

/// For opam files named `<pkg>.opam` the stem is the package name fallback.
fn name_fallback_for(hint: &ManifestHint, path: &Path) -> Option<String> {
    match hint.kind {
        ManifestKind::Opam => path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| *s != "opam")
            .map(str::to_string),
        ManifestKind::Esy => None,
    }
}
