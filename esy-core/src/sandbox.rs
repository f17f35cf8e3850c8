//! Sandbox assembly and the on-disk sandbox-info cache.
//!
//! [`Sandbox::load`] consumes the installation layout produced by the package
//! installer, loads and folds every build manifest, and assembles the package
//! graph. The result of planning can be persisted as a [`SandboxInfo`] blob
//! keyed by configuration identity and invalidated by the modification times
//! of the manifest files that contributed to it.

use crate::config::Config;
use crate::error::{ErrorExt, EsyError, Result};
use crate::graph::{DepKind, Package, PackageGraph, SourceType};
use crate::manifest::{self, overrides, BuildManifest, ManifestHint};
use crate::plan::env::Environment;
use crate::plan::BuildPlan;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Where a package's source comes from, as reported by the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PackageSource {
    /// Linked in-development package, rebuilt on every request.
    Link {
        path: PathBuf,
        #[serde(default)]
        manifest: Option<ManifestHint>,
    },
    /// Fetched immutable source.
    Install {
        /// Filename of an opam manifest within the package location.
        #[serde(default)]
        opam: Option<String>,
    },
}

/// One entry of the installer's resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationPackage {
    pub name: String,
    pub version: String,
    pub source_digest: String,
    pub source: PackageSource,
    /// On-disk location of the package source.
    pub location: PathBuf,
    #[serde(default)]
    pub overrides: Vec<overrides::BuildOverride>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub build_dependencies: Vec<String>,
    #[serde(default)]
    pub dev_dependencies: Vec<String>,
}

/// Resolved installation layout: package records keyed by installer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub root: String,
    pub packages: BTreeMap<String, InstallationPackage>,
}

/// A manifest path with its modification time at read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestWitness {
    pub path: PathBuf,
    pub mtime_ms: u64,
}

/// A loaded sandbox: the package graph plus the manifest files that shaped
/// it, with their mtimes at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub graph: PackageGraph,
    pub manifest_info: Vec<ManifestWitness>,
}

impl Sandbox {
    /// Assemble a sandbox from an installation layout.
    ///
    /// Per package: the manifest is loaded from its location (honoring the
    /// source's manifest hint), the override stack is folded on, and patch
    /// content digests are computed. Packages whose probe finds no manifest
    /// get the empty no-op manifest. Linked packages are transient; installed
    /// packages with a transient package anywhere below them are promoted to
    /// `ImmutableWithTransient`.
    pub async fn load(installation: &Installation) -> Result<Sandbox> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (ix, key) in installation.packages.keys().enumerate() {
            index.insert(key.as_str(), ix);
        }

        let root = *index
            .get(installation.root.as_str())
            .ok_or_else(|| anyhow::anyhow!("root package {} not in installation", installation.root))?;

        let mut nodes = Vec::with_capacity(installation.packages.len());
        let mut edges: Vec<Vec<(DepKind, usize)>> = Vec::with_capacity(installation.packages.len());
        let mut witnesses = Vec::new();

        for (key, record) in &installation.packages {
            let (manifest, paths) = load_manifest(record)
                .await
                .with_context(|| format!("reading build manifest of {}", record.name))?;

            for path in paths {
                let mtime_ms = mtime_ms(&path)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("cannot stat manifest {}", path.display()))?;
                witnesses.push(ManifestWitness { path, mtime_ms });
            }

            let manifest = overrides::fold_all(
                manifest.unwrap_or_else(|| BuildManifest::empty(Some(record.name.clone()))),
                &record.overrides,
            );

            let patch_digests = patch_digests(&record.location, &manifest)
                .await
                .with_context(|| format!("digesting patches of {}", record.name))?;

            let source_type = match record.source {
                PackageSource::Link { .. } => SourceType::Transient,
                PackageSource::Install { .. } => SourceType::Immutable,
            };

            let mut adjacency = Vec::new();
            for (kind, keys) in [
                (DepKind::Runtime, &record.dependencies),
                (DepKind::Build, &record.build_dependencies),
                (DepKind::Dev, &record.dev_dependencies),
            ] {
                for dep_key in keys {
                    let dep_ix = *index.get(dep_key.as_str()).ok_or_else(|| {
                        anyhow::anyhow!("{} depends on {} which is not installed", key, dep_key)
                    })?;
                    adjacency.push((kind, dep_ix));
                }
            }
            edges.push(adjacency);

            nodes.push(Package {
                name: record.name.clone(),
                version: record.version.clone(),
                source_digest: record.source_digest.clone(),
                source_type,
                source_path: record.location.clone(),
                manifest,
                patch_digests,
            });
        }

        // Promote installed packages with a transient package below them.
        // The fold also rejects cyclic installations.
        let graph = PackageGraph::new(nodes, edges, root);
        let mut tainted = vec![false; graph.len()];
        graph.fold_post_order(root, |_, _| true, |ix, deps| {
            let dep_taint = deps.iter().any(|(_, _, subtree)| **subtree);
            tainted[ix] = dep_taint;
            Ok(dep_taint || graph.package(ix).source_type == SourceType::Transient)
        })?;

        let mut nodes: Vec<Package> = graph.packages().map(|(_, p)| p.clone()).collect();
        let edges: Vec<Vec<(DepKind, usize)>> = (0..graph.len())
            .map(|ix| graph.dependencies(ix, None).collect())
            .collect();
        for (ix, node) in nodes.iter_mut().enumerate() {
            if tainted[ix] && node.source_type == SourceType::Immutable {
                node.source_type = SourceType::ImmutableWithTransient;
            }
        }

        Ok(Sandbox {
            graph: PackageGraph::new(nodes, edges, root),
            manifest_info: witnesses,
        })
    }
}

async fn load_manifest(
    record: &InstallationPackage,
) -> Result<(Option<BuildManifest>, Vec<PathBuf>)> {
    let hint = match &record.source {
        PackageSource::Link { manifest, .. } => manifest.clone(),
        PackageSource::Install { opam } => opam.as_deref().map(ManifestHint::opam),
    };
    manifest::load_from_path(&record.location, hint.as_ref()).await
}

/// Content digests of a manifest's patches, in listed order.
async fn patch_digests(location: &Path, manifest: &BuildManifest) -> Result<Vec<String>> {
    let mut digests = Vec::with_capacity(manifest.patches.len());
    for patch in &manifest.patches {
        let path = location.join(&patch.path);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EsyError::ManifestMissing { path })
            }
            Err(e) => return Err(EsyError::io(path, e)),
        };
        digests.push(format!("{:x}", Sha256::digest(&data)));
    }
    Ok(digests)
}

/// Planning result persisted across invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox: Sandbox,
    /// The planned tasks, root id included.
    pub plan: BuildPlan,
    /// Root command environment, for tool invocation without replanning.
    pub command_env: Environment,
    /// Root sandbox environment.
    pub sandbox_env: Environment,
}

const CACHE_MAGIC: &[u8; 5] = b"ESYSB";
const CACHE_SCHEMA_VERSION: u32 = 1;
const CACHE_HEADER_LEN: usize = CACHE_MAGIC.len() + 4;

/// Cache file location, keyed by the configuration identity.
pub fn cache_path(config: &Config) -> PathBuf {
    let identity = format!(
        "{}$${}$${}$${}",
        config.store_path.display(),
        config.local_store_path.display(),
        config.sandbox_path.display(),
        config.esy_version,
    );
    let digest = format!("{:x}", Sha256::digest(identity.as_bytes()));
    config
        .sandbox_path
        .join("node_modules/.cache/_esy")
        .join(format!("sandbox-{}", digest))
}

/// Persist a sandbox info blob. Write failures are logged and swallowed; the
/// cache is best-effort.
pub async fn write(config: &Config, info: &SandboxInfo) {
    if let Err(error) = try_write(config, info).await {
        warn!(error = %error, "failed to write sandbox cache");
    }
}

async fn try_write(config: &Config, info: &SandboxInfo) -> Result<()> {
    let path = cache_path(config);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| EsyError::CacheIo {
            path: parent.to_path_buf(),
            detail: e.to_string(),
        })?;
    }

    let payload = serde_json::to_vec(info)
        .map_err(|e| EsyError::CacheIo { path: path.clone(), detail: e.to_string() })?;
    let mut blob = Vec::with_capacity(CACHE_HEADER_LEN + payload.len());
    blob.extend_from_slice(CACHE_MAGIC);
    blob.extend_from_slice(&CACHE_SCHEMA_VERSION.to_le_bytes());
    blob.extend_from_slice(&payload);

    tokio::fs::write(&path, blob)
        .await
        .map_err(|e| EsyError::CacheIo { path, detail: e.to_string() })
}

/// Read the cached sandbox info, if still valid.
///
/// Returns `None` on a missing or unreadable blob, a schema version mismatch,
/// or when any recorded manifest witness no longer matches the file on disk.
pub async fn read(config: &Config) -> Option<SandboxInfo> {
    let path = cache_path(config);
    let blob = tokio::fs::read(&path).await.ok()?;

    if blob.len() < CACHE_HEADER_LEN || &blob[..CACHE_MAGIC.len()] != CACHE_MAGIC {
        debug!(path = %path.display(), "sandbox cache has no valid header");
        return None;
    }
    let version = u32::from_le_bytes(blob[CACHE_MAGIC.len()..CACHE_HEADER_LEN].try_into().ok()?);
    if version != CACHE_SCHEMA_VERSION {
        debug!(found = version, expected = CACHE_SCHEMA_VERSION, "sandbox cache schema mismatch");
        return None;
    }

    let info: SandboxInfo = serde_json::from_slice(&blob[CACHE_HEADER_LEN..]).ok()?;

    for witness in &info.sandbox.manifest_info {
        match mtime_ms(&witness.path).await {
            Some(current) if current <= witness.mtime_ms => {}
            _ => {
                debug!(path = %witness.path.display(), "manifest changed, dropping sandbox cache");
                return None;
            }
        }
    }

    Some(info)
}

async fn mtime_ms(path: &Path) -> Option<u64> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let modified = metadata.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Planner;
    use std::time::Duration;
    use tempfile::TempDir;

    fn link_record(name: &str, location: PathBuf, deps: &[&str]) -> InstallationPackage {
        InstallationPackage {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            source_digest: format!("digest-{}", name),
            source: PackageSource::Link { path: location.clone(), manifest: None },
            location,
            overrides: Vec::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            build_dependencies: Vec::new(),
            dev_dependencies: Vec::new(),
        }
    }

    fn install_record(
        name: &str,
        location: PathBuf,
        opam: Option<&str>,
        deps: &[&str],
    ) -> InstallationPackage {
        InstallationPackage {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            source_digest: format!("digest-{}", name),
            source: PackageSource::Install { opam: opam.map(str::to_string) },
            location,
            overrides: Vec::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            build_dependencies: Vec::new(),
            dev_dependencies: Vec::new(),
        }
    }

    fn installation(root: &str, packages: Vec<(&str, InstallationPackage)>) -> Installation {
        Installation {
            root: root.to_string(),
            packages: packages.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    async fn sandbox_in(tmp: &TempDir) -> (Config, Sandbox) {
        let proj = tmp.path().join("proj");
        std::fs::create_dir_all(&proj).unwrap();
        std::fs::write(proj.join("esy.json"), r#"{"name": "proj", "esy": {"build": "make"}}"#)
            .unwrap();

        let installation =
            installation("proj", vec![("proj", link_record("proj", proj, &[]))]);
        let sandbox = Sandbox::load(&installation).await.unwrap();
        let config = Config::new(tmp.path().join("esy"), tmp.path().join("proj"), "0.7.2");
        (config, sandbox)
    }

    async fn info_in(tmp: &TempDir) -> (Config, SandboxInfo) {
        let (config, sandbox) = sandbox_in(tmp).await;
        let (plan, _) = Planner::new(&sandbox.graph, &config, false).plan().unwrap();
        let root = plan.root_task();
        let info = SandboxInfo {
            command_env: root.env.command.clone(),
            sandbox_env: root.env.sandbox.clone(),
            sandbox,
            plan,
        };
        (config, info)
    }

    #[tokio::test]
    async fn test_load_assembles_graph_from_both_formats() {
        let tmp = TempDir::new().unwrap();
        let proj = tmp.path().join("proj");
        let dep = tmp.path().join("dep");
        std::fs::create_dir_all(&proj).unwrap();
        std::fs::create_dir_all(&dep).unwrap();
        std::fs::write(proj.join("esy.json"), r#"{"esy": {"build": "dune build"}}"#).unwrap();
        std::fs::write(dep.join("dep.opam"), "name: \"dep\"\nbuild: [make]\n").unwrap();

        let installation = installation(
            "proj",
            vec![
                ("proj", link_record("proj", proj.clone(), &["dep"])),
                ("dep", install_record("@opam/dep", dep, Some("dep.opam"), &[])),
            ],
        );

        let sandbox = Sandbox::load(&installation).await.unwrap();

        assert_eq!(sandbox.graph.len(), 2);
        assert_eq!(sandbox.graph.root().name, "proj");
        assert_eq!(sandbox.graph.root().source_type, SourceType::Transient);

        let (_, dep_ix) = sandbox.graph.dependencies(sandbox.graph.root_ix(), None).next().unwrap();
        let dep_pkg = sandbox.graph.package(dep_ix);
        assert_eq!(dep_pkg.source_type, SourceType::Immutable);
        assert_eq!(dep_pkg.manifest.name.as_deref(), Some("@opam/dep"));

        let witness_paths: Vec<&Path> =
            sandbox.manifest_info.iter().map(|w| w.path.as_path()).collect();
        assert!(witness_paths.contains(&proj.join("esy.json").as_path()));
    }

    #[tokio::test]
    async fn test_transient_dependency_taints_installed_dependents() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        let c = tmp.path().join("c");
        for dir in [&a, &b, &c] {
            std::fs::create_dir_all(dir).unwrap();
        }

        // a (installed) -> b (installed) -> c (linked)
        let installation = installation(
            "a",
            vec![
                ("a", install_record("a", a, None, &["b"])),
                ("b", install_record("b", b, None, &["c"])),
                ("c", link_record("c", c, &[])),
            ],
        );

        let sandbox = Sandbox::load(&installation).await.unwrap();
        let by_name = |name: &str| {
            sandbox
                .graph
                .packages()
                .find(|(_, p)| p.name == name)
                .map(|(_, p)| p.source_type)
                .unwrap()
        };

        assert_eq!(by_name("a"), SourceType::ImmutableWithTransient);
        assert_eq!(by_name("b"), SourceType::ImmutableWithTransient);
        assert_eq!(by_name("c"), SourceType::Transient);
    }

    #[tokio::test]
    async fn test_patch_digests_and_missing_patch() {
        let tmp = TempDir::new().unwrap();
        let dep = tmp.path().join("dep");
        std::fs::create_dir_all(&dep).unwrap();
        std::fs::write(dep.join("dep.opam"), "patches: [\"fix.patch\"]\n").unwrap();
        std::fs::write(dep.join("fix.patch"), "--- a\n+++ b\n").unwrap();

        let ok = installation(
            "dep",
            vec![("dep", install_record("@opam/dep", dep.clone(), Some("dep.opam"), &[]))],
        );
        let sandbox = Sandbox::load(&ok).await.unwrap();
        assert_eq!(sandbox.graph.root().patch_digests.len(), 1);
        assert_eq!(sandbox.graph.root().patch_digests[0].len(), 64);

        std::fs::remove_file(dep.join("fix.patch")).unwrap();
        let err = Sandbox::load(&ok).await.unwrap_err();
        assert!(matches!(err.root(), EsyError::ManifestMissing { .. }));
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let (config, info) = info_in(&tmp).await;

        write(&config, &info).await;
        let loaded = read(&config).await.expect("cache valid");

        assert_eq!(loaded.plan.root, info.plan.root);
        assert_eq!(loaded.sandbox.manifest_info, info.sandbox.manifest_info);
        assert_eq!(loaded.command_env, info.command_env);
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_touched_manifest() {
        let tmp = TempDir::new().unwrap();
        let (config, info) = info_in(&tmp).await;
        write(&config, &info).await;

        // Bump the manifest mtime past the recorded witness.
        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(
            tmp.path().join("proj/esy.json"),
            r#"{"name": "proj", "esy": {"build": "make all"}}"#,
        )
        .unwrap();

        assert!(read(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let (config, info) = info_in(&tmp).await;
        write(&config, &info).await;

        std::fs::remove_file(tmp.path().join("proj/esy.json")).unwrap();
        assert!(read(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_rejects_schema_mismatch() {
        let tmp = TempDir::new().unwrap();
        let (config, info) = info_in(&tmp).await;
        write(&config, &info).await;

        let path = cache_path(&config);
        let mut blob = std::fs::read(&path).unwrap();
        blob[CACHE_MAGIC.len()..CACHE_HEADER_LEN]
            .copy_from_slice(&(CACHE_SCHEMA_VERSION + 1).to_le_bytes());
        std::fs::write(&path, blob).unwrap();

        assert!(read(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let (config, _) = sandbox_in(&tmp).await;

        assert!(read(&config).await.is_none());

        let path = cache_path(&config);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a cache blob").unwrap();
        assert!(read(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_path_tracks_config_identity() {
        let tmp = TempDir::new().unwrap();
        let a = Config::new(tmp.path().join("esy"), tmp.path().join("proj"), "0.7.2");
        let b = Config::new(tmp.path().join("esy"), tmp.path().join("proj"), "0.7.3");

        assert_ne!(cache_path(&a), cache_path(&b));
        assert!(cache_path(&a)
            .starts_with(tmp.path().join("proj/node_modules/.cache/_esy")));
    }
}
