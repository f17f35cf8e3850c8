//! In-memory DAG of resolved packages.
//!
//! The graph is an arena of [`Package`] nodes with integer-index edges, one
//! adjacency list per node. Edge order is normalized to ascending
//! `(name, version)` of the target so every traversal is deterministic.

use crate::error::{EsyError, Result};
use crate::manifest::BuildManifest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a package's source behaves across builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// Never rebuilt once installed.
    Immutable,
    /// Immutable source, but rebuilt because a transitive dependency is
    /// transient.
    ImmutableWithTransient,
    /// Rebuilt on every request (linked / in-development packages).
    Transient,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Immutable => "immutable",
            SourceType::ImmutableWithTransient => "immutable-with-transient",
            SourceType::Transient => "transient",
        }
    }

    /// Transient sources, and immutable sources tainted by one, are rebuilt
    /// even when an installed artifact exists.
    pub fn is_rebuilt_when_installed(&self) -> bool {
        matches!(self, SourceType::Transient | SourceType::ImmutableWithTransient)
    }
}

/// Kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
    Runtime,
    Build,
    Dev,
}

/// A resolved package with its normalized (override-folded) manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    /// Digest of the package source, part of the package identity.
    pub source_digest: String,
    pub source_type: SourceType,
    pub source_path: PathBuf,
    pub manifest: BuildManifest,
    /// Content digests of the manifest's patches, in listed order. Computed
    /// at sandbox assembly so planning stays free of file I/O.
    pub patch_digests: Vec<String>,
}

impl Package {
    /// Human-readable identity used in error chains and progress output.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Index of a package in the graph arena.
pub type PackageIx = usize;

/// Strict DAG of resolved packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageGraph {
    nodes: Vec<Package>,
    edges: Vec<Vec<(DepKind, PackageIx)>>,
    root: PackageIx,
}

impl PackageGraph {
    /// Assemble a graph from an arena and adjacency lists. Edges are sorted
    /// by target `(name, version)` ascending.
    pub fn new(
        nodes: Vec<Package>,
        mut edges: Vec<Vec<(DepKind, PackageIx)>>,
        root: PackageIx,
    ) -> Self {
        for adjacency in &mut edges {
            adjacency.sort_by(|(_, a), (_, b)| {
                let a = &nodes[*a];
                let b = &nodes[*b];
                (&a.name, &a.version).cmp(&(&b.name, &b.version))
            });
        }
        Self { nodes, edges, root }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_ix(&self) -> PackageIx {
        self.root
    }

    pub fn root(&self) -> &Package {
        &self.nodes[self.root]
    }

    pub fn package(&self, ix: PackageIx) -> &Package {
        &self.nodes[ix]
    }

    pub fn packages(&self) -> impl Iterator<Item = (PackageIx, &Package)> {
        self.nodes.iter().enumerate()
    }

    /// Dependencies of a package in deterministic order, optionally filtered
    /// by edge kind.
    pub fn dependencies(
        &self,
        ix: PackageIx,
        filter: Option<DepKind>,
    ) -> impl Iterator<Item = (DepKind, PackageIx)> + '_ {
        self.edges[ix]
            .iter()
            .copied()
            .filter(move |(kind, _)| filter.map_or(true, |f| f == *kind))
    }

    /// Depth-first post-order fold from `start`, visiting each node at most
    /// once. `edge_filter` decides which edges are followed from a given
    /// node; `f` receives the node and its dependencies' outputs in edge
    /// order. Cycles are illegal and reported with the discovery chain.
    pub fn fold_post_order<T, E, F>(&self, start: PackageIx, edge_filter: E, f: F) -> Result<T>
    where
        E: Fn(PackageIx, DepKind) -> bool,
        F: FnMut(PackageIx, &[(DepKind, PackageIx, &T)]) -> Result<T>,
    {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        struct Walk<'g, T, E, F> {
            graph: &'g PackageGraph,
            edge_filter: E,
            f: F,
            memo: Vec<Option<T>>,
            colors: Vec<u8>,
            path: Vec<PackageIx>,
        }

        impl<T, E, F> Walk<'_, T, E, F>
        where
            E: Fn(PackageIx, DepKind) -> bool,
            F: FnMut(PackageIx, &[(DepKind, PackageIx, &T)]) -> Result<T>,
        {
            fn visit(&mut self, ix: PackageIx) -> Result<()> {
                match self.colors[ix] {
                    BLACK => return Ok(()),
                    GRAY => {
                        let first = self.path.iter().position(|p| *p == ix).unwrap_or(0);
                        let mut chain: Vec<String> = self.path[first..]
                            .iter()
                            .map(|p| self.graph.package(*p).id())
                            .collect();
                        chain.push(self.graph.package(ix).id());
                        return Err(EsyError::CyclicDependency { chain });
                    }
                    _ => {}
                }

                self.colors[ix] = GRAY;
                self.path.push(ix);

                let deps: Vec<(DepKind, PackageIx)> = self
                    .graph
                    .dependencies(ix, None)
                    .filter(|(kind, _)| (self.edge_filter)(ix, *kind))
                    .collect();

                for (_, dep) in &deps {
                    self.visit(*dep)?;
                }

                let results: Vec<(DepKind, PackageIx, &T)> = deps
                    .iter()
                    .map(|(kind, dep)| (*kind, *dep, self.memo[*dep].as_ref().expect("post-order")))
                    .collect();
                let out = (self.f)(ix, &results)?;

                self.memo[ix] = Some(out);
                self.colors[ix] = BLACK;
                self.path.pop();
                Ok(())
            }
        }

        let mut walk = Walk {
            graph: self,
            edge_filter,
            f,
            memo: (0..self.nodes.len()).map(|_| None).collect(),
            colors: vec![WHITE; self.nodes.len()],
            path: Vec::new(),
        };

        walk.visit(start)?;
        Ok(walk.memo[start].take().expect("start visited"))
    }
}
