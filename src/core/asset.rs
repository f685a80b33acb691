//! Asset graph: an arena of resolved modules keyed by canonical path.
//!
//! Every cross reference (dependency edges, bundle membership) is an index,
//! so cyclic imports never turn into ownership cycles.

use crate::core::bundle::BundleId;
use crate::core::models::*;
use crate::utils::basename;
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(usize);

impl AssetId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct AssetNode {
    pub id: AssetId,
    pub identity: PathBuf,
    pub kind: AssetKind,
    pub package: Arc<PackageMetadata>,
    pub compiled: Option<BTreeMap<AssetKind, String>>,
    pub content_hash: Option<String>,
    /// Declared dependencies in source order, keyed by specifier
    pub dependencies: IndexMap<String, Dependency>,
    pub resolved: HashMap<String, AssetId>,
    /// Edges pointing at this asset, recorded while the bundle tree is built
    pub incoming: Vec<Dependency>,
    pub bundles: IndexSet<BundleId>,
    pub parent_bundle: Option<BundleId>,
    /// Must be (re)compiled before its output can be used
    pub dirty: bool,
}

impl AssetNode {
    fn new(id: AssetId, identity: PathBuf, kind: AssetKind, package: Arc<PackageMetadata>) -> Self {
        Self {
            id,
            identity,
            kind,
            package,
            compiled: None,
            content_hash: None,
            dependencies: IndexMap::new(),
            resolved: HashMap::new(),
            incoming: Vec::new(),
            bundles: IndexSet::new(),
            parent_bundle: None,
            dirty: true,
        }
    }

    /// Forget compiled output so the next load recompiles
    pub fn invalidate(&mut self) {
        self.dirty = true;
        self.compiled = None;
        self.content_hash = None;
        self.dependencies.clear();
        self.resolved.clear();
    }

    /// Forget bundle placement ahead of a tree rebuild
    pub fn invalidate_bundle(&mut self) {
        self.parent_bundle = None;
        self.bundles.clear();
        self.incoming.clear();
    }

    /// Whether compilation produced output of `kind`
    pub fn generates(&self, kind: &AssetKind) -> bool {
        self.compiled
            .as_ref()
            .map(|generated| generated.contains_key(kind))
            .unwrap_or(false)
    }

    /// Resolved dependency ids in declaration order
    pub fn dependency_ids(&self) -> Vec<(Dependency, AssetId)> {
        self.dependencies
            .iter()
            .filter_map(|(specifier, dep)| {
                self.resolved.get(specifier).map(|id| (dep.clone(), *id))
            })
            .collect()
    }

    pub fn basename(&self) -> String {
        basename(&self.identity)
    }

    /// File name for a bundle whose entry is this asset.
    ///
    /// A package's `main` file is named after the package; the root entry
    /// keeps its own stem so HTML can reference it; everything else gets a
    /// hash of its identity, which stays stable across rebuilds.
    pub fn bundle_name(&self, is_main: bool) -> String {
        let ext = self.kind.as_str();

        if let (Some(main), Some(name)) = (self.package.main_path(), self.package.name.as_ref()) {
            if main == self.identity {
                return format!("{}.{}", name.replace('/', "-"), ext);
            }
        }

        if is_main {
            let stem = self
                .identity
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "index".to_string());
            return format!("{}.{}", stem, ext);
        }

        let digest = blake3::hash(self.identity.to_string_lossy().as_bytes());
        format!("{}.{}", &digest.to_hex()[..16], ext)
    }
}

#[derive(Debug, Default)]
pub struct AssetGraph {
    // Slots are never reused, so a stale AssetId can't alias a new node
    nodes: Vec<Option<AssetNode>>,
    /// Identity paths plus included-in-parent aliases
    paths: HashMap<PathBuf, AssetId>,
}

impl AssetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node for `identity`, creating it if needed.
    /// The flag is true when the node was created by this call.
    pub fn get_or_insert(
        &mut self,
        identity: &Path,
        kind: AssetKind,
        package: Arc<PackageMetadata>,
    ) -> (AssetId, bool) {
        if let Some(id) = self.paths.get(identity) {
            if self.get(*id).map(|n| n.identity == identity).unwrap_or(false) {
                return (*id, false);
            }
        }

        let id = AssetId(self.nodes.len());
        self.nodes
            .push(Some(AssetNode::new(id, identity.to_path_buf(), kind, package)));
        self.paths.insert(identity.to_path_buf(), id);
        (id, true)
    }

    /// Route change notifications for `path` to `owner`. A path that is
    /// some node's own identity keeps pointing at that node.
    pub fn alias(&mut self, path: &Path, owner: AssetId) -> bool {
        if let Some(existing) = self.paths.get(path) {
            if self.get(*existing).map(|n| n.identity == path).unwrap_or(false) {
                return false;
            }
        }
        self.paths.insert(path.to_path_buf(), owner);
        true
    }

    /// Node that should be rebuilt when `path` changes
    pub fn id_for_path(&self, path: &Path) -> Option<AssetId> {
        self.paths
            .get(path)
            .copied()
            .filter(|id| self.get(*id).is_some())
    }

    pub fn get(&self, id: AssetId) -> Option<&AssetNode> {
        self.nodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: AssetId) -> Option<&mut AssetNode> {
        self.nodes.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    pub fn by_path(&self, path: &Path) -> Option<&AssetNode> {
        self.paths
            .get(path)
            .and_then(|id| self.get(*id))
            .filter(|node| node.identity == path)
    }

    /// Remove a node; returns every path (identity and aliases) that stopped
    /// being routed anywhere, so the caller can unwatch them
    pub fn remove(&mut self, id: AssetId) -> Vec<PathBuf> {
        if self.nodes.get_mut(id.0).and_then(|slot| slot.take()).is_none() {
            return Vec::new();
        }

        let released: Vec<PathBuf> = self
            .paths
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &released {
            self.paths.remove(path);
        }
        released
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetNode> {
        self.nodes.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AssetNode> {
        self.nodes.iter_mut().filter_map(|slot| slot.as_mut())
    }

    /// Nodes not owned by any bundle
    pub fn orphans(&self) -> Vec<AssetId> {
        self.iter()
            .filter(|node| node.parent_bundle.is_none())
            .map(|node| node.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_hmr_asset(&self, id: AssetId) -> Option<HmrAsset> {
        let node = self.get(id)?;
        let deps = node
            .resolved
            .iter()
            .filter_map(|(specifier, dep_id)| {
                self.get(*dep_id)
                    .map(|dep| (specifier.clone(), dep.identity.clone()))
            })
            .collect();

        Some(HmrAsset {
            id: node.identity.clone(),
            kind: node.kind.clone(),
            generated: node.compiled.clone().unwrap_or_default(),
            deps,
        })
    }
}
