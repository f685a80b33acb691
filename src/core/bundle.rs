//! Bundle arena and packaging plan.
//!
//! Bundles live in a flat arena addressed by [`BundleId`]. Each bundle keeps
//! its parent (for lowest-common-ancestor hoisting) and at most one sibling per
//! output kind, so a stylesheet pulled in by a script lands next to it. After
//! the tree is built every bundle gets a content hash; [`BundleTree::plan_packaging`]
//! compares those against the previous pass and snapshots only the changed
//! bundles into owned [`PackagedBundle`]s the packagers can write without
//! touching the graph.

use crate::core::asset::{AssetGraph, AssetId, AssetNode};
use crate::core::models::{AssetKind, Dependency};
use indexmap::IndexSet;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(usize);

#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub kind: AssetKind,
    /// Output path
    pub name: PathBuf,
    pub entry_asset: Option<AssetId>,
    pub assets: IndexSet<AssetId>,
    pub parent: Option<BundleId>,
    pub children: Vec<BundleId>,
    /// Bundles of other kinds sharing this bundle's tree position
    pub siblings: BTreeMap<AssetKind, BundleId>,
}

impl Bundle {
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Tree of output bundles. Bundles refer to assets by id only; membership
/// back-references live on the asset nodes.
#[derive(Debug, Clone, Default)]
pub struct BundleTree {
    bundles: Vec<Bundle>,
    root: Option<BundleId>,
}

impl BundleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<BundleId> {
        self.root
    }

    pub fn get(&self, id: BundleId) -> &Bundle {
        &self.bundles[id.0]
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.iter()
    }

    fn push(&mut self, kind: AssetKind, name: PathBuf, parent: Option<BundleId>) -> BundleId {
        let id = BundleId(self.bundles.len());
        self.bundles.push(Bundle {
            id,
            kind,
            name,
            entry_asset: None,
            assets: IndexSet::new(),
            parent,
            children: Vec::new(),
            siblings: BTreeMap::new(),
        });
        if let Some(parent) = parent {
            self.bundles[parent.0].children.push(id);
        }
        id
    }

    pub fn create_root(&mut self, kind: AssetKind, name: PathBuf, entry: AssetId) -> BundleId {
        let id = self.push(kind, name, None);
        self.bundles[id.0].entry_asset = Some(entry);
        self.root = Some(id);
        id
    }

    pub fn create_child(
        &mut self,
        parent: BundleId,
        kind: AssetKind,
        name: PathBuf,
        entry: AssetId,
    ) -> BundleId {
        let id = self.push(kind, name, Some(parent));
        self.bundles[id.0].entry_asset = Some(entry);
        id
    }

    /// The bundle of `kind` at `bundle`'s position: the bundle itself when the
    /// kinds match, otherwise a lazily created child named after it
    pub fn sibling(&mut self, bundle: BundleId, kind: &AssetKind) -> BundleId {
        if &self.bundles[bundle.0].kind == kind {
            return bundle;
        }
        if let Some(existing) = self.bundles[bundle.0].siblings.get(kind) {
            return *existing;
        }

        let name = self.bundles[bundle.0].name.with_extension(kind.as_str());
        let id = self.push(kind.clone(), name, Some(bundle));
        self.bundles[bundle.0].siblings.insert(kind.clone(), id);
        id
    }

    pub fn add_asset(&mut self, bundle: BundleId, asset: &mut AssetNode) {
        asset.bundles.insert(bundle);
        self.bundles[bundle.0].assets.insert(asset.id);
    }

    pub fn remove_asset(&mut self, bundle: BundleId, asset: &mut AssetNode) {
        asset.bundles.shift_remove(&bundle);
        self.bundles[bundle.0].assets.shift_remove(&asset.id);
    }

    /// `bundle` followed by its ancestors up to the root
    pub fn parents(&self, bundle: BundleId) -> Vec<BundleId> {
        let mut chain = vec![bundle];
        let mut current = self.bundles[bundle.0].parent;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.bundles[parent.0].parent;
        }
        chain
    }

    /// Deepest bundle that is an ancestor of (or equal to) both
    pub fn find_common_ancestor(&self, a: BundleId, b: BundleId) -> BundleId {
        let ours = self.parents(a);
        let theirs = self.parents(b);

        let mut common = ours[ours.len() - 1];
        for (x, y) in ours.iter().rev().zip(theirs.iter().rev()) {
            if x != y {
                break;
            }
            common = *x;
        }
        common
    }

    /// Fingerprint over the members' content hashes, in membership order
    pub fn hash(&self, bundle: BundleId, graph: &AssetGraph) -> String {
        let mut hasher = blake3::Hasher::new();
        for asset in &self.bundles[bundle.0].assets {
            if let Some(hash) = graph.get(*asset).and_then(|n| n.content_hash.as_ref()) {
                hasher.update(hash.as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Bundles in depth-first order from the root
    pub fn walk(&self) -> Vec<BundleId> {
        let mut order = Vec::with_capacity(self.bundles.len());
        let mut stack: Vec<BundleId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.bundles[id.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    /// Decide which bundles must be written: every non-empty bundle whose
    /// hash differs from `previous`
    pub fn plan_packaging(
        &self,
        graph: &AssetGraph,
        previous: Option<&HashMap<PathBuf, String>>,
    ) -> PackagePlan {
        let mut plan = PackagePlan::default();

        for id in self.walk() {
            let bundle = self.get(id);
            if bundle.is_empty() {
                continue;
            }

            let hash = self.hash(id, graph);
            let unchanged = previous
                .and_then(|hashes| hashes.get(&bundle.name))
                .map(|old| *old == hash)
                .unwrap_or(false);
            plan.hashes.insert(bundle.name.clone(), hash);

            if !unchanged {
                plan.changed.push(self.snapshot(id, graph));
            }
        }

        plan
    }

    fn snapshot(&self, id: BundleId, graph: &AssetGraph) -> PackagedBundle {
        let bundle = self.get(id);
        let assets = bundle
            .assets
            .iter()
            .filter_map(|asset| graph.get(*asset))
            .map(|node| PackagedAsset {
                identity: node.identity.clone(),
                kind: node.kind.clone(),
                content: node
                    .compiled
                    .as_ref()
                    .and_then(|generated| generated.get(&bundle.kind))
                    .cloned()
                    .unwrap_or_default(),
                content_hash: node.content_hash.clone().unwrap_or_default(),
                incoming: node.incoming.clone(),
            })
            .collect();

        PackagedBundle {
            name: bundle.name.clone(),
            kind: bundle.kind.clone(),
            assets,
        }
    }
}

/// Owned view of a bundle handed to a packager, detached from the graph
#[derive(Debug, Clone, PartialEq)]
pub struct PackagedBundle {
    pub name: PathBuf,
    pub kind: AssetKind,
    pub assets: Vec<PackagedAsset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackagedAsset {
    pub identity: PathBuf,
    pub kind: AssetKind,
    /// Output of this asset for the bundle's kind
    pub content: String,
    pub content_hash: String,
    pub incoming: Vec<Dependency>,
}

#[derive(Debug, Default)]
pub struct PackagePlan {
    pub changed: Vec<PackagedBundle>,
    pub hashes: HashMap<PathBuf, String>,
}

/// Summary of a finished pass, expressed in paths rather than arena ids
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    /// Depth-first from the root
    pub bundles: Vec<BundleInfo>,
    /// Asset identity -> name of its primary bundle
    pub placements: BTreeMap<PathBuf, PathBuf>,
    /// Bundles written during this pass
    pub packaged: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundleInfo {
    pub name: PathBuf,
    pub kind: AssetKind,
    pub entry: Option<PathBuf>,
    pub assets: Vec<PathBuf>,
    pub hash: String,
    pub parent: Option<PathBuf>,
    pub children: Vec<PathBuf>,
}

impl BuildReport {
    pub fn new(tree: &BundleTree, graph: &AssetGraph, packaged: Vec<PathBuf>) -> Self {
        let identity = |id: AssetId| graph.get(id).map(|n| n.identity.clone());

        let bundles = tree
            .walk()
            .into_iter()
            .map(|id| {
                let bundle = tree.get(id);
                BundleInfo {
                    name: bundle.name.clone(),
                    kind: bundle.kind.clone(),
                    entry: bundle.entry_asset.and_then(identity),
                    assets: bundle.assets.iter().filter_map(|a| identity(*a)).collect(),
                    hash: tree.hash(id, graph),
                    parent: bundle.parent.map(|p| tree.get(p).name.clone()),
                    children: bundle
                        .children
                        .iter()
                        .map(|c| tree.get(*c).name.clone())
                        .collect(),
                }
            })
            .collect();

        let placements = graph
            .iter()
            .filter_map(|node| {
                node.parent_bundle
                    .map(|b| (node.identity.clone(), tree.get(b).name.clone()))
            })
            .collect();

        Self {
            bundles,
            placements,
            packaged,
        }
    }

    pub fn root(&self) -> Option<&BundleInfo> {
        self.bundles.first()
    }

    pub fn bundle(&self, name: &Path) -> Option<&BundleInfo> {
        self.bundles.iter().find(|b| b.name == name)
    }

    /// Bundle created for `entry` (root or dynamic-import split point)
    pub fn bundle_for_entry(&self, entry: &Path) -> Option<&BundleInfo> {
        self.bundles
            .iter()
            .find(|b| b.entry.as_deref() == Some(entry))
    }

    pub fn primary_bundle(&self, asset: &Path) -> Option<&BundleInfo> {
        self.placements.get(asset).and_then(|name| self.bundle(name))
    }

    pub fn bundles_containing(&self, asset: &Path) -> Vec<&BundleInfo> {
        self.bundles
            .iter()
            .filter(|b| b.assets.iter().any(|a| a == asset))
            .collect()
    }
}
