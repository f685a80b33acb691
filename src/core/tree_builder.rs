//! Builds the bundle tree from the asset graph.
//!
//! Walks from the entry asset, opens a child bundle at every dynamic import,
//! and when an asset turns out to be shared between bundles moves it up to
//! the lowest common ancestor, so every asset is packaged exactly once.

use crate::core::asset::{AssetGraph, AssetId};
use crate::core::bundle::{BundleId, BundleTree};
use crate::core::models::Dependency;
use std::path::{Path, PathBuf};

pub struct BundleTreeBuilder<'a> {
    graph: &'a mut AssetGraph,
    tree: BundleTree,
    out_dir: PathBuf,
}

impl<'a> BundleTreeBuilder<'a> {
    pub fn new(graph: &'a mut AssetGraph, out_dir: &Path) -> Self {
        Self {
            graph,
            tree: BundleTree::new(),
            out_dir: out_dir.to_path_buf(),
        }
    }

    /// Build a fresh tree rooted at `entry`. Bundle placement on the asset
    /// nodes must have been invalidated beforehand.
    pub fn build(mut self, entry: AssetId) -> BundleTree {
        self.place(entry, None, None);
        self.tree
    }

    fn place(&mut self, asset: AssetId, via: Option<&Dependency>, into: Option<BundleId>) {
        let Some(node) = self.graph.get_mut(asset) else {
            return;
        };

        if let Some(dep) = via {
            node.incoming.push(dep.clone());
        }

        if let Some(current) = node.parent_bundle {
            // Shared asset: hoist it to the common ancestor of both bundles
            if let Some(into) = into {
                if current != into {
                    let common = self.tree.find_common_ancestor(into, current);
                    if current != common && self.tree.get(current).kind == self.tree.get(common).kind {
                        self.move_asset_to_bundle(asset, common);
                    }
                }
            }
            return;
        }

        let kind = node.kind.clone();
        let bundle = match into {
            None => {
                let name = self.out_dir.join(node.bundle_name(true));
                self.tree.create_root(kind.clone(), name, asset)
            }
            Some(parent) if via.map(|d| d.dynamic).unwrap_or(false) => {
                let name = self.out_dir.join(node.bundle_name(false));
                self.tree.create_child(parent, kind.clone(), name, asset)
            }
            Some(parent) => parent,
        };

        let target = self.tree.sibling(bundle, &kind);
        let bundle_kind = self.tree.get(bundle).kind.clone();
        let Some(node) = self.graph.get_mut(asset) else {
            return;
        };
        self.tree.add_asset(target, node);

        // Output for the containing bundle's kind is packaged there as well
        // (e.g. a stylesheet that also generated a script representation)
        if target != bundle && node.generates(&bundle_kind) {
            self.tree.add_asset(bundle, node);
        }

        node.parent_bundle = Some(bundle);
        let dependencies = node.dependency_ids();

        for (dep, dep_asset) in dependencies {
            self.place(dep_asset, Some(&dep), Some(bundle));
        }
    }

    fn move_asset_to_bundle(&mut self, asset: AssetId, common: BundleId) {
        let Some(node) = self.graph.get_mut(asset) else {
            return;
        };

        let memberships: Vec<BundleId> = node.bundles.iter().copied().collect();
        for bundle in memberships {
            let kind = self.tree.get(bundle).kind.clone();
            self.tree.remove_asset(bundle, node);
            let destination = self.tree.sibling(common, &kind);
            self.tree.add_asset(destination, node);
        }

        let old_bundle = node.parent_bundle.replace(common);
        let children: Vec<AssetId> = node.dependency_ids().into_iter().map(|(_, id)| id).collect();

        for child in children {
            let follows = self
                .graph
                .get(child)
                .map(|c| c.parent_bundle == old_bundle)
                .unwrap_or(false);
            if follows {
                self.move_asset_to_bundle(child, common);
            }
        }
    }
}
