//! Graph fragments and the partition tree.
//!
//! A [`GraphFragment`] is a set of nodes dispatched together as one job. The
//! partitioner produces a [`FragmentTree`]: every node in exactly one
//! fragment, fragment edges mirroring the node edges that cross fragments,
//! and a [`RootGraphFragment`] anchoring the fragments nothing consumes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use viewcalc_traits::{FragmentId, NodeId};

// =============================================================================
// GRAPH FRAGMENT
// =============================================================================

/// A partition unit: nodes executed together as one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphFragment {
    id: FragmentId,
    nodes: Vec<NodeId>,
    inputs: BTreeSet<FragmentId>,
    outputs: BTreeSet<FragmentId>,
    cost: u64,
}

impl GraphFragment {
    pub(crate) fn singleton(id: FragmentId, node: NodeId, cost: u64) -> Self {
        Self {
            id,
            nodes: vec![node],
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            cost,
        }
    }

    pub(crate) fn with_nodes(id: FragmentId, nodes: Vec<NodeId>, cost: u64) -> Self {
        Self {
            id,
            nodes,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            cost,
        }
    }

    /// Stable fragment id (the lowest id of the fragments merged into it).
    pub fn id(&self) -> FragmentId {
        self.id
    }

    /// Nodes in job-item order; every node follows its in-fragment inputs.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Fragments whose results this fragment needs.
    pub fn inputs(&self) -> &BTreeSet<FragmentId> {
        &self.inputs
    }

    /// Fragments that need this fragment's results.
    pub fn outputs(&self) -> &BTreeSet<FragmentId> {
        &self.outputs
    }

    /// Node count.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Sum of node costs.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Returns true if the fragment contains `node`.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut BTreeSet<FragmentId> {
        &mut self.inputs
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut BTreeSet<FragmentId> {
        &mut self.outputs
    }

    /// Absorbs `other`, appending its nodes after this fragment's.
    ///
    /// Edges between the two disappear; the caller re-points neighbours.
    pub(crate) fn absorb(&mut self, other: GraphFragment, keep: FragmentId) {
        let gone = [self.id, other.id];
        self.nodes.extend(other.nodes);
        self.inputs.extend(other.inputs);
        self.outputs.extend(other.outputs);
        for id in gone {
            self.inputs.remove(&id);
            self.outputs.remove(&id);
        }
        self.cost = self.cost.saturating_add(other.cost);
        self.id = keep;
    }
}

// =============================================================================
// ROOT FRAGMENT
// =============================================================================

/// Synthetic anchor whose inputs are the fragments nothing else consumes.
///
/// The execution is complete once every root input has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RootGraphFragment {
    inputs: BTreeSet<FragmentId>,
}

impl RootGraphFragment {
    /// Top-most fragments.
    pub fn inputs(&self) -> &BTreeSet<FragmentId> {
        &self.inputs
    }
}

// =============================================================================
// FRAGMENT TREE
// =============================================================================

/// Immutable result of partitioning a dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FragmentTree {
    fragments: Vec<GraphFragment>,
    root: RootGraphFragment,
    #[serde(skip)]
    node_to_fragment: Vec<FragmentId>,
}

impl FragmentTree {
    /// Builds a tree from live fragments.
    ///
    /// `node_count` is the number of nodes in the partitioned graph.
    pub(crate) fn from_fragments(mut fragments: Vec<GraphFragment>, node_count: usize) -> Self {
        fragments.sort_by_key(|f| f.id);

        let mut node_to_fragment = vec![FragmentId(0); node_count];
        for fragment in &fragments {
            for node in &fragment.nodes {
                if let Some(slot) = node_to_fragment.get_mut(node.index()) {
                    *slot = fragment.id;
                }
            }
        }

        let root = RootGraphFragment {
            inputs: fragments
                .iter()
                .filter(|f| f.outputs.is_empty())
                .map(|f| f.id)
                .collect(),
        };

        Self {
            fragments,
            root,
            node_to_fragment,
        }
    }

    /// Looks up a fragment.
    pub fn fragment(&self, id: FragmentId) -> Option<&GraphFragment> {
        self.fragments
            .binary_search_by_key(&id, |f| f.id)
            .ok()
            .map(|i| &self.fragments[i])
    }

    /// Fragments in id order.
    pub fn fragments(&self) -> &[GraphFragment] {
        &self.fragments
    }

    /// The root anchor.
    pub fn root(&self) -> &RootGraphFragment {
        &self.root
    }

    /// Fragment holding `node`.
    pub fn fragment_of(&self, node: NodeId) -> Option<FragmentId> {
        self.node_to_fragment.get(node.index()).copied()
    }

    /// Number of fragments.
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Returns true if the tree has no fragments.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Fragments with no inputs; these are dispatched first.
    pub fn leaves(&self) -> Vec<FragmentId> {
        self.fragments
            .iter()
            .filter(|f| f.inputs.is_empty())
            .map(|f| f.id)
            .collect()
    }

    /// Level of every fragment: the longest path down to a leaf.
    pub fn level_map(&self) -> BTreeMap<FragmentId, usize> {
        let mut levels = BTreeMap::new();
        for id in self.topological_order() {
            let level = self
                .fragment(id)
                .map(|f| {
                    f.inputs
                        .iter()
                        .filter_map(|i| levels.get(i))
                        .map(|l| l + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            levels.insert(id, level);
        }
        levels
    }

    /// Fragments grouped by level, leaves first, id order within a level.
    pub fn levels(&self) -> Vec<Vec<FragmentId>> {
        let mut grouped: Vec<Vec<FragmentId>> = Vec::new();
        for (id, level) in self.level_map() {
            if grouped.len() <= level {
                grouped.resize_with(level + 1, Vec::new);
            }
            grouped[level].push(id);
        }
        grouped
    }

    /// Fragments ordered inputs-first, lowest id first among ready fragments.
    pub fn topological_order(&self) -> Vec<FragmentId> {
        let mut pending: BTreeMap<FragmentId, usize> = self
            .fragments
            .iter()
            .map(|f| (f.id, f.inputs.len()))
            .collect();
        let mut ready: BTreeSet<FragmentId> = self.leaves().into_iter().collect();
        let mut order = Vec::with_capacity(self.fragments.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            if let Some(fragment) = self.fragment(next) {
                for output in &fragment.outputs {
                    if let Some(count) = pending.get_mut(output) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(*output);
                        }
                    }
                }
            }
        }
        order
    }

    /// Fragments that depend on `id`, directly or transitively, in id order.
    pub fn downstream_of(&self, id: FragmentId) -> BTreeSet<FragmentId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<FragmentId> = self
            .fragment(id)
            .map(|f| f.outputs.iter().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                if let Some(fragment) = self.fragment(next) {
                    stack.extend(fragment.outputs.iter().copied());
                }
            }
        }
        seen
    }

    fn fmt_fragment(
        &self,
        f: &mut fmt::Formatter<'_>,
        id: FragmentId,
        depth: usize,
    ) -> fmt::Result {
        let Some(fragment) = self.fragment(id) else {
            return Ok(());
        };
        let nodes: Vec<String> = fragment.nodes.iter().map(|n| n.to_string()).collect();
        writeln!(
            f,
            "{:indent$}{} [{}] size={} cost={}",
            "",
            fragment.id,
            nodes.join(", "),
            fragment.size(),
            fragment.cost,
            indent = depth * 2
        )?;
        for input in &fragment.inputs {
            self.fmt_fragment(f, *input, depth + 1)?;
        }
        Ok(())
    }
}

/// Renders the tree from the root down. Shared inputs appear under every
/// consumer.
impl fmt::Display for FragmentTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Root ({} fragments)", self.fragments.len())?;
        for input in &self.root.inputs {
            self.fmt_fragment(f, *input, 1)?;
        }
        Ok(())
    }
}
