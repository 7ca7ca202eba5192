//! Graph partitioning.
//!
//! [`partition`] turns a dependency graph into a [`FragmentTree`] honoring
//! [`PartitionBounds`]. It is a pure function: the same graph and bounds
//! always give the same tree.
//!
//! Merge passes, in priority order:
//! - Input-merge: siblings with the same non-empty input set
//! - Single-dependency merge: a fragment into its only consumer
//! - Minimum-size: an undersized fragment into a neighbour, inputs first
//! - Concurrency folding: smallest same-level pairs while a level is too wide
//!
//! Whenever a pass changes the partition, passes restart from the top. Every
//! merge removes a fragment, so the loop reaches a fixed point.
//!
//! A merge is admissible when the result stays within the maximum bounds and
//! no fragment-level cycle appears.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, trace};

use viewcalc_traits::{FragmentId, PartitionBounds};

use crate::error::EngineResult;
use crate::fragment::{FragmentTree, GraphFragment};
use crate::graph::DependencyGraph;

/// Partitions `graph` into fragments.
///
/// Fails only if the graph is not a closed DAG or the bounds are
/// inconsistent. An empty graph gives an empty tree. A graph that fits in one
/// job under the maximum bounds is returned as a single fragment, as is a
/// single-node graph.
pub fn partition(graph: &DependencyGraph, bounds: &PartitionBounds) -> EngineResult<FragmentTree> {
    graph.validate()?;
    bounds.validate()?;

    if graph.is_empty() {
        return Ok(FragmentTree::default());
    }

    let total_cost = graph.total_cost();
    if graph.len() == 1 || bounds.admits(graph.len(), total_cost) {
        let fragment = GraphFragment::with_nodes(FragmentId(0), graph.topological_order()?, total_cost);
        debug!(
            calc_config = %graph.calc_config_name(),
            nodes = graph.len(),
            "Graph partitioned as a single job"
        );
        return Ok(FragmentTree::from_fragments(vec![fragment], graph.len()));
    }

    let mut partitioner = Partitioner::new(graph, bounds);
    partitioner.run();
    let tree = partitioner.into_tree();

    debug!(
        calc_config = %graph.calc_config_name(),
        nodes = graph.len(),
        fragments = tree.len(),
        "Graph partitioned"
    );
    Ok(tree)
}

// =============================================================================
// PARTITIONER
// =============================================================================

/// Fragment arena addressed by id. A merged-away fragment leaves `None`.
struct Partitioner<'a> {
    bounds: &'a PartitionBounds,
    node_count: usize,
    arena: Vec<Option<GraphFragment>>,
    merges: usize,
}

impl<'a> Partitioner<'a> {
    fn new(graph: &DependencyGraph, bounds: &'a PartitionBounds) -> Self {
        let mut arena: Vec<Option<GraphFragment>> = graph
            .nodes()
            .iter()
            .map(|n| Some(GraphFragment::singleton(FragmentId(n.id().index()), n.id(), n.cost())))
            .collect();

        for node in graph.nodes() {
            let consumer = FragmentId(node.id().index());
            for input in node.inputs() {
                let producer = FragmentId(input.index());
                if let Some(f) = arena[producer.index()].as_mut() {
                    f.outputs_mut().insert(consumer);
                }
                if let Some(f) = arena[consumer.index()].as_mut() {
                    f.inputs_mut().insert(producer);
                }
            }
        }

        Self {
            bounds,
            node_count: graph.len(),
            arena,
            merges: 0,
        }
    }

    fn run(&mut self) {
        loop {
            if self.input_merge() {
                continue;
            }
            if self.single_dependency_merge() {
                continue;
            }
            if self.enforce_minimum_size() {
                continue;
            }
            if self.fold_concurrency() {
                continue;
            }
            break;
        }
        trace!(merges = self.merges, "Partition reached a fixed point");
    }

    fn into_tree(self) -> FragmentTree {
        let fragments: Vec<GraphFragment> = self.arena.into_iter().flatten().collect();
        FragmentTree::from_fragments(fragments, self.node_count)
    }

    fn fragment(&self, id: FragmentId) -> Option<&GraphFragment> {
        self.arena.get(id.index()).and_then(Option::as_ref)
    }

    fn live_ids(&self) -> Vec<FragmentId> {
        self.arena
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_some())
            .map(|(i, _)| FragmentId(i))
            .collect()
    }

    // =========================================================================
    // ADMISSIBILITY
    // =========================================================================

    fn fits(&self, a: FragmentId, b: FragmentId) -> bool {
        match (self.fragment(a), self.fragment(b)) {
            (Some(fa), Some(fb)) => self
                .bounds
                .admits(fa.size() + fb.size(), fa.cost().saturating_add(fb.cost())),
            _ => false,
        }
    }

    fn admissible(&self, a: FragmentId, b: FragmentId) -> bool {
        a != b && self.fits(a, b) && !self.has_indirect_path(a, b) && !self.has_indirect_path(b, a)
    }

    /// True if `to` is reachable from `from` other than by a direct edge.
    /// Merging the two would then close a cycle through the intermediate
    /// fragments.
    fn has_indirect_path(&self, from: FragmentId, to: FragmentId) -> bool {
        let Some(start) = self.fragment(from) else {
            return false;
        };
        let mut stack: Vec<FragmentId> = start.outputs().iter().copied().filter(|o| *o != to).collect();
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == to {
                return true;
            }
            if !seen.insert(next) {
                continue;
            }
            if let Some(f) = self.fragment(next) {
                stack.extend(f.outputs().iter().copied());
            }
        }
        false
    }

    // =========================================================================
    // MERGE
    // =========================================================================

    /// Merges two fragments. `first`'s nodes come first in the merged job, so
    /// `first` must not depend on `second`. The merged fragment keeps the
    /// lower id.
    fn merge(&mut self, first: FragmentId, second: FragmentId) -> FragmentId {
        let keep = first.min(second);
        let Some(mut merged) = self.arena[first.index()].take() else {
            return second;
        };
        let Some(absorbed) = self.arena[second.index()].take() else {
            self.arena[first.index()] = Some(merged);
            return first;
        };

        trace!(
            first = %first,
            second = %second,
            size = merged.size() + absorbed.size(),
            "Merging fragments"
        );

        merged.absorb(absorbed, keep);

        for input in merged.inputs() {
            if let Some(f) = self.arena[input.index()].as_mut() {
                let outputs = f.outputs_mut();
                outputs.remove(&first);
                outputs.remove(&second);
                outputs.insert(keep);
            }
        }
        for output in merged.outputs() {
            if let Some(f) = self.arena[output.index()].as_mut() {
                let inputs = f.inputs_mut();
                inputs.remove(&first);
                inputs.remove(&second);
                inputs.insert(keep);
            }
        }

        self.arena[keep.index()] = Some(merged);
        self.merges += 1;
        keep
    }

    // =========================================================================
    // PASSES
    // =========================================================================

    /// Merges siblings sharing the same non-empty input set, first-fit in id
    /// order. The largest group goes first; the pass stops after the first
    /// group that merged anything, since that can change other input sets.
    fn input_merge(&mut self) -> bool {
        let mut by_inputs: BTreeMap<BTreeSet<FragmentId>, Vec<FragmentId>> = BTreeMap::new();
        for id in self.live_ids() {
            if let Some(f) = self.fragment(id) {
                if !f.inputs().is_empty() {
                    by_inputs.entry(f.inputs().clone()).or_default().push(id);
                }
            }
        }

        let mut groups: Vec<Vec<FragmentId>> =
            by_inputs.into_values().filter(|g| g.len() > 1).collect();
        groups.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));

        for group in groups {
            let mut bins: Vec<FragmentId> = Vec::new();
            let mut changed = false;
            for member in group {
                let slot = bins.iter().position(|bin| self.admissible(*bin, member));
                match slot {
                    Some(slot) => {
                        bins[slot] = self.merge(bins[slot], member);
                        changed = true;
                    }
                    None => bins.push(member),
                }
            }
            if changed {
                return true;
            }
        }
        false
    }

    /// Merges every fragment with exactly one consumer into that consumer.
    fn single_dependency_merge(&mut self) -> bool {
        let mut changed = false;
        for id in self.live_ids() {
            let consumer = match self.fragment(id) {
                Some(f) if f.outputs().len() == 1 => f.outputs().iter().next().copied(),
                _ => None,
            };
            if let Some(consumer) = consumer {
                if self.admissible(id, consumer) {
                    self.merge(id, consumer);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Merges each undersized fragment into the first admissible neighbour:
    /// inputs in id order, then outputs in id order.
    fn enforce_minimum_size(&mut self) -> bool {
        let mut changed = false;
        for id in self.live_ids() {
            let Some(f) = self.fragment(id) else {
                continue;
            };
            if !self.bounds.is_undersized(f.size(), f.cost()) {
                continue;
            }

            let inputs: Vec<FragmentId> = f.inputs().iter().copied().collect();
            let outputs: Vec<FragmentId> = f.outputs().iter().copied().collect();

            let input = inputs.into_iter().find(|i| self.admissible(*i, id));
            if let Some(input) = input {
                self.merge(input, id);
                changed = true;
                continue;
            }
            let output = outputs.into_iter().find(|o| self.admissible(id, *o));
            if let Some(output) = output {
                self.merge(id, output);
                changed = true;
            }
        }
        changed
    }

    /// Folds each level that is wider than the concurrency limit.
    ///
    /// Fragments on the same level are never connected by a path, so only the
    /// size and cost bounds decide whether two of them may merge.
    fn fold_concurrency(&mut self) -> bool {
        let limit = self.bounds.concurrency();
        if limit == usize::MAX {
            return false;
        }

        let mut changed = false;
        for (level, mut members) in self.levels().into_iter().enumerate() {
            while members.len() > limit {
                let Some((a, b)) = self.smallest_pair(&members) else {
                    debug!(
                        level = level,
                        fragments = members.len(),
                        limit = limit,
                        "Concurrency limit exceeded, no admissible merge"
                    );
                    break;
                };
                let keep = self.merge(a, b);
                members.retain(|m| *m != a && *m != b);
                members.push(keep);
                members.sort();
                changed = true;
            }
        }
        changed
    }

    /// Pair with the smallest combined size that fits the bounds; lower ids
    /// win ties. Returned lower id first.
    fn smallest_pair(&self, members: &[FragmentId]) -> Option<(FragmentId, FragmentId)> {
        let mut sized: Vec<(usize, FragmentId)> = members
            .iter()
            .filter_map(|id| self.fragment(*id).map(|f| (f.size(), *id)))
            .collect();
        sized.sort();

        let mut best: Option<(usize, FragmentId, FragmentId)> = None;
        for (i, (size_a, a)) in sized.iter().enumerate() {
            if let Some((combined, _, _)) = best {
                if size_a * 2 > combined {
                    break;
                }
            }
            for (size_b, b) in &sized[i + 1..] {
                let combined = size_a + size_b;
                if let Some((best_combined, _, _)) = best {
                    if combined > best_combined {
                        break;
                    }
                }
                if !self.fits(*a, *b) {
                    continue;
                }
                let candidate = (combined, (*a).min(*b), (*a).max(*b));
                if best.map_or(true, |current| candidate < current) {
                    best = Some(candidate);
                }
            }
        }
        best.map(|(_, a, b)| (a, b))
    }

    /// Live fragments grouped by longest path down to a leaf, id order within
    /// a level.
    fn levels(&self) -> Vec<Vec<FragmentId>> {
        let live = self.live_ids();
        let mut pending: BTreeMap<FragmentId, usize> = live
            .iter()
            .filter_map(|id| self.fragment(*id).map(|f| (*id, f.inputs().len())))
            .collect();
        let mut level_of: BTreeMap<FragmentId, usize> = BTreeMap::new();
        let mut ready: Vec<FragmentId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(id) = ready.pop() {
            let Some(f) = self.fragment(id) else {
                continue;
            };
            let level = f
                .inputs()
                .iter()
                .filter_map(|i| level_of.get(i))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(id, level);
            for output in f.outputs() {
                if let Some(count) = pending.get_mut(output) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(*output);
                    }
                }
            }
        }

        let mut grouped: Vec<Vec<FragmentId>> = Vec::new();
        for (id, level) in level_of {
            if grouped.len() <= level {
                grouped.resize_with(level + 1, Vec::new);
            }
            grouped[level].push(id);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::graph::DependencyNode;
    use viewcalc_traits::{NodeId, ValueSpecification};

    fn node(name: &str, cost: u64) -> DependencyNode {
        DependencyNode::new("Fn", name)
            .with_output(ValueSpecification::new("Value", name))
            .with_cost(cost)
    }

    /// N0 <- N1 <- N2 <- ... a straight line.
    fn chain(len: usize) -> DependencyGraph {
        let mut graph = DependencyGraph::new("Default");
        for i in 0..len {
            let id = graph.add_node(node(&format!("C{i}"), 1));
            if i > 0 {
                graph.add_input(id, NodeId(i - 1)).unwrap();
            }
        }
        graph
    }

    /// `width` independent nodes.
    fn wide(width: usize) -> DependencyGraph {
        let mut graph = DependencyGraph::new("Default");
        for i in 0..width {
            graph.add_node(node(&format!("W{i}"), 1));
        }
        graph
    }

    fn sizes(tree: &FragmentTree) -> Vec<usize> {
        tree.fragments().iter().map(|f| f.size()).collect()
    }

    #[test]
    fn test_empty_graph() {
        let tree = partition(&DependencyGraph::new("Default"), &PartitionBounds::default()).unwrap();
        assert!(tree.is_empty());
        assert!(tree.root().inputs().is_empty());
    }

    #[test]
    fn test_single_node_ignores_bounds() {
        let mut graph = DependencyGraph::new("Default");
        graph.add_node(node("Only", 50));
        let bounds = PartitionBounds::default().with_max_cost(10).with_min_items(3);
        let tree = partition(&graph, &bounds.with_max_items(5)).unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = chain(3);
        graph.add_input(NodeId(0), NodeId(2)).unwrap();
        let err = partition(&graph, &PartitionBounds::default()).unwrap_err();
        assert!(matches!(err, EngineError::GraphConsistency(_)));
    }

    #[test]
    fn test_inconsistent_bounds_rejected() {
        let err = partition(&chain(3), &PartitionBounds::items(4, Some(2), None)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_chain_folds_up_to_max() {
        let tree = partition(&chain(5), &PartitionBounds::items(1, Some(2), None)).unwrap();
        assert_eq!(sizes(&tree), vec![2, 2, 1]);
        let first = tree.fragment(FragmentId(0)).unwrap();
        assert_eq!(first.nodes(), &[NodeId(0), NodeId(1)]);
    }

    #[test]
    fn test_chain_order_inside_fragment() {
        let tree = partition(&chain(6), &PartitionBounds::items(1, Some(3), None)).unwrap();
        for fragment in tree.fragments() {
            let nodes: Vec<usize> = fragment.nodes().iter().map(|n| n.index()).collect();
            let mut sorted = nodes.clone();
            sorted.sort();
            assert_eq!(nodes, sorted);
        }
    }

    #[test]
    fn test_cost_bound() {
        let mut graph = DependencyGraph::new("Default");
        for (i, cost) in [5u64, 5, 5, 5].iter().enumerate() {
            let id = graph.add_node(node(&format!("C{i}"), *cost));
            if i > 0 {
                graph.add_input(id, NodeId(i - 1)).unwrap();
            }
        }
        let tree = partition(&graph, &PartitionBounds::default().with_max_cost(10)).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.fragments().iter().all(|f| f.cost() <= 10));
    }

    #[test]
    fn test_concurrency_folds_smallest_first() {
        let bounds = PartitionBounds::items(1, Some(2), Some(2));
        let tree = partition(&wide(4), &bounds).unwrap();
        assert_eq!(sizes(&tree), vec![2, 2]);
        assert_eq!(tree.fragment(FragmentId(0)).unwrap().nodes(), &[NodeId(0), NodeId(1)]);
        assert_eq!(tree.fragment(FragmentId(2)).unwrap().nodes(), &[NodeId(2), NodeId(3)]);
    }

    #[test]
    fn test_concurrency_limit_exceeded_when_max_blocks() {
        let bounds = PartitionBounds::items(1, Some(1), Some(1));
        let tree = partition(&wide(3), &bounds).unwrap();
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_single_consumer_absorbs_leaf() {
        // N0 and N1 are leaves, N2 reads both.
        let mut graph = DependencyGraph::new("Default");
        let a = graph.add_node(node("A", 1));
        let b = graph.add_node(node("B", 1));
        let c = graph.add_node(node("C", 1));
        graph.add_input(c, a).unwrap();
        graph.add_input(c, b).unwrap();

        let tree = partition(&graph, &PartitionBounds::items(2, Some(2), None)).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.fragment(FragmentId(0)).unwrap().nodes(), &[NodeId(0), NodeId(2)]);
        assert_eq!(tree.fragment(FragmentId(1)).unwrap().nodes(), &[NodeId(1)]);
    }

    #[test]
    fn test_minimum_size_prefers_inputs() {
        // N0 reads N1 and is read by N2.
        let mut graph = DependencyGraph::new("Default");
        let middle = graph.add_node(node("M", 1));
        let input = graph.add_node(node("I", 1));
        let output = graph.add_node(node("O", 1));
        graph.add_input(middle, input).unwrap();
        graph.add_input(output, middle).unwrap();

        let bounds = PartitionBounds::items(2, Some(2), None);
        let mut partitioner = Partitioner::new(&graph, &bounds);
        assert!(partitioner.enforce_minimum_size());

        let tree = partitioner.into_tree();
        assert_eq!(tree.fragment(FragmentId(0)).unwrap().nodes(), &[NodeId(1), NodeId(0)]);
        assert_eq!(tree.fragment(FragmentId(2)).unwrap().nodes(), &[NodeId(2)]);
    }

    #[test]
    fn test_merge_closing_a_cycle_is_inadmissible() {
        // N0 -> N1 -> N2 and N0 -> N2: merging N0 with N2 alone would cycle through N1.
        let mut graph = chain(3);
        graph.add_input(NodeId(2), NodeId(0)).unwrap();

        let bounds = PartitionBounds::items(1, Some(2), None);
        let partitioner = Partitioner::new(&graph, &bounds);
        assert!(!partitioner.admissible(FragmentId(0), FragmentId(2)));
        assert!(partitioner.admissible(FragmentId(0), FragmentId(1)));
        assert!(partitioner.admissible(FragmentId(1), FragmentId(2)));

        let tree = partition(&graph, &bounds).unwrap();
        assert_eq!(tree.topological_order().len(), tree.len());
    }
}
