//! Dependency graph for one calculation configuration.
//!
//! The graph is the input to partitioning. It is built once, validated, and
//! then shared read-only by every execution of the view.
//!
//! # Example
//!
//! ```rust,ignore
//! use viewcalc_engine::graph::{DependencyGraph, DependencyNode};
//!
//! let mut graph = DependencyGraph::new("Default");
//! let curve = graph.add_node(
//!     DependencyNode::new("CurveBuilder", "USD")
//!         .with_output(ValueSpecification::new("YieldCurve", "USD"))
//!         .with_terminal_input(ValueSpecification::new("MarketQuotes", "USD")),
//! );
//! let pv = graph.add_node(
//!     DependencyNode::new("SwapPV", "SWAP-1")
//!         .with_output(ValueSpecification::new("PresentValue", "SWAP-1")),
//! );
//! graph.add_input(pv, curve)?;
//! graph.validate()?;
//! ```

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use viewcalc_traits::{
    CalcConfigName, CalculationJobItem, ComputationTargetRef, FunctionId, NodeId,
    ValueSpecification,
};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// DEPENDENCY NODE
// =============================================================================

/// One function invocation on one computation target.
///
/// The id is the node's position in its graph and is not serialized; a
/// deserialized graph renumbers its nodes by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    #[serde(skip, default = "unplaced")]
    id: NodeId,
    function_id: FunctionId,
    target: ComputationTargetRef,
    outputs: Vec<ValueSpecification>,
    terminal_inputs: Vec<ValueSpecification>,
    inputs: Vec<NodeId>,
    cost: u64,
}

fn unplaced() -> NodeId {
    NodeId(0)
}

impl DependencyNode {
    /// Creates a node with unit cost and no outputs.
    pub fn new(function_id: impl Into<FunctionId>, target: impl Into<ComputationTargetRef>) -> Self {
        Self {
            id: unplaced(),
            function_id: function_id.into(),
            target: target.into(),
            outputs: Vec::new(),
            terminal_inputs: Vec::new(),
            inputs: Vec::new(),
            cost: 1,
        }
    }

    /// Adds an output value.
    pub fn with_output(mut self, spec: ValueSpecification) -> Self {
        self.outputs.push(spec);
        self
    }

    /// Adds a value resolved from the computation cache rather than another node.
    pub fn with_terminal_input(mut self, spec: ValueSpecification) -> Self {
        self.terminal_inputs.push(spec);
        self
    }

    /// Sets the estimated cost.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Position of the node in its graph.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Function invoked by this node.
    pub fn function_id(&self) -> &FunctionId {
        &self.function_id
    }

    /// Target the function is invoked on.
    pub fn target(&self) -> &ComputationTargetRef {
        &self.target
    }

    /// Values this node produces.
    pub fn outputs(&self) -> &[ValueSpecification] {
        &self.outputs
    }

    /// Values this node reads from the computation cache.
    pub fn terminal_inputs(&self) -> &[ValueSpecification] {
        &self.terminal_inputs
    }

    /// Nodes whose outputs this node reads, in declaration order.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Estimated cost ("terms").
    pub fn cost(&self) -> u64 {
        self.cost
    }
}

// =============================================================================
// DEPENDENCY GRAPH
// =============================================================================

/// Ordered set of dependency nodes for one calculation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "GraphRecord")]
pub struct DependencyGraph {
    calc_config_name: CalcConfigName,
    nodes: Vec<DependencyNode>,
    terminal_inputs: BTreeSet<ValueSpecification>,
}

/// Serialized form of a graph, before node ids are assigned.
#[derive(Deserialize)]
struct GraphRecord {
    calc_config_name: CalcConfigName,
    #[serde(default)]
    nodes: Vec<DependencyNode>,
    #[serde(default)]
    terminal_inputs: BTreeSet<ValueSpecification>,
}

impl From<GraphRecord> for DependencyGraph {
    fn from(record: GraphRecord) -> Self {
        let mut graph = DependencyGraph::new(record.calc_config_name);
        graph.terminal_inputs = record.terminal_inputs;
        for node in record.nodes {
            graph.add_node(node);
        }
        graph
    }
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new(calc_config_name: impl Into<CalcConfigName>) -> Self {
        Self {
            calc_config_name: calc_config_name.into(),
            nodes: Vec::new(),
            terminal_inputs: BTreeSet::new(),
        }
    }

    /// Calculation configuration the graph was built for.
    pub fn calc_config_name(&self) -> &CalcConfigName {
        &self.calc_config_name
    }

    /// Adds a node and returns its id. Ids follow insertion order.
    pub fn add_node(&mut self, mut node: DependencyNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.id = id;
        self.terminal_inputs
            .extend(node.terminal_inputs.iter().cloned());
        self.nodes.push(node);
        id
    }

    /// Declares that `consumer` reads the outputs of `input`.
    ///
    /// `input` may name a node that is added later; unresolved references are
    /// reported by [`DependencyGraph::validate`].
    pub fn add_input(&mut self, consumer: NodeId, input: NodeId) -> EngineResult<()> {
        let node = self
            .nodes
            .get_mut(consumer.index())
            .ok_or_else(|| EngineError::NodeNotFound(consumer.to_string()))?;
        if !node.inputs.contains(&input) {
            node.inputs.push(input);
        }
        Ok(())
    }

    /// Declares that `consumer` reads `spec` from the computation cache.
    pub fn add_terminal_input(
        &mut self,
        consumer: NodeId,
        spec: ValueSpecification,
    ) -> EngineResult<()> {
        let node = self
            .nodes
            .get_mut(consumer.index())
            .ok_or_else(|| EngineError::NodeNotFound(consumer.to_string()))?;
        if !node.terminal_inputs.contains(&spec) {
            node.terminal_inputs.push(spec.clone());
        }
        self.terminal_inputs.insert(spec);
        Ok(())
    }

    /// Looks up a node.
    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(id.index())
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    /// Input nodes of `id`.
    pub fn inputs_of(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.inputs()).unwrap_or(&[])
    }

    /// Nodes that read the outputs of `id`, in id order.
    pub fn dependents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Terminal values every execution needs in the computation cache.
    pub fn terminal_inputs(&self) -> &BTreeSet<ValueSpecification> {
        &self.terminal_inputs
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sum of node costs.
    pub fn total_cost(&self) -> u64 {
        self.nodes.iter().map(|n| n.cost).sum()
    }

    /// Dependents of every node, indexed by node. Dangling inputs are skipped.
    pub(crate) fn dependents_index(&self) -> Vec<Vec<NodeId>> {
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for input in &node.inputs {
                if let Some(list) = dependents.get_mut(input.index()) {
                    list.push(node.id);
                }
            }
        }
        dependents
    }

    /// Checks the graph is a closed DAG.
    ///
    /// Fails on inputs naming unknown nodes, on a value produced by more than
    /// one node, and on cycles.
    pub fn validate(&self) -> EngineResult<()> {
        self.check_inputs()?;

        let mut producers: HashMap<&ValueSpecification, NodeId> = HashMap::new();
        for node in &self.nodes {
            for output in &node.outputs {
                if let Some(first) = producers.insert(output, node.id) {
                    return Err(EngineError::GraphConsistency(format!(
                        "{} produced by both {} and {}",
                        output, first, node.id
                    )));
                }
            }
        }

        let mut dag: DiGraph<NodeId, ()> = DiGraph::with_capacity(self.nodes.len(), 0);
        for node in &self.nodes {
            dag.add_node(node.id);
        }
        for node in &self.nodes {
            for input in &node.inputs {
                dag.add_edge(NodeIndex::new(input.index()), NodeIndex::new(node.id.index()), ());
            }
        }
        toposort(&dag, None).map_err(|cycle| {
            EngineError::GraphConsistency(format!(
                "cycle through {}",
                NodeId(cycle.node_id().index())
            ))
        })?;

        Ok(())
    }

    fn check_inputs(&self) -> EngineResult<()> {
        for (position, node) in self.nodes.iter().enumerate() {
            if node.id.index() != position {
                return Err(EngineError::GraphConsistency(format!(
                    "{} sits at position {}",
                    node.id, position
                )));
            }
            for input in &node.inputs {
                if input.index() >= self.nodes.len() {
                    return Err(EngineError::GraphConsistency(format!(
                        "{} depends on unknown node {}",
                        node.id, input
                    )));
                }
            }
        }
        Ok(())
    }

    /// Nodes ordered inputs-first.
    ///
    /// Among nodes whose inputs are all placed, the lowest id goes first, so
    /// the order is stable for a given graph.
    pub fn topological_order(&self) -> EngineResult<Vec<NodeId>> {
        self.check_inputs()?;

        let dependents = self.dependents_index();
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.inputs.len()).collect();
        let mut ready: BTreeSet<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.inputs.is_empty())
            .map(|n| n.id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for dependent in &dependents[next.index()] {
                pending[dependent.index()] -= 1;
                if pending[dependent.index()] == 0 {
                    ready.insert(*dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = pending
                .iter()
                .position(|p| *p > 0)
                .map(NodeId)
                .unwrap_or(NodeId(0));
            return Err(EngineError::GraphConsistency(format!(
                "cycle through {}",
                stuck
            )));
        }
        Ok(order)
    }

    /// Job item invoking `id`: terminal inputs first, then the outputs of each
    /// input node in declaration order.
    pub fn job_item(&self, id: NodeId) -> Option<CalculationJobItem> {
        let node = self.node(id)?;
        let mut inputs = node.terminal_inputs.clone();
        for input in &node.inputs {
            if let Some(producer) = self.node(*input) {
                inputs.extend(producer.outputs.iter().cloned());
            }
        }
        Some(CalculationJobItem::new(
            node.function_id.clone(),
            node.target.clone(),
            inputs,
            node.outputs.clone(),
        ))
    }

    /// Returns statistics about the graph.
    pub fn stats(&self) -> GraphStats {
        let dependents = self.dependents_index();
        GraphStats {
            node_count: self.nodes.len(),
            edge_count: self.nodes.iter().map(|n| n.inputs.len()).sum(),
            terminal_input_count: self.terminal_inputs.len(),
            leaf_count: self.nodes.iter().filter(|n| n.inputs.is_empty()).count(),
            top_count: dependents.iter().filter(|d| d.is_empty()).count(),
            total_cost: self.total_cost(),
        }
    }
}

// =============================================================================
// GRAPH STATISTICS
// =============================================================================

/// Statistics about a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Number of nodes.
    pub node_count: usize,
    /// Number of node-to-node edges.
    pub edge_count: usize,
    /// Distinct terminal inputs.
    pub terminal_input_count: usize,
    /// Nodes with no input nodes.
    pub leaf_count: usize,
    /// Nodes nothing depends on.
    pub top_count: usize,
    /// Sum of node costs.
    pub total_cost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> DependencyNode {
        DependencyNode::new("Fn", name).with_output(ValueSpecification::new("Value", name))
    }

    /// N0, N1 and N4 read N2; N4 also reads N3.
    fn diamond() -> DependencyGraph {
        let mut graph = DependencyGraph::new("Default");
        let ids: Vec<NodeId> = (0..5).map(|i| graph.add_node(node(&format!("T{i}")))).collect();
        graph.add_input(ids[0], ids[2]).unwrap();
        graph.add_input(ids[1], ids[2]).unwrap();
        graph.add_input(ids[4], ids[2]).unwrap();
        graph.add_input(ids[4], ids[3]).unwrap();
        graph
    }

    #[test]
    fn test_ids_follow_insertion_order() {
        let graph = diamond();
        let ids: Vec<NodeId> = graph.nodes().iter().map(|n| n.id()).collect();
        assert_eq!(ids, (0..5).map(NodeId).collect::<Vec<_>>());
        assert_eq!(graph.node(NodeId(3)).unwrap().target().as_str(), "T3");
    }

    #[test]
    fn test_inputs_and_dependents() {
        let graph = diamond();
        assert_eq!(graph.inputs_of(NodeId(4)), &[NodeId(2), NodeId(3)]);
        assert_eq!(graph.dependents_of(NodeId(2)), vec![NodeId(0), NodeId(1), NodeId(4)]);
        assert!(graph.dependents_of(NodeId(0)).is_empty());
    }

    #[test]
    fn test_duplicate_edge_ignored() {
        let mut graph = diamond();
        graph.add_input(NodeId(0), NodeId(2)).unwrap();
        assert_eq!(graph.inputs_of(NodeId(0)).len(), 1);
    }

    #[test]
    fn test_add_input_unknown_consumer() {
        let mut graph = diamond();
        let err = graph.add_input(NodeId(9), NodeId(0)).unwrap_err();
        assert!(matches!(err, EngineError::NodeNotFound(_)));
    }

    #[test]
    fn test_validate_accepts_dag() {
        assert!(diamond().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut graph = diamond();
        graph.add_input(NodeId(2), NodeId(4)).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, EngineError::GraphConsistency(_)));
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_validate_rejects_self_loop() {
        let mut graph = diamond();
        graph.add_input(NodeId(1), NodeId(1)).unwrap();
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_input() {
        let mut graph = diamond();
        graph.add_input(NodeId(0), NodeId(7)).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("unknown node N7"));
    }

    #[test]
    fn test_forward_reference_resolves() {
        let mut graph = DependencyGraph::new("Default");
        let a = graph.add_node(node("A"));
        graph.add_input(a, NodeId(1)).unwrap();
        graph.add_node(node("B"));
        assert!(graph.validate().is_ok());
        assert_eq!(graph.topological_order().unwrap(), vec![NodeId(1), NodeId(0)]);
    }

    #[test]
    fn test_validate_rejects_duplicate_output() {
        let mut graph = DependencyGraph::new("Default");
        graph.add_node(node("A"));
        graph.add_node(DependencyNode::new("Other", "A").with_output(ValueSpecification::new("Value", "A")));
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("produced by both N0 and N1"));
    }

    #[test]
    fn test_topological_order_is_stable() {
        let graph = diamond();
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![NodeId(2), NodeId(0), NodeId(1), NodeId(3), NodeId(4)]
        );
    }

    #[test]
    fn test_job_item_inputs() {
        let mut graph = diamond();
        graph
            .add_terminal_input(NodeId(4), ValueSpecification::new("Quote", "T4"))
            .unwrap();
        let item = graph.job_item(NodeId(4)).unwrap();
        assert_eq!(
            item.inputs,
            vec![
                ValueSpecification::new("Quote", "T4"),
                ValueSpecification::new("Value", "T2"),
                ValueSpecification::new("Value", "T3"),
            ]
        );
        assert_eq!(item.outputs, vec![ValueSpecification::new("Value", "T4")]);
        assert_eq!(graph.terminal_inputs().len(), 1);
    }

    #[test]
    fn test_stats() {
        let graph = diamond();
        let stats = graph.stats();
        assert_eq!(stats.node_count, 5);
        assert_eq!(stats.edge_count, 4);
        assert_eq!(stats.leaf_count, 2);
        assert_eq!(stats.top_count, 3);
        assert_eq!(stats.total_cost, 5);
    }

    #[test]
    fn test_graph_survives_json() {
        let mut graph = diamond();
        graph
            .add_terminal_input(NodeId(3), ValueSpecification::new("Quote", "T3"))
            .unwrap();
        let json = serde_json::to_string(&graph).unwrap();
        let restored: DependencyGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.nodes(), graph.nodes());
        assert_eq!(restored.terminal_inputs(), graph.terminal_inputs());
        assert_eq!(restored.stats(), graph.stats());
    }

    #[test]
    fn test_json_node_ids_follow_position() {
        let mut graph = DependencyGraph::new("Default");
        graph.add_node(node("A"));
        let mut json = serde_json::to_value(&graph).unwrap();
        json["nodes"][0]["id"] = serde_json::json!(7);

        let restored: DependencyGraph = serde_json::from_value(json).unwrap();
        assert_eq!(restored.nodes()[0].id(), NodeId(0));
        assert!(restored.validate().is_ok());
        assert_eq!(restored.topological_order().unwrap(), vec![NodeId(0)]);
    }

    #[test]
    fn test_misplaced_node_id_is_rejected() {
        let mut graph = diamond();
        graph.nodes[1].id = NodeId(7);
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, EngineError::GraphConsistency(_)));
        assert!(err.to_string().contains("N7 sits at position 1"));
        assert!(graph.topological_order().is_err());
    }
}
