//! What a graph execution produced.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use uuid::Uuid;

use crate::registry::JobRecord;

use viewcalc_traits::{
    BatchId, CalculatedValue, ComputedValue, FragmentId, NodeId, ValueSpecification,
};

/// Outcome for one dependency node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    /// The node's function ran; its outputs in declaration order
    Computed(Vec<ComputedValue>),
    /// The node's fragment job failed
    Failed {
        /// Why
        reason: String,
    },
    /// A fragment this node depends on failed, so it never ran
    UpstreamFailed {
        /// The fragment that failed
        fragment: FragmentId,
    },
    /// The execution was cancelled before this node's result was accepted
    Cancelled,
}

impl NodeStatus {
    /// Returns true if the node computed its outputs.
    pub fn is_computed(&self) -> bool {
        matches!(self, NodeStatus::Computed(_))
    }

    /// Returns true if the node or something upstream of it failed.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            NodeStatus::Failed { .. } | NodeStatus::UpstreamFailed { .. }
        )
    }
}

/// Counters for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Fragments in the partition
    pub fragments: usize,
    /// Jobs accepted by a calculation node
    pub jobs_dispatched: u64,
    /// Refused dispatch attempts that were retried
    pub dispatch_retries: u64,
    /// Fragments whose results were accepted
    pub completed_fragments: usize,
    /// Fragments whose own job failed
    pub failed_fragments: usize,
    /// Fragments skipped because an input fragment failed
    pub upstream_failed_fragments: usize,
    /// Fragments cancelled or whose results were discarded
    pub cancelled_fragments: usize,
    /// Wall time from start until every fragment settled
    pub elapsed: Duration,
}

/// Per-node outcomes and computed values of one graph execution.
#[derive(Debug, Clone)]
pub struct GraphExecutionResult {
    execution_id: Uuid,
    batch_id: BatchId,
    statuses: BTreeMap<NodeId, NodeStatus>,
    values: HashMap<ValueSpecification, CalculatedValue>,
    stats: ExecutionStats,
    jobs: Vec<JobRecord>,
}

impl GraphExecutionResult {
    pub(crate) fn new(
        execution_id: Uuid,
        batch_id: BatchId,
        statuses: BTreeMap<NodeId, NodeStatus>,
        values: HashMap<ValueSpecification, CalculatedValue>,
        stats: ExecutionStats,
        jobs: Vec<JobRecord>,
    ) -> Self {
        Self {
            execution_id,
            batch_id,
            statuses,
            values,
            stats,
            jobs,
        }
    }

    /// Execution id.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Batch every job of this execution carried.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Outcome for one node.
    pub fn status(&self, node: NodeId) -> Option<&NodeStatus> {
        self.statuses.get(&node)
    }

    /// Outcomes for every node, in node order.
    pub fn statuses(&self) -> &BTreeMap<NodeId, NodeStatus> {
        &self.statuses
    }

    /// Every computed value.
    pub fn values(&self) -> &HashMap<ValueSpecification, CalculatedValue> {
        &self.values
    }

    /// One computed value.
    pub fn value(&self, spec: &ValueSpecification) -> Option<&CalculatedValue> {
        self.values.get(spec)
    }

    /// Counters.
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Every job the execution issued, in id order, in its final state.
    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    /// Returns true if every node computed.
    pub fn is_complete(&self) -> bool {
        self.statuses.values().all(NodeStatus::is_computed)
    }

    /// Nodes whose own fragment job failed.
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|s| matches!(s, NodeStatus::Failed { .. }))
    }

    /// Nodes skipped because of an upstream failure.
    pub fn upstream_failed_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|s| matches!(s, NodeStatus::UpstreamFailed { .. }))
    }

    /// Nodes that were cancelled.
    pub fn cancelled_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|s| matches!(s, NodeStatus::Cancelled))
    }

    fn nodes_where(&self, predicate: impl Fn(&NodeStatus) -> bool) -> Vec<NodeId> {
        self.statuses
            .iter()
            .filter(|(_, status)| predicate(status))
            .map(|(node, _)| *node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_queries() {
        let spec = ValueSpecification::new("Value", "A");
        let mut statuses = BTreeMap::new();
        statuses.insert(
            NodeId(0),
            NodeStatus::Computed(vec![ComputedValue::new(
                spec.clone(),
                CalculatedValue::Double(1.0),
            )]),
        );
        statuses.insert(
            NodeId(1),
            NodeStatus::Failed {
                reason: "boom".into(),
            },
        );
        statuses.insert(
            NodeId(2),
            NodeStatus::UpstreamFailed {
                fragment: FragmentId(1),
            },
        );
        let values = HashMap::from([(spec.clone(), CalculatedValue::Double(1.0))]);

        let result = GraphExecutionResult::new(
            Uuid::new_v4(),
            BatchId(1),
            statuses,
            values,
            ExecutionStats::default(),
            Vec::new(),
        );

        assert!(!result.is_complete());
        assert_eq!(result.failed_nodes(), vec![NodeId(1)]);
        assert_eq!(result.upstream_failed_nodes(), vec![NodeId(2)]);
        assert!(result.cancelled_nodes().is_empty());
        assert_eq!(result.value(&spec), Some(&CalculatedValue::Double(1.0)));
        assert!(result.status(NodeId(2)).unwrap().is_failure());
    }
}
