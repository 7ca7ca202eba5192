//! The multiple-node executor.
//!
//! [`MultipleNodeExecutor`] partitions a dependency graph into fragments and
//! runs them as jobs on a calculation worker, dispatching each fragment as
//! soon as its inputs are available.
//!
//! ## Usage
//!
//! ```ignore
//! let executor = ExecutorBuilder::new()
//!     .with_config(ExecutorConfig::from_file("viewcalc.toml")?)
//!     .with_local_node(functions, cache)
//!     .build()?;
//!
//! let result = executor.execute(graph).await?;
//! for node in result.failed_nodes() {
//!     warn!(node = %node, "Node failed");
//! }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use viewcalc_traits::{BatchId, CalculationWorker, ExecutorConfig, FragmentId, ViewName};

use crate::aggregator::{Aggregator, FragmentStatus};
use crate::dispatcher::{Dispatcher, JobIdSource};
use crate::error::{EngineError, EngineResult};
use crate::fragment::FragmentTree;
use crate::graph::DependencyGraph;
use crate::partitioner::partition;
use crate::registry::{JobRecord, JobRegistry};
use crate::result::GraphExecutionResult;

/// Executes dependency graphs as partitioned jobs.
pub struct MultipleNodeExecutor {
    config: ExecutorConfig,
    view_name: ViewName,
    dispatcher: Arc<Dispatcher>,
}

impl MultipleNodeExecutor {
    /// Create an executor. Fails if the configuration is unusable.
    pub fn new(config: ExecutorConfig, worker: Arc<dyn CalculationWorker>) -> EngineResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(worker, config.retry.clone(), Arc::new(JobRegistry::new()));
        Ok(Self {
            view_name: ViewName::new(config.view_name.clone()),
            config,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Worker jobs are dispatched to.
    pub fn worker(&self) -> &Arc<dyn CalculationWorker> {
        self.dispatcher.worker()
    }

    /// Jobs of executions that are still running.
    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        self.dispatcher.registry()
    }

    /// Partitions `graph` with the configured bounds without executing it.
    pub fn partition(&self, graph: &DependencyGraph) -> EngineResult<FragmentTree> {
        partition(graph, &self.config.bounds)
    }

    /// Starts executing `graph` and returns at once.
    ///
    /// Graph-consistency errors are returned here, before any job is
    /// dispatched. Must be called from within a tokio runtime.
    pub fn start(&self, graph: impl Into<Arc<DependencyGraph>>) -> EngineResult<ExecutionHandle> {
        let graph = graph.into();
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::Internal(
                "execution must start inside a tokio runtime".into(),
            ));
        }

        let tree = Arc::new(self.partition(&graph)?);
        let execution_id = Uuid::new_v4();
        let batch_id = JobIdSource::next_batch_id();
        debug!(
            execution_id = %execution_id,
            calc_config = %graph.calc_config_name(),
            fragments = tree.len(),
            "Graph partitioned"
        );

        let aggregator = Aggregator::new(
            execution_id,
            self.view_name.clone(),
            batch_id,
            graph,
            Arc::clone(&tree),
            Arc::clone(&self.dispatcher),
        );
        let done = aggregator.subscribe();
        aggregator.start();

        Ok(ExecutionHandle {
            execution_id,
            batch_id,
            tree,
            registry: Arc::clone(self.dispatcher.registry()),
            aggregator,
            done,
        })
    }

    /// Executes `graph` and waits for every fragment to settle.
    pub async fn execute(
        &self,
        graph: impl Into<Arc<DependencyGraph>>,
    ) -> EngineResult<GraphExecutionResult> {
        self.start(graph)?.wait().await
    }
}

impl std::fmt::Debug for MultipleNodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipleNodeExecutor")
            .field("view_name", &self.view_name)
            .field("bounds", &self.config.bounds)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

// =============================================================================
// EXECUTION HANDLE
// =============================================================================

/// A running execution.
pub struct ExecutionHandle {
    execution_id: Uuid,
    batch_id: BatchId,
    tree: Arc<FragmentTree>,
    registry: Arc<JobRegistry>,
    aggregator: Arc<Aggregator>,
    done: watch::Receiver<bool>,
}

impl ExecutionHandle {
    /// Execution id.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Batch id carried by every job of this execution.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// The partition being executed.
    pub fn tree(&self) -> &FragmentTree {
        &self.tree
    }

    /// Stops dispatching. Fragments not yet dispatched are cancelled; jobs
    /// already running finish and their results are discarded.
    pub fn cancel(&self) {
        self.aggregator.cancel();
    }

    /// Returns true once `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.aggregator.is_cancelled()
    }

    /// Returns true once every fragment has settled.
    pub fn is_finished(&self) -> bool {
        self.aggregator.is_finished()
    }

    /// Current status of one fragment.
    pub fn fragment_status(&self, id: FragmentId) -> Option<FragmentStatus> {
        self.aggregator.fragment_status(id)
    }

    /// Registry of the executor that started this execution.
    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Jobs issued by this execution so far, in id order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.aggregator.jobs()
    }

    /// Waits for every fragment to settle and returns the result.
    pub async fn wait(mut self) -> EngineResult<GraphExecutionResult> {
        self.done
            .wait_for(|finished| *finished)
            .await
            .map_err(|_| EngineError::Internal("execution state dropped".into()))?;
        Ok(self.aggregator.snapshot())
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("execution_id", &self.execution_id)
            .field("batch_id", &self.batch_id)
            .field("fragments", &self.tree.len())
            .field("finished", &self.is_finished())
            .finish()
    }
}
