//! Builder pattern for the multiple-node executor.

use std::sync::Arc;

use viewcalc_traits::{CalculationWorker, Codec, ExecutorConfig, PartitionBounds};

use crate::cache::ViewComputationCache;
use crate::error::{EngineError, EngineResult};
use crate::executor::MultipleNodeExecutor;
use crate::function::FunctionRepository;
use crate::invoker::JobInvoker;
use crate::local_node::LocalCalculationNode;
use crate::remote_node::RemoteNodeServer;

// Starts a remote node with the configured request queue depth
type RemoteStarter = Box<dyn FnOnce(usize) -> Arc<dyn CalculationWorker> + Send>;

/// Builder for constructing a [`MultipleNodeExecutor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    config: Option<ExecutorConfig>,
    bounds: Option<PartitionBounds>,
    worker: Option<Arc<dyn CalculationWorker>>,
    local: Option<(Arc<FunctionRepository>, Arc<ViewComputationCache>)>,
    remote: Option<RemoteStarter>,
}

impl ExecutorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the executor configuration.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the configured partition bounds.
    pub fn with_bounds(mut self, bounds: PartitionBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Dispatch jobs to `worker`.
    pub fn with_worker(mut self, worker: impl CalculationWorker + 'static) -> Self {
        self.worker = Some(Arc::new(worker));
        self
    }

    /// Dispatch jobs to a worker shared with other executors.
    pub fn with_shared_worker(mut self, worker: Arc<dyn CalculationWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Dispatch jobs to an in-process node with `local_slots` slots.
    ///
    /// Ignored when a worker is set explicitly.
    pub fn with_local_node(
        mut self,
        functions: Arc<FunctionRepository>,
        cache: Arc<ViewComputationCache>,
    ) -> Self {
        self.local = Some((functions, cache));
        self
    }

    /// Dispatch jobs to `server`, started by [`build`](Self::build) with a
    /// request queue of `remote_queue_depth` jobs.
    ///
    /// Takes precedence over a local node and is ignored when a worker is
    /// set explicitly. The server stops once the executor is dropped. Must be
    /// built inside a tokio runtime.
    pub fn with_remote_node<C: Codec + Clone + 'static>(
        mut self,
        server: RemoteNodeServer<C>,
    ) -> Self {
        self.remote = Some(Box::new(move |queue_depth| {
            let (node, _server) = server.serve(queue_depth);
            Arc::new(node) as Arc<dyn CalculationWorker>
        }));
        self
    }

    /// Build the executor.
    pub fn build(self) -> EngineResult<MultipleNodeExecutor> {
        let mut config = self.config.unwrap_or_default();
        if let Some(bounds) = self.bounds {
            config.bounds = bounds;
        }
        config.validate()?;

        let worker = match (self.worker, self.remote, self.local) {
            (Some(worker), _, _) => worker,
            (None, Some(start), _) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(EngineError::InvalidConfig(
                        "a remote node needs a running tokio runtime".into(),
                    ));
                }
                start(config.remote_queue_depth)
            }
            (None, None, Some((functions, cache))) => {
                let invoker = JobInvoker::new(functions, cache);
                Arc::new(LocalCalculationNode::new("local", config.local_slots, invoker))
                    as Arc<dyn CalculationWorker>
            }
            (None, None, None) => {
                return Err(EngineError::InvalidConfig(
                    "no calculation node configured".into(),
                ))
            }
        };

        MultipleNodeExecutor::new(config, worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_worker() {
        let err = ExecutorBuilder::new().build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_build_rejects_bad_bounds() {
        let err = ExecutorBuilder::new()
            .with_local_node(
                Arc::new(FunctionRepository::new()),
                Arc::new(ViewComputationCache::new()),
            )
            .with_bounds(PartitionBounds::items(5, Some(2), None))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_bounds_override_config() {
        let executor = ExecutorBuilder::new()
            .with_config(ExecutorConfig {
                local_slots: 2,
                ..ExecutorConfig::default()
            })
            .with_bounds(PartitionBounds::items(1, Some(3), Some(2)))
            .with_local_node(
                Arc::new(FunctionRepository::new()),
                Arc::new(ViewComputationCache::new()),
            )
            .build()
            .unwrap();

        assert_eq!(executor.config().bounds.max_job_items, Some(3));
        assert_eq!(executor.worker().name(), "local");
        assert_eq!(executor.worker().capacity(), Some(2));
    }

    fn remote_server() -> RemoteNodeServer {
        let invoker = JobInvoker::new(
            Arc::new(FunctionRepository::new()),
            Arc::new(ViewComputationCache::new()),
        );
        RemoteNodeServer::new("remote-1", viewcalc_ext_json::JsonCodec::new(), invoker)
    }

    #[tokio::test]
    async fn test_remote_node_uses_queue_depth() {
        let executor = ExecutorBuilder::new()
            .with_config(ExecutorConfig {
                remote_queue_depth: 5,
                ..ExecutorConfig::default()
            })
            .with_local_node(
                Arc::new(FunctionRepository::new()),
                Arc::new(ViewComputationCache::new()),
            )
            .with_remote_node(remote_server())
            .build()
            .unwrap();

        assert_eq!(executor.worker().name(), "remote-1");
        assert_eq!(executor.worker().capacity(), Some(5));
    }

    #[test]
    fn test_remote_node_needs_runtime() {
        let err = ExecutorBuilder::new()
            .with_remote_node(remote_server())
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
