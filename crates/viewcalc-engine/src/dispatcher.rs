//! Turning fragments into jobs and handing them to a calculation node.
//!
//! - [`JobIdSource`]: process-wide job and batch ids
//! - [`fragment_job`]: the job for one fragment, items in fragment order
//! - [`Dispatcher`]: offers a job to the worker, retrying refusals

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use viewcalc_traits::{
    BatchId, CalculationJob, CalculationJobSpecification, CalculationWorker, DispatchError,
    FragmentId, JobId, JobTicket, RetryPolicy,
};

use crate::fragment::GraphFragment;
use crate::graph::DependencyGraph;
use crate::registry::{JobRecord, JobRegistry, JobState};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide source of job and batch ids. Ids are never reused.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobIdSource;

impl JobIdSource {
    /// Next job id.
    pub fn next_job_id() -> JobId {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Next batch id.
    pub fn next_batch_id() -> BatchId {
        BatchId(NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Builds the job executing `fragment`: one item per node, in fragment order.
pub fn fragment_job(
    graph: &DependencyGraph,
    fragment: &GraphFragment,
    specification: CalculationJobSpecification,
) -> CalculationJob {
    CalculationJob {
        specification,
        items: fragment
            .nodes()
            .iter()
            .filter_map(|node| graph.job_item(*node))
            .collect(),
    }
}

/// A job a calculation node accepted.
#[derive(Debug)]
pub struct DispatchedJob {
    /// Resolves to the job's result
    pub ticket: JobTicket,
    /// Attempts it took, including the successful one
    pub attempts: u32,
}

/// A job no calculation node accepted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error} (after {attempts} attempts)")]
pub struct DispatchFailure {
    /// Last refusal
    pub error: DispatchError,
    /// Attempts made
    pub attempts: u32,
}

/// Hands jobs to a calculation worker.
pub struct Dispatcher {
    worker: Arc<dyn CalculationWorker>,
    retry: RetryPolicy,
    registry: Arc<JobRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        worker: Arc<dyn CalculationWorker>,
        retry: RetryPolicy,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            worker,
            retry,
            registry,
        }
    }

    /// Worker jobs go to.
    pub fn worker(&self) -> &Arc<dyn CalculationWorker> {
        &self.worker
    }

    /// Registry jobs are recorded in.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Registers `job` and offers it to the worker.
    ///
    /// A refusal the worker marks retryable is retried with the same job
    /// specification after the policy's backoff, up to `max_attempts` in
    /// total. Any other refusal is final.
    pub async fn dispatch(
        &self,
        fragment: FragmentId,
        job: &CalculationJob,
    ) -> Result<DispatchedJob, DispatchFailure> {
        let job_id = job.specification.job_id;
        self.registry
            .register(JobRecord::submitted(&job.specification, fragment, job.items.len()));

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 1;

        loop {
            match self.worker.dispatch(job.clone()).await {
                Ok(ticket) => {
                    self.registry.mark_dispatched(job_id, self.worker.name());
                    debug!(
                        job_id = %job_id,
                        fragment = %fragment,
                        items = job.items.len(),
                        worker = self.worker.name(),
                        attempts = attempts,
                        "Job dispatched"
                    );
                    return Ok(DispatchedJob { ticket, attempts });
                }
                Err(error) if error.is_retryable() && attempts < max_attempts => {
                    warn!(
                        job_id = %job_id,
                        attempt = attempts,
                        max_attempts = max_attempts,
                        error = %error,
                        "Dispatch refused, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff()).await;
                    attempts += 1;
                }
                Err(error) => {
                    warn!(
                        job_id = %job_id,
                        fragment = %fragment,
                        attempts = attempts,
                        error = %error,
                        "Dispatch failed"
                    );
                    self.registry.finish(job_id, JobState::Rejected);
                    return Err(DispatchFailure { error, attempts });
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker", &self.worker.name())
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use viewcalc_traits::*;

    /// Refuses the first `refusals` offers, then answers with an empty success.
    struct Refusing {
        refusals: Mutex<u32>,
        error: DispatchError,
        seen: Mutex<Vec<JobId>>,
    }

    impl Refusing {
        fn new(refusals: u32, error: DispatchError) -> Self {
            Self {
                refusals: Mutex::new(refusals),
                error,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CalculationWorker for Refusing {
        async fn dispatch(&self, job: CalculationJob) -> Result<JobTicket, DispatchError> {
            self.seen.lock().push(job.specification.job_id);
            {
                let mut refusals = self.refusals.lock();
                if *refusals > 0 {
                    *refusals -= 1;
                    return Err(self.error.clone());
                }
            }
            let (tx, ticket) = JobTicket::channel(job.specification.job_id);
            tx.send(JobResult::success(job.specification, vec![], "refusing"));
            Ok(ticket)
        }

        fn name(&self) -> &str {
            "refusing"
        }
    }

    fn job() -> CalculationJob {
        CalculationJob {
            specification: CalculationJobSpecification::new(
                ViewName::new("V"),
                CalcConfigName::new("Default"),
                JobIdSource::next_batch_id(),
                JobIdSource::next_job_id(),
            ),
            items: vec![],
        }
    }

    fn dispatcher(worker: Arc<Refusing>, max_attempts: u32) -> Dispatcher {
        Dispatcher::new(
            worker,
            RetryPolicy {
                max_attempts,
                backoff_ms: 1,
            },
            Arc::new(JobRegistry::new()),
        )
    }

    #[test]
    fn test_ids_are_unique() {
        let a = JobIdSource::next_job_id();
        let b = JobIdSource::next_job_id();
        assert!(b > a);
        assert_ne!(JobIdSource::next_batch_id(), JobIdSource::next_batch_id());
    }

    #[test]
    fn test_fragment_job_follows_fragment_order() {
        let mut graph = DependencyGraph::new("Default");
        let a = graph.add_node(
            crate::graph::DependencyNode::new("Fn", "A")
                .with_output(ValueSpecification::new("Value", "A")),
        );
        let b = graph.add_node(
            crate::graph::DependencyNode::new("Fn", "B")
                .with_output(ValueSpecification::new("Value", "B")),
        );
        graph.add_input(b, a).unwrap();

        let fragment = GraphFragment::with_nodes(FragmentId(0), vec![a, b], 2);
        let spec = job().specification;
        let built = fragment_job(&graph, &fragment, spec.clone());

        assert_eq!(built.specification, spec);
        assert_eq!(built.items.len(), 2);
        assert_eq!(built.items[0].target, ComputationTargetRef::new("A"));
        assert_eq!(built.items[1].inputs, vec![ValueSpecification::new("Value", "A")]);
    }

    #[tokio::test]
    async fn test_retry_below_limit_succeeds() {
        let worker = Arc::new(Refusing::new(2, DispatchError::NoWorkerAvailable));
        let dispatcher = dispatcher(worker.clone(), 3);
        let job = job();

        let dispatched = dispatcher.dispatch(FragmentId(0), &job).await.unwrap();
        assert_eq!(dispatched.attempts, 3);
        assert!(dispatched.ticket.await.is_some());

        // Every attempt carried the same job spec
        let seen = worker.seen.lock().clone();
        assert_eq!(seen, vec![job.specification.job_id; 3]);

        let record = dispatcher.registry().get(job.specification.job_id).unwrap();
        assert_eq!(record.state, JobState::Dispatched);
        assert_eq!(record.worker.as_deref(), Some("refusing"));
    }

    #[tokio::test]
    async fn test_retry_at_limit_fails() {
        let worker = Arc::new(Refusing::new(3, DispatchError::NoWorkerAvailable));
        let dispatcher = dispatcher(worker, 3);
        let job = job();

        let failure = dispatcher.dispatch(FragmentId(0), &job).await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error, DispatchError::NoWorkerAvailable);
        assert_eq!(
            failure.to_string(),
            "no calculation node available (after 3 attempts)"
        );
        let record = dispatcher.registry().get(job.specification.job_id).unwrap();
        assert_eq!(record.state, JobState::Rejected);
    }

    #[tokio::test]
    async fn test_disconnect_is_not_retried() {
        let worker = Arc::new(Refusing::new(1, DispatchError::Disconnected("gone".into())));
        let dispatcher = dispatcher(worker.clone(), 5);

        let failure = dispatcher.dispatch(FragmentId(0), &job()).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(worker.seen.lock().len(), 1);
    }
}
