//! Per-execution fragment bookkeeping.
//!
//! One [`Aggregator`] drives one execution of a partitioned graph:
//! - leaf fragments are dispatched on start
//! - every job result is validated, then recorded
//! - a consumer is dispatched the moment its last input fragment completes,
//!   from the task that delivered that input
//! - a failure settles every transitive consumer as upstream-failed
//! - the execution is finished once every fragment has settled, and its
//!   jobs move from the registry into the result
//!
//! Each fragment settles exactly once. Fragment state sits behind its own
//! lock; results behind one coordination lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use viewcalc_traits::{
    BatchId, CalculatedValue, CalculationJob, CalculationJobSpecification, FragmentId, JobFailure,
    JobId, JobItemResult, JobOutcome, JobResult, NodeId, ValueSpecification, ViewName,
};

use crate::dispatcher::{fragment_job, Dispatcher, JobIdSource};
use crate::fragment::{FragmentTree, GraphFragment};
use crate::graph::DependencyGraph;
use crate::registry::{JobRecord, JobState};
use crate::result::{ExecutionStats, GraphExecutionResult, NodeStatus};

/// Where a fragment is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentStatus {
    /// Waiting for input fragments
    Pending,
    /// Handed to the dispatcher as this job
    Dispatched(JobId),
    /// Results accepted
    Completed,
    /// The fragment's job failed
    Failed {
        /// Why
        reason: String,
    },
    /// An input fragment failed
    UpstreamFailed {
        /// The fragment that failed
        fragment: FragmentId,
    },
    /// Cancelled before dispatch, or its result discarded
    Cancelled,
}

impl FragmentStatus {
    /// Returns true once the fragment can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FragmentStatus::Pending | FragmentStatus::Dispatched(_))
    }
}

#[derive(Debug)]
struct FragmentState {
    status: FragmentStatus,
    pending_inputs: usize,
}

#[derive(Debug, Default)]
struct ResultMap {
    statuses: BTreeMap<NodeId, NodeStatus>,
    values: HashMap<ValueSpecification, CalculatedValue>,
}

pub(crate) struct Aggregator {
    execution_id: Uuid,
    view_name: ViewName,
    batch_id: BatchId,
    graph: Arc<DependencyGraph>,
    tree: Arc<FragmentTree>,
    dispatcher: Arc<Dispatcher>,
    fragments: BTreeMap<FragmentId, Mutex<FragmentState>>,
    results: Mutex<ResultMap>,
    outstanding: AtomicUsize,
    cancelled: AtomicBool,
    jobs_dispatched: AtomicU64,
    dispatch_retries: AtomicU64,
    started: Instant,
    elapsed: Mutex<Option<Duration>>,
    // None until the batch is taken out of the registry
    jobs: Mutex<Option<Vec<JobRecord>>>,
    done: watch::Sender<bool>,
}

impl Aggregator {
    pub(crate) fn new(
        execution_id: Uuid,
        view_name: ViewName,
        batch_id: BatchId,
        graph: Arc<DependencyGraph>,
        tree: Arc<FragmentTree>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let fragments = tree
            .fragments()
            .iter()
            .map(|f| {
                (
                    f.id(),
                    Mutex::new(FragmentState {
                        status: FragmentStatus::Pending,
                        pending_inputs: f.inputs().len(),
                    }),
                )
            })
            .collect();
        let (done, _) = watch::channel(false);

        Arc::new(Self {
            execution_id,
            view_name,
            batch_id,
            outstanding: AtomicUsize::new(tree.len()),
            graph,
            tree,
            dispatcher,
            fragments,
            results: Mutex::new(ResultMap::default()),
            cancelled: AtomicBool::new(false),
            jobs_dispatched: AtomicU64::new(0),
            dispatch_retries: AtomicU64::new(0),
            started: Instant::now(),
            elapsed: Mutex::new(None),
            jobs: Mutex::new(None),
            done,
        })
    }

    /// Dispatches every leaf fragment. Must run inside a tokio runtime.
    pub(crate) fn start(self: &Arc<Self>) {
        info!(
            execution_id = %self.execution_id,
            batch_id = %self.batch_id,
            fragments = self.tree.len(),
            nodes = self.graph.len(),
            "Execution started"
        );

        if self.tree.is_empty() {
            self.finish();
            return;
        }
        for leaf in self.tree.leaves() {
            self.spawn(leaf);
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn fragment_status(&self, id: FragmentId) -> Option<FragmentStatus> {
        self.fragments.get(&id).map(|s| s.lock().status.clone())
    }

    /// Jobs of this execution so far, in id order.
    pub(crate) fn jobs(&self) -> Vec<JobRecord> {
        let jobs = self.jobs.lock();
        match jobs.as_ref() {
            Some(finished) => finished.clone(),
            None => self.dispatcher.registry().jobs_for_batch(self.batch_id),
        }
    }

    /// Settles every fragment not yet dispatched as cancelled. Jobs already
    /// dispatched run on; their results are discarded.
    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(execution_id = %self.execution_id, "Execution cancelled");

        for (id, slot) in &self.fragments {
            let cancelled = {
                let mut state = slot.lock();
                if state.status == FragmentStatus::Pending {
                    state.status = FragmentStatus::Cancelled;
                    true
                } else {
                    false
                }
            };
            if cancelled {
                self.record_nodes(*id, NodeStatus::Cancelled);
                self.settle_one();
            }
        }
    }

    /// Builds the execution result from the current state.
    pub(crate) fn snapshot(&self) -> GraphExecutionResult {
        let mut stats = ExecutionStats {
            fragments: self.tree.len(),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::SeqCst),
            dispatch_retries: self.dispatch_retries.load(Ordering::SeqCst),
            elapsed: (*self.elapsed.lock()).unwrap_or_else(|| self.started.elapsed()),
            ..ExecutionStats::default()
        };
        for slot in self.fragments.values() {
            match slot.lock().status {
                FragmentStatus::Completed => stats.completed_fragments += 1,
                FragmentStatus::Failed { .. } => stats.failed_fragments += 1,
                FragmentStatus::UpstreamFailed { .. } => stats.upstream_failed_fragments += 1,
                FragmentStatus::Cancelled => stats.cancelled_fragments += 1,
                FragmentStatus::Pending | FragmentStatus::Dispatched(_) => {}
            }
        }

        let jobs = self.jobs();
        let results = self.results.lock();
        GraphExecutionResult::new(
            self.execution_id,
            self.batch_id,
            results.statuses.clone(),
            results.values.clone(),
            stats,
            jobs,
        )
    }

    // =========================================================================
    // FRAGMENT LIFECYCLE
    // =========================================================================

    fn spawn(self: &Arc<Self>, id: FragmentId) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_fragment(id).await });
    }

    async fn run_fragment(self: Arc<Self>, id: FragmentId) {
        let Some(fragment) = self.tree.fragment(id) else {
            return;
        };
        let Some(job_id) = self.claim(id) else {
            return;
        };

        let specification = CalculationJobSpecification::new(
            self.view_name.clone(),
            self.graph.calc_config_name().clone(),
            self.batch_id,
            job_id,
        );
        let job = fragment_job(&self.graph, fragment, specification);

        let ticket = match self.dispatcher.dispatch(id, &job).await {
            Ok(dispatched) => {
                self.jobs_dispatched.fetch_add(1, Ordering::SeqCst);
                self.dispatch_retries
                    .fetch_add(u64::from(dispatched.attempts - 1), Ordering::SeqCst);
                dispatched.ticket
            }
            Err(failure) => {
                self.dispatch_retries
                    .fetch_add(u64::from(failure.attempts.saturating_sub(1)), Ordering::SeqCst);
                let failure = JobFailure::whole_job(format!("dispatch failed: {}", failure));
                self.fail(fragment, None, failure);
                return;
            }
        };

        let outcome = match ticket.await {
            Some(result) => self.check_result(&job, result),
            None => {
                error!(
                    job_id = %job_id,
                    fragment = %id,
                    "Calculation node dropped job without a result"
                );
                Err(JobFailure::whole_job(format!(
                    "{} was dropped without a result",
                    job_id
                )))
            }
        };

        match outcome {
            Ok(items) => self.complete(fragment, job_id, items),
            Err(failure) => self.fail(fragment, Some(job_id), failure),
        }
    }

    /// Moves a pending fragment to dispatched, allocating its job id.
    fn claim(&self, id: FragmentId) -> Option<JobId> {
        let slot = self.fragments.get(&id)?;
        let mut state = slot.lock();
        if state.status != FragmentStatus::Pending {
            return None;
        }
        if self.is_cancelled() {
            state.status = FragmentStatus::Cancelled;
            drop(state);
            self.record_nodes(id, NodeStatus::Cancelled);
            self.settle_one();
            return None;
        }
        let job_id = JobIdSource::next_job_id();
        state.status = FragmentStatus::Dispatched(job_id);
        Some(job_id)
    }

    /// Checks a result answers `job` and carries every declared output.
    fn check_result(
        &self,
        job: &CalculationJob,
        result: JobResult,
    ) -> Result<Vec<JobItemResult>, JobFailure> {
        let job_id = job.specification.job_id;
        if result.specification.job_id != job_id {
            error!(
                job_id = %job_id,
                answered = %result.specification.job_id,
                "Result answers a different job"
            );
            return Err(JobFailure::whole_job(format!(
                "result for {} answered {}",
                job_id, result.specification.job_id
            )));
        }

        let items = match result.outcome {
            JobOutcome::Success(items) => items,
            JobOutcome::Failure(failure) => return Err(failure),
        };

        if items.len() != job.items.len() {
            error!(
                job_id = %job_id,
                expected = job.items.len(),
                received = items.len(),
                "Result item count mismatch"
            );
            return Err(JobFailure::whole_job(format!(
                "expected {} item results, received {}",
                job.items.len(),
                items.len()
            )));
        }

        for (index, (item, answer)) in job.items.iter().zip(&items).enumerate() {
            let produced: Vec<&ValueSpecification> =
                answer.values.iter().map(|v| &v.specification).collect();
            let declared: Vec<&ValueSpecification> = item.outputs.iter().collect();
            if produced != declared {
                error!(job_id = %job_id, item = index, "Result outputs do not match job item");
                return Err(JobFailure::at_item(
                    index,
                    "result outputs do not match declared outputs",
                ));
            }
        }

        Ok(items)
    }

    fn complete(self: &Arc<Self>, fragment: &GraphFragment, job_id: JobId, items: Vec<JobItemResult>) {
        let id = fragment.id();
        if !self.settle(id, Some(job_id), FragmentStatus::Completed) {
            return;
        }

        {
            let mut results = self.results.lock();
            for (node, item) in fragment.nodes().iter().zip(items) {
                for computed in &item.values {
                    results
                        .values
                        .insert(computed.specification.clone(), computed.value.clone());
                }
                results.statuses.insert(*node, NodeStatus::Computed(item.values));
            }
        }
        self.dispatcher.registry().finish(job_id, JobState::Completed);
        debug!(fragment = %id, job_id = %job_id, nodes = fragment.size(), "Fragment completed");

        for consumer in fragment.outputs() {
            let Some(slot) = self.fragments.get(consumer) else {
                continue;
            };
            let ready = {
                let mut state = slot.lock();
                state.pending_inputs = state.pending_inputs.saturating_sub(1);
                state.pending_inputs == 0 && state.status == FragmentStatus::Pending
            };
            if ready {
                self.spawn(*consumer);
            }
        }

        self.settle_one();
    }

    fn fail(&self, fragment: &GraphFragment, job_id: Option<JobId>, failure: JobFailure) {
        let id = fragment.id();
        let status = FragmentStatus::Failed {
            reason: failure.to_string(),
        };

        if !self.settle(id, job_id, status) {
            return;
        }
        // A job that was never accepted already has its rejection recorded
        if let Some(job_id) = job_id {
            self.dispatcher.registry().finish(job_id, JobState::Failed);
        }

        warn!(fragment = %id, error = %failure, "Fragment failed");

        let culprit = failure.item_index.and_then(|i| fragment.nodes().get(i).copied());
        {
            let mut results = self.results.lock();
            for node in fragment.nodes() {
                let reason = match culprit {
                    Some(c) if c == *node => failure.reason.clone(),
                    Some(c) => format!("fragment job failed at {}: {}", c, failure.reason),
                    None => failure.reason.clone(),
                };
                results.statuses.insert(*node, NodeStatus::Failed { reason });
            }
        }

        for downstream in self.tree.downstream_of(id) {
            let Some(slot) = self.fragments.get(&downstream) else {
                continue;
            };
            let skipped = {
                let mut state = slot.lock();
                if state.status == FragmentStatus::Pending {
                    state.status = FragmentStatus::UpstreamFailed { fragment: id };
                    true
                } else {
                    false
                }
            };
            if skipped {
                debug!(fragment = %downstream, failed = %id, "Fragment skipped");
                self.record_nodes(downstream, NodeStatus::UpstreamFailed { fragment: id });
                self.settle_one();
            }
        }

        self.settle_one();
    }

    /// Settles a dispatched fragment with `status`, unless the execution was
    /// cancelled, in which case the result is discarded. Returns true if
    /// `status` was recorded.
    fn settle(&self, id: FragmentId, job_id: Option<JobId>, status: FragmentStatus) -> bool {
        let Some(slot) = self.fragments.get(&id) else {
            return false;
        };
        let discard = {
            let mut state = slot.lock();
            let discard = self.is_cancelled();
            state.status = if discard {
                FragmentStatus::Cancelled
            } else {
                status
            };
            discard
        };

        if discard {
            debug!(fragment = %id, "Result discarded after cancellation");
            if let Some(job_id) = job_id {
                self.dispatcher.registry().finish(job_id, JobState::Discarded);
            }
            self.record_nodes(id, NodeStatus::Cancelled);
            self.settle_one();
        }
        !discard
    }

    fn record_nodes(&self, id: FragmentId, status: NodeStatus) {
        let Some(fragment) = self.tree.fragment(id) else {
            return;
        };
        let mut results = self.results.lock();
        for node in fragment.nodes() {
            results.statuses.insert(*node, status.clone());
        }
    }

    fn settle_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let elapsed = self.started.elapsed();
        *self.elapsed.lock() = Some(elapsed);
        {
            let mut jobs = self.jobs.lock();
            *jobs = Some(self.dispatcher.registry().remove_batch(self.batch_id));
        }
        info!(
            execution_id = %self.execution_id,
            batch_id = %self.batch_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Execution finished"
        );
        self.done.send_replace(true);
    }
}
