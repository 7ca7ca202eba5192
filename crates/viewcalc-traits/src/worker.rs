//! Calculation node seam.
//!
//! An executor hands each fragment job to a [`CalculationWorker`]. The worker
//! either refuses it straight away ([`DispatchError`]) or accepts it and
//! returns a [`JobTicket`]; an accepted job is answered exactly once through
//! the ticket's one-shot channel.
//!
//! Implementations:
//! - `LocalCalculationNode` -> in-process slot pool
//! - `RemoteCalculationNode` -> bounded channel to a node in another process

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::DispatchError;
use crate::ids::JobId;
use crate::job::{CalculationJob, JobResult};

// =============================================================================
// JOB TICKET
// =============================================================================

/// Handle on an accepted job.
///
/// Resolves to the job's result, or to `None` if the calculation node dropped
/// the job without answering (a protocol violation).
#[derive(Debug)]
pub struct JobTicket {
    job_id: JobId,
    rx: oneshot::Receiver<JobResult>,
}

impl JobTicket {
    /// Create a ticket and the sender the calculation node answers through.
    pub fn channel(job_id: JobId) -> (JobResultSender, JobTicket) {
        let (tx, rx) = oneshot::channel();
        (JobResultSender { job_id, tx }, JobTicket { job_id, rx })
    }

    /// Job this ticket belongs to.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Future for JobTicket {
    type Output = Option<JobResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// Sending half of a [`JobTicket`]. Consumed by [`JobResultSender::send`], so
/// a job can only be answered once.
#[derive(Debug)]
pub struct JobResultSender {
    job_id: JobId,
    tx: oneshot::Sender<JobResult>,
}

impl JobResultSender {
    /// Job this sender answers.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Deliver the result. Returns false if the executor is no longer listening.
    pub fn send(self, result: JobResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

// =============================================================================
// CALCULATION WORKER TRAIT
// =============================================================================

/// Something that runs fragment jobs.
#[async_trait]
pub trait CalculationWorker: Send + Sync {
    /// Offer a job.
    ///
    /// May wait for a free slot. Returns a ticket once the job is accepted, or
    /// an error if it was refused.
    async fn dispatch(&self, job: CalculationJob) -> Result<JobTicket, DispatchError>;

    /// Name used in logs and job results.
    fn name(&self) -> &str;

    /// Number of jobs that can run at the same time, if known.
    fn capacity(&self) -> Option<usize> {
        None
    }
}
