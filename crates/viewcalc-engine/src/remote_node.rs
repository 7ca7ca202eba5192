//! Calculation node behind a wire.
//!
//! [`RemoteCalculationNode`] is the executor's end: it encodes jobs with a
//! [`Codec`] and pushes them onto a bounded request channel.
//! [`RemoteNodeServer`] is the node's end: it decodes each job, runs it and
//! encodes the result back. Only bytes cross between the two, so the server
//! can sit behind any transport that carries a request and one reply.
//!
//! - Full request queue -> `DispatchError::NoWorkerAvailable` (retried)
//! - Server gone -> `DispatchError::Disconnected`
//! - Reply dropped -> ticket resolves to `None` (protocol violation)
//! - Reply undecodable -> job failure

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use viewcalc_ext_json::JsonCodec;
use viewcalc_traits::{
    CalculationJob, CalculationWorker, Codec, DispatchError, JobFailure, JobResult, JobTicket,
};

use crate::invoker::JobInvoker;

/// One encoded job and the channel its encoded result goes back on.
#[derive(Debug)]
pub struct RemoteRequest {
    /// Encoded [`CalculationJob`]
    pub payload: Bytes,
    /// Receives the encoded [`JobResult`]
    pub reply: oneshot::Sender<Bytes>,
}

// =============================================================================
// CLIENT
// =============================================================================

/// Executor-side handle on a remote calculation node.
#[derive(Debug, Clone)]
pub struct RemoteCalculationNode<C = JsonCodec> {
    name: String,
    codec: C,
    requests: mpsc::Sender<RemoteRequest>,
}

impl<C: Codec + Clone + 'static> RemoteCalculationNode<C> {
    /// Wraps an existing request channel.
    pub fn connect(name: impl Into<String>, codec: C, requests: mpsc::Sender<RemoteRequest>) -> Self {
        Self {
            name: name.into(),
            codec,
            requests,
        }
    }

    /// Returns true once the server has gone away.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

#[async_trait]
impl<C: Codec + Clone + 'static> CalculationWorker for RemoteCalculationNode<C> {
    async fn dispatch(&self, job: CalculationJob) -> Result<JobTicket, DispatchError> {
        let job_id = job.specification.job_id;
        let payload = self
            .codec
            .encode(&job)
            .map_err(|e| DispatchError::Encoding(e.to_string()))?;

        let (reply, response) = oneshot::channel();
        self.requests
            .try_send(RemoteRequest { payload, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => DispatchError::NoWorkerAvailable,
                TrySendError::Closed(_) => {
                    DispatchError::Disconnected(format!("{} is unreachable", self.name))
                }
            })?;

        debug!(node = %self.name, job_id = %job_id, "Job sent");

        let (sender, ticket) = JobTicket::channel(job_id);
        let codec = self.codec.clone();
        let name = self.name.clone();
        let specification = job.specification;

        tokio::spawn(async move {
            let Ok(bytes) = response.await else {
                error!(node = %name, job_id = %job_id, "Remote node dropped job without a result");
                return;
            };
            let result = match codec.decode::<JobResult>(&bytes) {
                Ok(result) => result,
                Err(e) => {
                    error!(node = %name, job_id = %job_id, error = %e, "Malformed job result");
                    JobResult::failure(
                        specification,
                        JobFailure::whole_job(format!("malformed result: {}", e)),
                        name.as_str(),
                    )
                }
            };
            sender.send(result);
        });

        Ok(ticket)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.requests.max_capacity())
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Node-side loop answering encoded jobs one at a time.
#[derive(Debug)]
pub struct RemoteNodeServer<C = JsonCodec> {
    name: String,
    codec: C,
    invoker: JobInvoker,
}

impl<C: Codec + Clone + 'static> RemoteNodeServer<C> {
    /// Create a server.
    pub fn new(name: impl Into<String>, codec: C, invoker: JobInvoker) -> Self {
        Self {
            name: name.into(),
            codec,
            invoker,
        }
    }

    /// Starts serving with a request queue of `queue_depth` jobs.
    ///
    /// Returns the executor-side node and the server task. The server stops
    /// when every client handle is dropped, or when the task is aborted.
    pub fn serve(self, queue_depth: usize) -> (RemoteCalculationNode<C>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let client = RemoteCalculationNode::connect(self.name.clone(), self.codec.clone(), tx);
        let handle = tokio::spawn(self.run(rx));
        (client, handle)
    }

    async fn run(self, mut requests: mpsc::Receiver<RemoteRequest>) {
        info!(node = %self.name, "Remote calculation node serving");

        while let Some(request) = requests.recv().await {
            let job: CalculationJob = match self.codec.decode(&request.payload) {
                Ok(job) => job,
                Err(e) => {
                    error!(node = %self.name, error = %e, "Undecodable job request");
                    continue;
                }
            };

            let job_id = job.specification.job_id;
            let specification = job.specification.clone();
            let invoker = self.invoker.clone();
            let name = self.name.clone();

            let result = match tokio::task::spawn_blocking(move || invoker.run(&job, &name)).await {
                Ok(result) => result,
                Err(e) => JobResult::failure(
                    specification,
                    JobFailure::whole_job(format!("job panicked: {}", e)),
                    self.name.as_str(),
                ),
            };

            match self.codec.encode(&result) {
                Ok(bytes) => {
                    if request.reply.send(bytes).is_err() {
                        debug!(node = %self.name, job_id = %job_id, "Client stopped listening");
                    }
                }
                Err(e) => {
                    error!(node = %self.name, job_id = %job_id, error = %e, "Could not encode job result");
                }
            }
        }

        info!(node = %self.name, "Remote calculation node stopped");
    }
}
