//! In-process calculation node.
//!
//! A fixed number of slots; a dispatch waits for a free slot, then the job
//! runs on the blocking pool with its items in order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use viewcalc_traits::{
    CalculationJob, CalculationWorker, DispatchError, JobFailure, JobResult, JobTicket,
};

use crate::invoker::JobInvoker;

/// Calculation node running jobs in this process.
#[derive(Debug)]
pub struct LocalCalculationNode {
    name: String,
    slots: Arc<Semaphore>,
    capacity: usize,
    invoker: JobInvoker,
}

impl LocalCalculationNode {
    /// Create a node with `slots` concurrent jobs (at least one).
    pub fn new(name: impl Into<String>, slots: usize, invoker: JobInvoker) -> Self {
        let capacity = slots.max(1);
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            invoker,
        }
    }

    /// Free slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Stop accepting jobs. Running jobs still answer.
    pub fn close(&self) {
        self.slots.close();
    }

    /// The invoker jobs run through.
    pub fn invoker(&self) -> &JobInvoker {
        &self.invoker
    }
}

#[async_trait]
impl CalculationWorker for LocalCalculationNode {
    async fn dispatch(&self, job: CalculationJob) -> Result<JobTicket, DispatchError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Disconnected(format!("{} is closed", self.name)))?;

        let job_id = job.specification.job_id;
        let (sender, ticket) = JobTicket::channel(job_id);
        let invoker = self.invoker.clone();
        let name = self.name.clone();

        debug!(node = %self.name, job_id = %job_id, items = job.items.len(), "Job accepted");

        tokio::spawn(async move {
            let specification = job.specification.clone();
            let node_name = name.clone();
            let outcome = tokio::task::spawn_blocking(move || invoker.run(&job, &node_name)).await;
            drop(permit);

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    error!(node = %name, job_id = %job_id, error = %e, "Job panicked");
                    JobResult::failure(
                        specification,
                        JobFailure::whole_job(format!("job panicked: {}", e)),
                        name.as_str(),
                    )
                }
            };

            if !sender.send(result) {
                debug!(job_id = %job_id, "Job result discarded, executor stopped listening");
            }
        });

        Ok(ticket)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }
}
