//! Record of every job an executor has issued.
//!
//! The dispatcher registers a job before its first dispatch attempt; the
//! aggregator records how it ended. Once an execution has settled its batch
//! is taken out of the registry and handed to the execution result, so the
//! registry only holds jobs of executions still running.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use viewcalc_traits::{BatchId, CalcConfigName, CalculationJobSpecification, FragmentId, JobId};

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    /// Registered, not yet accepted by a calculation node
    Submitted,
    /// Accepted by a calculation node
    Dispatched,
    /// Answered with a valid, successful result
    Completed,
    /// Answered with a failure, an invalid result, or no result at all
    Failed,
    /// Every dispatch attempt was refused
    Rejected,
    /// Answered after the execution was cancelled; result thrown away
    Discarded,
}

impl JobState {
    /// Returns true while the job may still produce a result.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Submitted | JobState::Dispatched)
    }
}

/// One issued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    /// Job id
    pub job_id: JobId,
    /// Batch the job belongs to
    pub batch_id: BatchId,
    /// Fragment the job executes
    pub fragment: FragmentId,
    /// Calculation configuration of the graph
    pub calc_config: CalcConfigName,
    /// Number of job items
    pub items: usize,
    /// Current state
    pub state: JobState,
    /// Calculation node that accepted the job
    pub worker: Option<String>,
    /// When the job was registered
    pub submitted_at: DateTime<Utc>,
    /// When the job reached a final state
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly submitted job.
    pub fn submitted(spec: &CalculationJobSpecification, fragment: FragmentId, items: usize) -> Self {
        Self {
            job_id: spec.job_id,
            batch_id: spec.batch_id,
            fragment,
            calc_config: spec.calc_config_name.clone(),
            items,
            state: JobState::Submitted,
            worker: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Jobs by id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, JobRecord>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job.
    pub fn register(&self, record: JobRecord) {
        self.jobs.insert(record.job_id, record);
    }

    /// Record which calculation node accepted a job.
    pub fn mark_dispatched(&self, job_id: JobId, worker: &str) {
        if let Some(mut record) = self.jobs.get_mut(&job_id) {
            record.state = JobState::Dispatched;
            record.worker = Some(worker.to_string());
        }
    }

    /// Record how a job ended.
    pub fn finish(&self, job_id: JobId, state: JobState) {
        if let Some(mut record) = self.jobs.get_mut(&job_id) {
            record.state = state;
            record.finished_at = Some(Utc::now());
        }
    }

    /// Look up a job.
    pub fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.jobs.get(&job_id).map(|r| r.value().clone())
    }

    /// Jobs of one batch, in id order.
    pub fn jobs_for_batch(&self, batch_id: BatchId) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .map(|r| r.value().clone())
            .collect();
        jobs.sort_by_key(|r| r.job_id);
        jobs
    }

    /// Removes every job of one batch and returns them in id order.
    pub fn remove_batch(&self, batch_id: BatchId) -> Vec<JobRecord> {
        let ids: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .map(|r| r.job_id)
            .collect();
        let mut jobs: Vec<JobRecord> = ids
            .into_iter()
            .filter_map(|id| self.jobs.remove(&id).map(|(_, record)| record))
            .collect();
        jobs.sort_by_key(|r| r.job_id);
        jobs
    }

    /// Jobs that may still produce a result, in id order.
    pub fn in_flight(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|r| r.state.is_in_flight())
            .map(|r| r.value().clone())
            .collect();
        jobs.sort_by_key(|r| r.job_id);
        jobs
    }

    /// Number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if no job was registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewcalc_traits::ViewName;

    fn spec(batch: u64, job: u64) -> CalculationJobSpecification {
        CalculationJobSpecification::new(
            ViewName::new("V"),
            CalcConfigName::new("Default"),
            BatchId(batch),
            JobId(job),
        )
    }

    #[test]
    fn test_lifecycle() {
        let registry = JobRegistry::new();
        registry.register(JobRecord::submitted(&spec(1, 10), FragmentId(0), 3));
        assert_eq!(registry.in_flight().len(), 1);

        registry.mark_dispatched(JobId(10), "local");
        let record = registry.get(JobId(10)).unwrap();
        assert_eq!(record.state, JobState::Dispatched);
        assert_eq!(record.worker.as_deref(), Some("local"));
        assert!(record.finished_at.is_none());

        registry.finish(JobId(10), JobState::Completed);
        let record = registry.get(JobId(10)).unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert!(record.finished_at.is_some());
        assert!(registry.in_flight().is_empty());
    }

    #[test]
    fn test_jobs_for_batch() {
        let registry = JobRegistry::new();
        registry.register(JobRecord::submitted(&spec(2, 7), FragmentId(1), 1));
        registry.register(JobRecord::submitted(&spec(1, 5), FragmentId(0), 1));
        registry.register(JobRecord::submitted(&spec(2, 6), FragmentId(0), 2));

        let ids: Vec<JobId> = registry
            .jobs_for_batch(BatchId(2))
            .iter()
            .map(|r| r.job_id)
            .collect();
        assert_eq!(ids, vec![JobId(6), JobId(7)]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_remove_batch() {
        let registry = JobRegistry::new();
        registry.register(JobRecord::submitted(&spec(2, 7), FragmentId(1), 1));
        registry.register(JobRecord::submitted(&spec(1, 5), FragmentId(0), 1));
        registry.register(JobRecord::submitted(&spec(2, 6), FragmentId(0), 2));

        let removed: Vec<JobId> = registry
            .remove_batch(BatchId(2))
            .iter()
            .map(|r| r.job_id)
            .collect();
        assert_eq!(removed, vec![JobId(6), JobId(7)]);
        assert_eq!(registry.len(), 1);
        assert!(registry.jobs_for_batch(BatchId(2)).is_empty());
        assert!(registry.remove_batch(BatchId(2)).is_empty());
    }

    #[test]
    fn test_unknown_job_is_ignored() {
        let registry = JobRegistry::new();
        registry.finish(JobId(1), JobState::Failed);
        assert!(registry.is_empty());
        assert!(registry.get(JobId(1)).is_none());
    }
}
