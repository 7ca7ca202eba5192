//! Job value objects exchanged between executors and calculation nodes.
//!
//! A job is one dispatch of a graph fragment:
//! - [`CalculationJobSpecification`]: identifies the unit of work
//! - [`CalculationJobItem`]: one function invocation, in dependency-safe order
//! - [`JobResult`]: the single answer a calculation node gives for a job
//!
//! All of these cross the remote wire and are therefore serde-serializable.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::*;

// =============================================================================
// CALCULATED VALUE
// =============================================================================

/// A value produced by a function invocation or supplied as a terminal input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalculatedValue {
    /// Floating point value (rates, sensitivities).
    Double(f64),
    /// Exact decimal value (prices, notionals).
    Decimal(Decimal),
    /// Text value.
    Text(String),
    /// Structured value (curves, surfaces, ladders).
    Json(serde_json::Value),
}

impl CalculatedValue {
    /// Returns the value as `f64` where that is meaningful.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CalculatedValue::Double(v) => Some(*v),
            CalculatedValue::Decimal(d) => d.to_f64(),
            CalculatedValue::Json(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }
}

impl From<f64> for CalculatedValue {
    fn from(v: f64) -> Self {
        CalculatedValue::Double(v)
    }
}

impl From<Decimal> for CalculatedValue {
    fn from(v: Decimal) -> Self {
        CalculatedValue::Decimal(v)
    }
}

impl From<&str> for CalculatedValue {
    fn from(v: &str) -> Self {
        CalculatedValue::Text(v.to_string())
    }
}

/// A value paired with the specification it satisfies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    /// Which output this is.
    pub specification: ValueSpecification,
    /// The value itself.
    pub value: CalculatedValue,
}

impl ComputedValue {
    /// Create a new computed value.
    pub fn new(specification: ValueSpecification, value: CalculatedValue) -> Self {
        Self {
            specification,
            value,
        }
    }
}

// =============================================================================
// JOB SPECIFICATION
// =============================================================================

/// Identifies a dispatched unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalculationJobSpecification {
    /// View the graph belongs to
    pub view_name: ViewName,
    /// Calculation configuration the graph was compiled for
    pub calc_config_name: CalcConfigName,
    /// Batch grouping all jobs of one graph execution
    pub batch_id: BatchId,
    /// Unique job identifier
    pub job_id: JobId,
}

impl CalculationJobSpecification {
    /// Create a new job specification.
    pub fn new(
        view_name: ViewName,
        calc_config_name: CalcConfigName,
        batch_id: BatchId,
        job_id: JobId,
    ) -> Self {
        Self {
            view_name,
            calc_config_name,
            batch_id,
            job_id,
        }
    }
}

impl std::fmt::Display for CalculationJobSpecification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.view_name, self.calc_config_name, self.batch_id, self.job_id
        )
    }
}

/// One function invocation inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationJobItem {
    /// Function to invoke
    pub function_id: FunctionId,
    /// Target the function is invoked on
    pub target: ComputationTargetRef,
    /// Values the function reads
    pub inputs: Vec<ValueSpecification>,
    /// Values the function produces, in the order it returns them
    pub outputs: Vec<ValueSpecification>,
}

impl CalculationJobItem {
    /// Create a new job item.
    pub fn new(
        function_id: FunctionId,
        target: ComputationTargetRef,
        inputs: Vec<ValueSpecification>,
        outputs: Vec<ValueSpecification>,
    ) -> Self {
        Self {
            function_id,
            target,
            inputs,
            outputs,
        }
    }
}

/// A job as handed to a calculation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJob {
    /// Job identity
    pub specification: CalculationJobSpecification,
    /// Function invocations, inputs before consumers
    pub items: Vec<CalculationJobItem>,
}

// =============================================================================
// JOB RESULT
// =============================================================================

/// Result of one job item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItemResult {
    /// Values produced, one per declared output
    pub values: Vec<ComputedValue>,
    /// Execution time in microseconds
    pub execution_time_us: u64,
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Index of the item whose function failed, if the failure is attributable
    pub item_index: Option<usize>,
    /// Human-readable reason
    pub reason: String,
}

impl JobFailure {
    /// Failure attributed to a specific item.
    pub fn at_item(item_index: usize, reason: impl Into<String>) -> Self {
        Self {
            item_index: Some(item_index),
            reason: reason.into(),
        }
    }

    /// Failure of the job as a whole.
    pub fn whole_job(reason: impl Into<String>) -> Self {
        Self {
            item_index: None,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item_index {
            Some(i) => write!(f, "item {}: {}", i, self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Outcome of a job: every item succeeded, or the job failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// One result per job item, in item order.
    Success(Vec<JobItemResult>),
    /// The job failed; no partial results are kept.
    Failure(JobFailure),
}

/// The answer a calculation node delivers exactly once per accepted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// The job this result answers
    pub specification: CalculationJobSpecification,
    /// Success or failure
    pub outcome: JobOutcome,
    /// Name of the calculation node that ran the job
    pub node_name: String,
    /// When the job finished
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    /// Create a successful result.
    pub fn success(
        specification: CalculationJobSpecification,
        items: Vec<JobItemResult>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            specification,
            outcome: JobOutcome::Success(items),
            node_name: node_name.into(),
            completed_at: Utc::now(),
        }
    }

    /// Create a failed result.
    pub fn failure(
        specification: CalculationJobSpecification,
        failure: JobFailure,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            specification,
            outcome: JobOutcome::Failure(failure),
            node_name: node_name.into(),
            completed_at: Utc::now(),
        }
    }

    /// Returns true if the job succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Success(_))
    }
}
