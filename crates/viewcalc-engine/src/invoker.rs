//! Job execution on a calculation node.
//!
//! [`JobInvoker`] is the part of a calculation node that actually runs a job:
//! items in order, inputs from the computation cache, outputs written back.
//! Both the in-process node and the remote node server use it.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail};
use tracing::{trace, warn};

use viewcalc_traits::{
    CalculationJob, CalculationJobItem, ComputedValue, JobFailure, JobItemResult, JobResult,
};

use crate::cache::ViewComputationCache;
use crate::function::{FunctionInputs, FunctionRepository};

/// Runs jobs against a function repository and a computation cache.
#[derive(Debug, Clone)]
pub struct JobInvoker {
    functions: Arc<FunctionRepository>,
    cache: Arc<ViewComputationCache>,
}

impl JobInvoker {
    /// Create an invoker.
    pub fn new(functions: Arc<FunctionRepository>, cache: Arc<ViewComputationCache>) -> Self {
        Self { functions, cache }
    }

    /// Function repository.
    pub fn functions(&self) -> &Arc<FunctionRepository> {
        &self.functions
    }

    /// Computation cache.
    pub fn cache(&self) -> &Arc<ViewComputationCache> {
        &self.cache
    }

    /// Runs every item in order and answers the job.
    ///
    /// The first failing item fails the whole job; results of earlier items
    /// are not reported.
    pub fn run(&self, job: &CalculationJob, node_name: &str) -> JobResult {
        let mut results = Vec::with_capacity(job.items.len());

        for (index, item) in job.items.iter().enumerate() {
            match self.run_item(item) {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        job_id = %job.specification.job_id,
                        item = index,
                        function = %item.function_id,
                        target = %item.target,
                        error = %e,
                        "Job item failed"
                    );
                    return JobResult::failure(
                        job.specification.clone(),
                        JobFailure::at_item(index, format!("{:#}", e)),
                        node_name,
                    );
                }
            }
        }

        JobResult::success(job.specification.clone(), results, node_name)
    }

    fn run_item(&self, item: &CalculationJobItem) -> anyhow::Result<JobItemResult> {
        let start = Instant::now();

        let function = self
            .functions
            .get(&item.function_id)
            .ok_or_else(|| anyhow!("function {} not found", item.function_id))?;

        let missing = self.cache.missing(&item.inputs);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            let noun = if names.len() == 1 { "input" } else { "inputs" };
            bail!("missing {} {}", noun, names.join(", "));
        }

        let mut inputs = FunctionInputs::new();
        for spec in &item.inputs {
            let value = self
                .cache
                .get(spec)
                .ok_or_else(|| anyhow!("missing input {}", spec))?;
            inputs.insert(spec.clone(), value);
        }

        let values = function.execute(&item.target, &inputs, &item.outputs)?;
        if values.len() != item.outputs.len() {
            bail!(
                "{} returned {} values for {} outputs",
                item.function_id,
                values.len(),
                item.outputs.len()
            );
        }

        let computed: Vec<ComputedValue> = item
            .outputs
            .iter()
            .cloned()
            .zip(values)
            .map(|(spec, value)| ComputedValue::new(spec, value))
            .collect();
        self.cache.put_all(computed.iter().cloned());

        let elapsed_us = start.elapsed().as_micros() as u64;
        trace!(
            function = %item.function_id,
            target = %item.target,
            elapsed_us = elapsed_us,
            "Job item executed"
        );

        Ok(JobItemResult {
            values: computed,
            execution_time_us: elapsed_us,
        })
    }
}
