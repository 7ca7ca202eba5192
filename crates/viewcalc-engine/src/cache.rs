//! Shared computation cache.
//!
//! Calculation nodes read job-item inputs from the cache and write outputs
//! back, so a fragment can consume what an earlier fragment produced. The
//! caller seeds terminal inputs (market data, static data) before execution.

use dashmap::DashMap;

use viewcalc_traits::{CalculatedValue, ComputedValue, ValueSpecification};

/// Values keyed by specification for one view computation cycle.
#[derive(Debug, Default)]
pub struct ViewComputationCache {
    values: DashMap<ValueSpecification, CalculatedValue>,
}

impl ViewComputationCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value.
    pub fn put(&self, spec: ValueSpecification, value: CalculatedValue) {
        self.values.insert(spec, value);
    }

    /// Store a batch of computed values.
    pub fn put_all(&self, values: impl IntoIterator<Item = ComputedValue>) {
        for computed in values {
            self.values.insert(computed.specification, computed.value);
        }
    }

    /// Get a value.
    pub fn get(&self, spec: &ValueSpecification) -> Option<CalculatedValue> {
        self.values.get(spec).map(|v| v.value().clone())
    }

    /// Check whether a value is present.
    pub fn contains(&self, spec: &ValueSpecification) -> bool {
        self.values.contains_key(spec)
    }

    /// Specifications missing from the cache.
    pub fn missing<'a>(
        &self,
        specs: impl IntoIterator<Item = &'a ValueSpecification>,
    ) -> Vec<ValueSpecification> {
        specs
            .into_iter()
            .filter(|s| !self.contains(s))
            .cloned()
            .collect()
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
