//! Calculation functions and the repository that resolves them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;

use viewcalc_traits::{CalculatedValue, ComputationTargetRef, FunctionId, ValueSpecification};

/// Values a function invocation reads.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    values: HashMap<ValueSpecification, CalculatedValue>,
}

impl FunctionInputs {
    /// Creates an empty input set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value.
    pub fn insert(&mut self, spec: ValueSpecification, value: CalculatedValue) {
        self.values.insert(spec, value);
    }

    /// Looks up a value.
    pub fn get(&self, spec: &ValueSpecification) -> Option<&CalculatedValue> {
        self.values.get(spec)
    }

    /// Looks up a value that must be present.
    pub fn require(&self, spec: &ValueSpecification) -> anyhow::Result<&CalculatedValue> {
        self.values
            .get(spec)
            .ok_or_else(|| anyhow!("missing input {}", spec))
    }

    /// All values.
    pub fn iter(&self) -> impl Iterator<Item = (&ValueSpecification, &CalculatedValue)> {
        self.values.iter()
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(ValueSpecification, CalculatedValue)> for FunctionInputs {
    fn from_iter<I: IntoIterator<Item = (ValueSpecification, CalculatedValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A function a dependency node invokes.
///
/// Returns one value per requested output, in the order requested. Errors are
/// reported against the node and fail its fragment.
pub trait CalculationFunction: Send + Sync {
    /// Computes the outputs of one invocation.
    fn execute(
        &self,
        target: &ComputationTargetRef,
        inputs: &FunctionInputs,
        outputs: &[ValueSpecification],
    ) -> anyhow::Result<Vec<CalculatedValue>>;
}

impl<F> CalculationFunction for F
where
    F: Fn(&ComputationTargetRef, &FunctionInputs, &[ValueSpecification]) -> anyhow::Result<Vec<CalculatedValue>>
        + Send
        + Sync,
{
    fn execute(
        &self,
        target: &ComputationTargetRef,
        inputs: &FunctionInputs,
        outputs: &[ValueSpecification],
    ) -> anyhow::Result<Vec<CalculatedValue>> {
        self(target, inputs, outputs)
    }
}

/// Functions available to a calculation node, by id.
#[derive(Default)]
pub struct FunctionRepository {
    functions: DashMap<FunctionId, Arc<dyn CalculationFunction>>,
}

impl FunctionRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, replacing any previous one with the same id.
    pub fn register(&self, id: impl Into<FunctionId>, function: impl CalculationFunction + 'static) {
        self.functions.insert(id.into(), Arc::new(function));
    }

    /// Resolves a function.
    pub fn get(&self, id: &FunctionId) -> Option<Arc<dyn CalculationFunction>> {
        self.functions.get(id).map(|f| f.value().clone())
    }

    /// Returns true if `id` is registered.
    pub fn contains(&self, id: &FunctionId) -> bool {
        self.functions.contains_key(id)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRepository")
            .field("functions", &self.functions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(f64);

    impl CalculationFunction for Constant {
        fn execute(
            &self,
            _target: &ComputationTargetRef,
            _inputs: &FunctionInputs,
            outputs: &[ValueSpecification],
        ) -> anyhow::Result<Vec<CalculatedValue>> {
            Ok(outputs.iter().map(|_| CalculatedValue::Double(self.0)).collect())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let repo = FunctionRepository::new();
        repo.register("Const", Constant(2.5));
        repo.register(
            "Echo",
            |target: &ComputationTargetRef,
             _: &FunctionInputs,
             _: &[ValueSpecification]|
             -> anyhow::Result<Vec<CalculatedValue>> {
                Ok(vec![CalculatedValue::Text(target.to_string())])
            },
        );

        assert_eq!(repo.len(), 2);
        assert!(repo.contains(&FunctionId::new("Echo")));

        let echo = repo.get(&FunctionId::new("Echo")).unwrap();
        let out = echo
            .execute(&ComputationTargetRef::new("SWAP-1"), &FunctionInputs::new(), &[])
            .unwrap();
        assert_eq!(out, vec![CalculatedValue::Text("SWAP-1".into())]);
        assert!(repo.get(&FunctionId::new("Missing")).is_none());
    }

    #[test]
    fn test_require_reports_missing_input() {
        let inputs: FunctionInputs = vec![(
            ValueSpecification::new("Spot", "EURUSD"),
            CalculatedValue::Double(1.08),
        )]
        .into_iter()
        .collect();

        assert!(inputs.require(&ValueSpecification::new("Spot", "EURUSD")).is_ok());
        let err = inputs
            .require(&ValueSpecification::new("Spot", "GBPUSD"))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing input Spot[GBPUSD]");
    }
}
