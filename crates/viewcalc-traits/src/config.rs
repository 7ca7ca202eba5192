//! Executor configuration.
//!
//! Configuration contains:
//! - Partition bounds (job size, job cost, concurrency)
//! - Dispatch retry policy
//! - Calculation node sizing
//!
//! Configuration does NOT contain:
//! - The dependency graph (that is compiled per calculation configuration)
//! - Function implementations

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::TraitError;

// =============================================================================
// PARTITION BOUNDS
// =============================================================================

/// Bounds the partitioner honors when merging fragments.
///
/// Maxima left as `None` are unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBounds {
    /// Fragments with fewer items are merged with a neighbour when possible
    #[serde(default = "default_min_job_items")]
    pub min_job_items: usize,

    /// No merge may produce a fragment with more items
    #[serde(default)]
    pub max_job_items: Option<usize>,

    /// Fragments with a lower estimated cost are merged with a neighbour when possible
    #[serde(default)]
    pub min_job_cost: u64,

    /// No merge may produce a fragment with a higher estimated cost
    #[serde(default)]
    pub max_job_cost: Option<u64>,

    /// Fragments allowed to run side by side at one partition level
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

fn default_min_job_items() -> usize {
    1
}

impl Default for PartitionBounds {
    fn default() -> Self {
        Self {
            min_job_items: default_min_job_items(),
            max_job_items: None,
            min_job_cost: 0,
            max_job_cost: None,
            max_concurrency: None,
        }
    }
}

impl PartitionBounds {
    /// Bounds on item counts and concurrency; cost bounds left open.
    pub fn items(min: usize, max: Option<usize>, concurrency: Option<usize>) -> Self {
        Self {
            min_job_items: min,
            max_job_items: max,
            max_concurrency: concurrency,
            ..Self::default()
        }
    }

    /// Bounds that force the whole graph into a single job.
    pub fn single_job() -> Self {
        Self::default()
    }

    /// Set the minimum item count.
    pub fn with_min_items(mut self, min: usize) -> Self {
        self.min_job_items = min;
        self
    }

    /// Set the maximum item count.
    pub fn with_max_items(mut self, max: usize) -> Self {
        self.max_job_items = Some(max);
        self
    }

    /// Set the minimum estimated cost.
    pub fn with_min_cost(mut self, min: u64) -> Self {
        self.min_job_cost = min;
        self
    }

    /// Set the maximum estimated cost.
    pub fn with_max_cost(mut self, max: u64) -> Self {
        self.max_job_cost = Some(max);
        self
    }

    /// Set the concurrency limit.
    pub fn with_max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = Some(concurrency);
        self
    }

    /// Effective maximum item count.
    pub fn max_items(&self) -> usize {
        self.max_job_items.unwrap_or(usize::MAX)
    }

    /// Effective maximum cost.
    pub fn max_cost(&self) -> u64 {
        self.max_job_cost.unwrap_or(u64::MAX)
    }

    /// Effective concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(usize::MAX)
    }

    /// True if a fragment of this size and cost may exist.
    pub fn admits(&self, items: usize, cost: u64) -> bool {
        items <= self.max_items() && cost <= self.max_cost()
    }

    /// True if a fragment of this size and cost should grow.
    pub fn is_undersized(&self, items: usize, cost: u64) -> bool {
        items < self.min_job_items || cost < self.min_job_cost
    }

    /// Check the bounds are consistent.
    pub fn validate(&self) -> Result<(), TraitError> {
        if self.max_items() == 0 {
            return Err(TraitError::InvalidInput(
                "max_job_items must be at least 1".into(),
            ));
        }
        if self.min_job_items > self.max_items() {
            return Err(TraitError::InvalidInput(format!(
                "min_job_items ({}) exceeds max_job_items ({})",
                self.min_job_items,
                self.max_items()
            )));
        }
        if self.min_job_cost > self.max_cost() {
            return Err(TraitError::InvalidInput(format!(
                "min_job_cost ({}) exceeds max_job_cost ({})",
                self.min_job_cost,
                self.max_cost()
            )));
        }
        if self.concurrency() == 0 {
            return Err(TraitError::InvalidInput(
                "max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// How often a refused dispatch is offered again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    /// Pause between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

// =============================================================================
// EXECUTOR CONFIG
// =============================================================================

/// Configuration for a multiple-node executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// View the executor computes
    #[serde(default = "default_view_name")]
    pub view_name: String,

    /// Partition bounds
    #[serde(default)]
    pub bounds: PartitionBounds,

    /// Dispatch retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Slots of the in-process calculation node
    #[serde(default = "default_local_slots")]
    pub local_slots: usize,

    /// Queue depth of a remote calculation node channel
    #[serde(default = "default_remote_queue_depth")]
    pub remote_queue_depth: usize,
}

fn default_view_name() -> String {
    "default".to_string()
}

fn default_local_slots() -> usize {
    4
}

fn default_remote_queue_depth() -> usize {
    16
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            view_name: default_view_name(),
            bounds: PartitionBounds::default(),
            retry: RetryPolicy::default(),
            local_slots: default_local_slots(),
            remote_queue_depth: default_remote_queue_depth(),
        }
    }
}

impl ExecutorConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, TraitError> {
        let config: Self =
            toml::from_str(content).map_err(|e| TraitError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TraitError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, TraitError> {
        toml::to_string(self).map_err(|e| TraitError::SerializationError(e.to_string()))
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), TraitError> {
        self.bounds.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(TraitError::InvalidInput(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.local_slots == 0 {
            return Err(TraitError::InvalidInput("local_slots must be at least 1".into()));
        }
        if self.remote_queue_depth == 0 {
            return Err(TraitError::InvalidInput(
                "remote_queue_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_bounds_are_open() {
        let bounds = PartitionBounds::default();
        assert_eq!(bounds.max_items(), usize::MAX);
        assert_eq!(bounds.max_cost(), u64::MAX);
        assert_eq!(bounds.concurrency(), usize::MAX);
        assert!(bounds.admits(10_000, 10_000));
        assert!(!bounds.is_undersized(1, 0));
    }

    #[test]
    fn test_bounds_admission() {
        let bounds = PartitionBounds::items(2, Some(4), None).with_max_cost(10);
        assert!(bounds.admits(4, 10));
        assert!(!bounds.admits(5, 1));
        assert!(!bounds.admits(1, 11));
        assert!(bounds.is_undersized(1, 5));
        assert!(!bounds.is_undersized(2, 5));
    }

    #[test]
    fn test_bound_presets() {
        assert_eq!(PartitionBounds::single_job(), PartitionBounds::default());
        let bounds = PartitionBounds::single_job()
            .with_min_items(2)
            .with_max_items(8)
            .with_max_concurrency(3);
        assert_eq!(bounds, PartitionBounds::items(2, Some(8), Some(3)));

        let retry = RetryPolicy::no_retry();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.backoff(), Duration::ZERO);
    }

    #[test]
    fn test_bounds_validation() {
        assert!(PartitionBounds::items(3, Some(2), None).validate().is_err());
        assert!(PartitionBounds::items(1, Some(0), None).validate().is_err());
        assert!(PartitionBounds::items(1, None, Some(0)).validate().is_err());
        assert!(PartitionBounds::default()
            .with_min_cost(5)
            .with_max_cost(4)
            .validate()
            .is_err());
        assert!(PartitionBounds::items(1, Some(1), Some(1)).validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = ExecutorConfig::from_toml_str(
            r#"
            view_name = "Credit Risk"
            local_slots = 8

            [bounds]
            min_job_items = 2
            max_job_items = 50
            max_concurrency = 4

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.view_name, "Credit Risk");
        assert_eq!(config.local_slots, 8);
        assert_eq!(config.bounds.min_job_items, 2);
        assert_eq!(config.bounds.max_items(), 50);
        assert_eq!(config.bounds.concurrency(), 4);
        assert_eq!(config.bounds.max_job_cost, None);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff(), Duration::from_millis(50));
        assert_eq!(config.remote_queue_depth, 16);
    }

    #[test]
    fn test_config_rejects_inconsistent_bounds() {
        let err = ExecutorConfig::from_toml_str(
            r#"
            [bounds]
            min_job_items = 10
            max_job_items = 2
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, TraitError::InvalidInput(_)));
    }

    #[test]
    fn test_config_toml_roundtrip_and_file() {
        let config = ExecutorConfig::default();
        let text = config.to_toml_string().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let loaded = ExecutorConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let err = ExecutorConfig::from_file("/nonexistent/viewcalc.toml").unwrap_err();
        assert!(matches!(err, TraitError::IoError(_)));
    }
}
