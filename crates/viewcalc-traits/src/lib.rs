//! # Viewcalc Traits
//!
//! Shared vocabulary for the Viewcalc dependency-graph executor.
//!
//! This crate holds identifiers, job value objects and the seams an executor
//! talks through. It carries no runtime; implementations live in
//! `viewcalc-engine` and extension crates.
//!
//! ## Module Structure
//!
//! - [`ids`]: Identifiers (views, functions, targets, nodes, fragments, jobs)
//! - [`job`]: Job specifications, job items and job results
//! - [`worker`]: The calculation node seam and job tickets
//! - [`transport`]: Wire codec trait for remote calculation nodes
//! - [`config`]: Partition bounds, retry policy and executor configuration
//!
//! ## Dependency Injection
//!
//! The executor takes its calculation nodes through the worker seam:
//!
//! ```ignore
//! ExecutorBuilder::new()
//!     .with_config(ExecutorConfig::from_file("viewcalc.toml")?)
//!     .with_worker(impl CalculationWorker)
//!     .build()
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod job;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use config::{ExecutorConfig, PartitionBounds, RetryPolicy};
pub use error::{DispatchError, TraitError};
pub use ids::*;
pub use job::*;
pub use transport::Codec;
pub use worker::{CalculationWorker, JobResultSender, JobTicket};
