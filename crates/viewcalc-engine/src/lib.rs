//! # Viewcalc Engine
//!
//! Partitions view-computation dependency graphs into jobs and executes them
//! on calculation nodes.
//!
//! This crate provides:
//! - [`DependencyGraph`]: Nodes, input edges and terminal inputs of one calculation configuration
//! - [`partition`]: Merges nodes into [`GraphFragment`]s under [`PartitionBounds`]
//! - [`MultipleNodeExecutor`]: Dispatches fragments as they become ready and collects results
//! - [`LocalCalculationNode`]: In-process calculation node with a fixed number of slots
//! - [`RemoteCalculationNode`] / [`RemoteNodeServer`]: Calculation node behind an encoded wire
//!
//! ## Architecture
//!
//! ```text
//! DependencyGraph ─> partition ─> FragmentTree
//!                                      │
//!                                      v
//!                   Aggregator ─> Dispatcher ─> CalculationWorker ─┬─> LocalCalculationNode
//!                       ^                                          │
//!                       └──────────── JobResult ───────────────────┴─> RemoteCalculationNode
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let executor = ExecutorBuilder::new()
//!     .with_bounds(PartitionBounds::items(1, Some(50), Some(8)))
//!     .with_local_node(functions, cache)
//!     .build()?;
//!
//! let result = executor.execute(graph).await?;
//! ```
//!
//! [`PartitionBounds`]: viewcalc_traits::PartitionBounds

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fragment;
pub mod function;
pub mod graph;
pub mod invoker;
pub mod local_node;
pub mod partitioner;
pub mod registry;
pub mod remote_node;
pub mod result;

mod aggregator;

// Re-exports
pub use aggregator::FragmentStatus;
pub use builder::ExecutorBuilder;
pub use cache::ViewComputationCache;
pub use dispatcher::{fragment_job, DispatchFailure, DispatchedJob, Dispatcher, JobIdSource};
pub use error::{EngineError, EngineResult};
pub use executor::{ExecutionHandle, MultipleNodeExecutor};
pub use fragment::{FragmentTree, GraphFragment, RootGraphFragment};
pub use function::{CalculationFunction, FunctionInputs, FunctionRepository};
pub use graph::{DependencyGraph, DependencyNode, GraphStats};
pub use invoker::JobInvoker;
pub use local_node::LocalCalculationNode;
pub use partitioner::partition;
pub use registry::{JobRecord, JobRegistry, JobState};
pub use remote_node::{RemoteCalculationNode, RemoteNodeServer, RemoteRequest};
pub use result::{ExecutionStats, GraphExecutionResult, NodeStatus};
