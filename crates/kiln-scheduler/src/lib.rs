//! Pipeline scheduling for kiln.
//!
//! Decides whether an event runs a pipeline, turns the declaration into a
//! validated job graph, and drives the jobs to completion.

pub mod graph;
pub mod orchestrator;
pub mod triggers;

pub use graph::{GraphError, JobGraph, JobGraphBuilder};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use triggers::TriggerMatcher;
