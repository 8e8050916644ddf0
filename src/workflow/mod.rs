//! Pipeline Definition Module
//!
//! Data structures and utilities for defining, parsing, validating and
//! expanding pipelines into an execution graph.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (StepTemplate, StepInstance, bindings)
//! - [`parser`]: Definition loading and graph preparation
//! - [`validator`]: Accumulating validation rules
//! - [`wildcards`]: Wildcard value extraction and instance expansion
//! - [`graph`]: Dependency resolution and cycle detection

pub mod graph;
pub mod model;
pub mod parser;
pub mod validator;
pub mod wildcards;

pub use graph::ExecutionGraph;
pub use model::{PipelineDefinition, StepInstance, StepTemplate, WildcardBindings, WildcardValue};
pub use parser::{load_pipeline, load_wildcard_bindings, parse_pipeline, prepare_pipeline};
pub use wildcards::{expand_instances, extract_wildcard_values};
