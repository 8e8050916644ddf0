//! Pipeline Engine - Dependency-Ordered Batch Execution
//!
//! Runs a pipeline of shell steps as a directed acyclic graph. Steps may be
//! batch-expanded over wildcard values, run inside per-tool micromamba
//! environments, and are scheduled within a global parallelism budget.
//!
//! # Architecture
//!
//! - [`workflow`]: Definition parsing, validation, wildcard expansion and the execution graph
//! - [`execution`]: Async control loop, run state machine and process workers
//! - [`environment`]: Tool to environment resolution and provisioning
//! - [`monitoring`]: Resource sampling and the run timeline
//! - [`report`]: Reporting stream and terminal summary
//! - [`config`]: Command-line surface and run configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use pipeline_engine::{load_pipeline, prepare_pipeline, Engine, EngineConfig, Reporter};
//! use pipeline_engine::environment::EnvironmentResolver;
//! use pipeline_engine::workflow::WildcardBindings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = prepare_pipeline(load_pipeline("pipeline.yaml")?, WildcardBindings::new())?;
//!
//!     let config = EngineConfig {
//!         max_parallel: 8,
//!         ..EngineConfig::default()
//!     };
//!     let mut engine = Engine::new(config, EnvironmentResolver::ambient(), Reporter::stdio());
//!
//!     let report = engine.run(graph).await;
//!     println!("{}", report.summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod report;
pub mod workflow;

pub use config::{Cli, EngineConfig};
pub use error::{DefinitionError, StructuralError, ValidationError};
pub use execution::{Engine, RunReport};
pub use report::Reporter;
pub use workflow::model::{PipelineDefinition, StepInstance, StepTemplate};
pub use workflow::parser::{load_pipeline, prepare_pipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Pipeline Engine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_module_exports_step_template() {
        let step = StepTemplate::new("test", "bash", "echo test");
        assert_eq!(step.id, "test");
        assert_eq!(step.tool, "bash");
        assert_eq!(step.threads, 1);
    }

    #[test]
    fn test_prepare_rejects_dangling_reference() {
        let definition = workflow::parse_pipeline(
            r#"
steps:
  - id: a
    tool: bash
    command: "true"
    previous: [ghost]
"#,
        )
        .unwrap();

        let result = prepare_pipeline(definition, workflow::WildcardBindings::new());
        assert!(matches!(
            result,
            Err(DefinitionError::Structural(StructuralError::DanglingReference { .. }))
        ));
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
