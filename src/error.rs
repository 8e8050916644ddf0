//! Error Types
//!
//! Definition problems are reported before anything runs; per-instance
//! launch problems become that instance's failure and never abort the run.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A structural problem in a single step or in the step set as a whole.
///
/// Validation never stops at the first problem; callers receive the full list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Pipeline has no steps")]
    EmptyPipeline,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step #{position} has an empty or whitespace-only ID")]
    EmptyStepId { position: usize },

    #[error("Step '{0}' has no tool specified")]
    EmptyTool(String),

    #[error("Step '{0}' has no command specified")]
    EmptyCommand(String),

    #[error("Step '{0}' claims 0 threads (must be at least 1)")]
    ZeroThreads(String),

    #[error("Step '{step}' uses more than one bound wildcard: {}", .names.join(", "))]
    MultipleWildcards { step: String, names: Vec<String> },

    #[error("Output '{path}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },
}

/// A problem in the dependency graph built over step instances.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("Step '{step}' references unknown step '{reference}'")]
    DanglingReference { step: String, reference: String },

    #[error("Pipeline contains a dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Step ID '{0}' is produced twice after wildcard expansion")]
    DuplicateInstance(String),
}

/// Everything that can reject a pipeline definition before execution.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to read '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("Failed to parse pipeline definition: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Failed to parse wildcard bindings '{}': {source}", .path.display())]
    Wildcards {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Pipeline definition is invalid ({} problem(s))", .0.len())]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Structural(#[from] StructuralError),
}

impl DefinitionError {
    /// Human-readable lines, one per problem.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Invalid(errors) => errors.iter().map(|e| e.to_string()).collect(),
            other => vec![other.to_string()],
        }
    }
}

/// The resolved command of an instance could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("wildcard '{{{name}}}' has no bound values")]
    UnboundWildcard { name: String },
}

/// An instance could not be started. Recorded as that instance's failure.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("failed to create output directory '{}': {source}", .path.display())]
    OutputDir { path: PathBuf, source: io::Error },

    #[error("failed to start process: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Failed to access environment map '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("Malformed environment map '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("micromamba failed: {0}")]
    Micromamba(String),
}

/// Invalid run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Working directory does not exist: {}", .0.display())]
    MissingWorkingDir(PathBuf),

    #[error("Path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to write timeline '{}': {source}", .path.display())]
    Timeline { path: PathBuf, source: io::Error },

    #[error("Failed to serialize timeline: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::EmptyPipeline;
        assert_eq!(err.to_string(), "Pipeline has no steps");

        let err = ValidationError::DuplicateStepId("align".to_string());
        assert!(err.to_string().contains("align"));

        let err = ValidationError::MultipleWildcards {
            step: "merge".to_string(),
            names: vec!["sample".to_string(), "lane".to_string()],
        };
        assert!(err.to_string().contains("sample, lane"));
    }

    #[test]
    fn test_structural_error_cycle_display() {
        let err = StructuralError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Pipeline contains a dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_resolution_error_keeps_braces() {
        let err = ResolutionError::UnboundWildcard {
            name: "sample".to_string(),
        };
        assert_eq!(err.to_string(), "wildcard '{sample}' has no bound values");
    }

    #[test]
    fn test_definition_error_messages_lists_every_problem() {
        let err = DefinitionError::Invalid(vec![
            ValidationError::EmptyTool("a".to_string()),
            ValidationError::EmptyCommand("b".to_string()),
        ]);
        let messages = err.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].contains("'b'"));
    }
}
