//! Pipeline Parser
//!
//! Loads pipeline definitions and wildcard bindings, then turns them into an
//! execution graph. Supports both explicit dependencies (from the editor)
//! and implicit dependencies derived from input/output path matching.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{DefinitionError, ValidationError};

use super::graph::ExecutionGraph;
use super::model::{PipelineDefinition, StepTemplate, WildcardBindings};
use super::validator::validate_pipeline;
use super::wildcards::{bindings_from_files, expand_instances};

/// Parses a definition from YAML text (JSON documents are accepted too).
pub fn parse_pipeline(content: &str) -> Result<PipelineDefinition, DefinitionError> {
    let definition: PipelineDefinition = serde_yaml::from_str(content)?;
    info!(
        "Parsed {} steps, {} tools",
        definition.steps.len(),
        definition.tools().len()
    );
    Ok(definition)
}

/// Reads and parses a definition file. Nothing is validated yet.
///
/// # Example
///
/// ```rust,no_run
/// use pipeline_engine::workflow::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_pipeline("pipeline.yaml")?;
///     println!("Loaded {} steps", definition.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineDefinition, DefinitionError> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Definition loaded ({} bytes)", content.len());

    parse_pipeline(&content)
}

/// Loads a JSON wildcard-bindings document (`{"sample": ["x", "y"]}`).
pub fn load_wildcard_bindings(path: impl AsRef<Path>) -> Result<WildcardBindings, DefinitionError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let bindings: WildcardBindings =
        serde_json::from_str(&content).map_err(|source| DefinitionError::Wildcards {
            path: path.to_path_buf(),
            source,
        })?;

    for (name, values) in bindings.iter() {
        info!("  {{{}}} -> {} value(s)", name, values.len());
    }
    Ok(bindings)
}

/// Derives `previous`/`next` edges by matching input paths against outputs.
///
/// If step A produces path X and step B lists X as input, B depends on A.
/// Path patterns are compared literally, before wildcard expansion. Every
/// path produced by more than one step is reported.
pub fn derive_dependencies_from_files(
    steps: &mut [StepTemplate],
) -> Result<(), Vec<ValidationError>> {
    let mut producers: HashMap<&str, &str> = HashMap::new();
    let mut errors = Vec::new();

    for step in steps.iter() {
        for output in step.output.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
            match producers.get(output) {
                Some(first) => errors.push(ValidationError::DuplicateOutput {
                    path: output.to_string(),
                    first: first.to_string(),
                    second: step.id.clone(),
                }),
                None => {
                    producers.insert(output, &step.id);
                }
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let edges: Vec<(String, String)> = steps
        .iter()
        .flat_map(|step| {
            step.input
                .iter()
                .filter_map(|input| producers.get(input.trim()))
                .filter(|producer| **producer != step.id)
                .map(|producer| (producer.to_string(), step.id.clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    for (producer, consumer) in &edges {
        for step in steps.iter_mut() {
            if step.id == *consumer && !step.previous.contains(producer) {
                step.previous.push(producer.clone());
            }
            if step.id == *producer && !step.next.contains(consumer) {
                step.next.push(consumer.clone());
            }
        }
        debug!("Step '{}' depends on '{}'", consumer, producer);
    }

    info!("Derived {} dependency relationships", edges.len());
    Ok(())
}

/// Validates a definition and builds its execution graph.
///
/// 1. Merges bindings: document, then `wildcard_files`, then `extra`
/// 2. Validates every step, collecting all problems
/// 3. Derives implicit dependencies when no step declares edges
/// 4. Expands wildcards into instances
/// 5. Resolves edges and rejects dangling references and cycles
///
/// Nothing in the definition is applied when any step fails.
pub fn prepare_pipeline(
    definition: PipelineDefinition,
    extra: WildcardBindings,
) -> Result<ExecutionGraph, DefinitionError> {
    let PipelineDefinition {
        mut steps,
        wildcards: mut bindings,
    } = definition;

    bindings.merge(bindings_from_files(&steps));
    bindings.merge(extra);

    let mut errors = match validate_pipeline(&steps, &bindings) {
        Ok(()) => Vec::new(),
        Err(errors) => errors,
    };

    if errors.first() == Some(&ValidationError::EmptyPipeline) {
        return Err(DefinitionError::Invalid(errors));
    }

    if steps.iter().any(StepTemplate::has_explicit_edges) {
        info!("Using explicit dependencies from pipeline definition");
    } else {
        info!("Deriving dependencies from input/output path matching");
        if let Err(duplicates) = derive_dependencies_from_files(&mut steps) {
            errors.extend(duplicates);
        }
    }

    if !errors.is_empty() {
        return Err(DefinitionError::Invalid(errors));
    }

    let instances = expand_instances(&steps, &bindings);
    Ok(ExecutionGraph::build(instances)?)
}
