//! Pipeline Validation
//!
//! Field-level and set-level checks on step templates. Every problem is
//! collected; nothing is applied from a definition that has any.
//!
//! Reference integrity and cycles are graph concerns and live in
//! [`super::graph`].

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::error::ValidationError;

use super::model::{StepTemplate, WildcardBindings};

/// Display label for a step, falling back to its position when the ID is blank.
fn step_label(step: &StepTemplate, position: usize) -> String {
    if step.id.trim().is_empty() {
        format!("#{}", position)
    } else {
        step.id.clone()
    }
}

/// Validates a single step's fields.
fn validate_step(
    step: &StepTemplate,
    position: usize,
    bindings: &WildcardBindings,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let label = step_label(step, position);

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId { position });
    }

    if step.tool.trim().is_empty() {
        errors.push(ValidationError::EmptyTool(label.clone()));
    }

    if step.command.trim().is_empty() {
        errors.push(ValidationError::EmptyCommand(label.clone()));
    }

    if step.threads == 0 {
        errors.push(ValidationError::ZeroThreads(label.clone()));
    }

    let bound: Vec<String> = step
        .wildcard_names()
        .into_iter()
        .filter(|name| bindings.is_bound(name))
        .collect();
    if bound.len() > 1 {
        errors.push(ValidationError::MultipleWildcards {
            step: label.clone(),
            names: bound,
        });
    }

    // Placeholder mismatches are suspicious but legal
    if mentions(&step.command, &["{input}", "{inputs}"]) && step.input.is_empty() {
        warn!("Step '{}': command uses {{input}} but no input specified", label);
    }

    if mentions(&step.command, &["{output}", "{outputs}"]) && step.output.is_empty() {
        warn!("Step '{}': command uses {{output}} but no output specified", label);
    }

    errors
}

fn mentions(command: &str, placeholders: &[&str]) -> bool {
    placeholders.iter().any(|p| command.contains(p))
}

/// Validates the step set.
///
/// Checks, in order:
/// 1. The pipeline is not empty (stops here otherwise)
/// 2. Each duplicate ID occurrence
/// 3. Per-step fields: ID, tool, command, thread claim, wildcard usage
pub fn validate_pipeline(
    steps: &[StepTemplate],
    bindings: &WildcardBindings,
) -> Result<(), Vec<ValidationError>> {
    info!("Validating pipeline with {} steps", steps.len());

    if steps.is_empty() {
        return Err(vec![ValidationError::EmptyPipeline]);
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();

    for (position, step) in steps.iter().enumerate() {
        if !step.id.trim().is_empty() && !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
        errors.extend(validate_step(step, position, bindings));

        if step.previous.is_empty() {
            debug!("Step '{}' is a root step", step.id);
        }
    }

    if errors.is_empty() {
        info!("Pipeline validated: {} steps", steps.len());
        Ok(())
    } else {
        Err(errors)
    }
}
