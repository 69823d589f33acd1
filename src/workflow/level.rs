//! Step normalization and leveling.
//!
//! A level is the set of steps whose prerequisites all sit in earlier
//! levels. Levels run strictly in order; the steps of one level start
//! together.

use std::collections::HashSet;

use crate::core::condition;
use crate::core::dag::DependencyGraph;
use crate::error::{Error, Result};
use crate::workflow::types::{Step, StepPolicy, StepSpec};

/// Assign ids, default policies and resolve prerequisites.
///
/// A step with explicit `depends_on` waits for exactly those steps. A
/// non-parallel step without them follows the step declared before it; a
/// parallel one has no prerequisites.
///
/// # Errors
///
/// `Validation` for duplicate or unknown step ids and malformed task
/// templates or conditions; `Cycle` for circular prerequisites.
pub fn normalize(specs: Vec<StepSpec>) -> Result<Vec<Step>> {
    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(specs.len());

    for (position, spec) in specs.into_iter().enumerate() {
        let id = match spec.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("step-{}", position + 1),
        };
        if !seen.insert(id.clone()) {
            return Err(Error::Validation(format!("duplicate step id '{}'", id)));
        }

        spec.task
            .validate()
            .map_err(|e| Error::Validation(format!("step '{}': {}", id, e)))?;
        condition::validate_all(&spec.conditions)
            .map_err(|e| Error::Validation(format!("step '{}': {}", id, e)))?;

        let depends_on = if !spec.depends_on.is_empty() {
            spec.depends_on
        } else if spec.parallel {
            Vec::new()
        } else {
            steps
                .last()
                .map(|prev: &Step| vec![prev.id.clone()])
                .unwrap_or_default()
        };

        let name = if spec.name.trim().is_empty() {
            id.clone()
        } else {
            spec.name
        };

        steps.push(Step {
            id,
            name,
            task: spec.task,
            conditions: spec.conditions,
            on_success: spec.on_success.unwrap_or(StepPolicy::Next),
            on_failure: spec.on_failure.unwrap_or(StepPolicy::Stop),
            parallel: spec.parallel,
            depends_on,
        });
    }

    for step in &steps {
        for dep in &step.depends_on {
            if !seen.contains(dep) {
                return Err(Error::Validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    // Reject cycles up front
    levels(&steps)?;
    Ok(steps)
}

/// Partition steps into levels of step indices, in declaration order
/// within each level.
pub fn levels(steps: &[Step]) -> Result<Vec<Vec<usize>>> {
    let mut graph = DependencyGraph::new();
    for step in steps {
        graph.add_node(step.id.clone());
    }
    for step in steps {
        for dep in &step.depends_on {
            graph.add_dependency(dep, &step.id)?;
        }
    }

    let levels = graph.levels()?;
    Ok(levels
        .into_iter()
        .map(|level| {
            let mut indices: Vec<usize> = level
                .iter()
                .filter_map(|id| steps.iter().position(|s| &s.id == id))
                .collect();
            indices.sort_unstable();
            indices
        })
        .collect())
}
