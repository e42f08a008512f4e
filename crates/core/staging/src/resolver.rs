//! Dependency ordering of named tasks.
//!
//! A task declares the resources it requires and the resources it produces. A required resource
//! is satisfied either by a task producing it or by the base set (resources that already exist
//! before anything runs). The resolver builds a producer → consumer graph and orders it with
//! Kahn's algorithm. Among tasks that are ready at the same time the lexicographically smallest
//! name goes first, so the order is stable across runs.

use std::collections::{BTreeMap, BTreeSet};

/// A unit of work to order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub requires: Vec<String>,
    pub produces: Vec<String>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        requires: impl IntoIterator<Item = impl Into<String>>,
        produces: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            requires: requires.into_iter().map(Into::into).collect(),
            produces: produces.into_iter().map(Into::into).collect(),
        }
    }
}

/// Errors returned by [`resolve_order`].
///
/// Every variant is raised before any ordering is returned, so no task runs when resolution
/// fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Two tasks share the same name
    #[error("duplicate task '{task}'")]
    DuplicateTask { task: String },

    /// A requirement is neither produced by any task nor part of the base set
    #[error("task '{task}' requires '{resource}', which no task produces and which does not exist")]
    UnresolvedDependency { task: String, resource: String },

    /// The dependency graph contains a cycle
    ///
    /// `tasks` lists every task that could not be placed, in name order. The cycle itself is
    /// among them, along with any task that depends on it.
    #[error("dependency cycle detected among tasks: {}", tasks.join(", "))]
    CycleDetected { tasks: Vec<String> },
}

/// Order `tasks` so that every task comes after the producers of each resource it requires.
///
/// Returns the task names in execution order.
pub fn resolve_order(
    tasks: &[Task],
    base: &BTreeSet<String>,
) -> Result<Vec<String>, ResolveError> {
    let mut names: BTreeSet<&str> = BTreeSet::new();
    for task in tasks {
        if !names.insert(task.name.as_str()) {
            return Err(ResolveError::DuplicateTask {
                task: task.name.clone(),
            });
        }
    }

    // resource -> tasks producing it
    let mut producers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for task in tasks {
        for resource in &task.produces {
            producers
                .entry(resource.as_str())
                .or_default()
                .insert(task.name.as_str());
        }
    }

    // producer -> consumers
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = names.iter().map(|name| (*name, 0)).collect();

    for task in tasks {
        for resource in &task.requires {
            let Some(resource_producers) = producers.get(resource.as_str()) else {
                if base.contains(resource) {
                    continue;
                }
                return Err(ResolveError::UnresolvedDependency {
                    task: task.name.clone(),
                    resource: resource.clone(),
                });
            };

            for producer in resource_producers {
                if *producer == task.name {
                    continue;
                }
                if edges
                    .entry(*producer)
                    .or_default()
                    .insert(task.name.as_str())
                {
                    *in_degree.entry(task.name.as_str()).or_default() += 1;
                }
            }
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut ordered = Vec::with_capacity(tasks.len());

    while let Some(name) = ready.pop_first() {
        ordered.push(name.to_string());
        let Some(consumers) = edges.get(name) else {
            continue;
        };
        for consumer in consumers {
            if let Some(degree) = in_degree.get_mut(consumer) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*consumer);
                }
            }
        }
    }

    if ordered.len() < tasks.len() {
        let placed: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
        let residual = names
            .into_iter()
            .filter(|name| !placed.contains(name))
            .map(str::to_string)
            .collect();
        return Err(ResolveError::CycleDetected { tasks: residual });
    }

    Ok(ordered)
}
