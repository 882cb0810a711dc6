//! Dependency Graph Validation
//!
//! Task dependencies are soft temporal gates, so a cycle would leave its
//! members waiting on each other forever. The graph is checked before the
//! scheduler loop starts.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Check that every dependency is registered and the graph is acyclic
///
/// `graph` maps task id to the ids it depends on.
pub fn validate_graph(graph: &HashMap<String, Vec<String>>) -> Result<()> {
    let mut task_ids: Vec<&String> = graph.keys().collect();
    task_ids.sort();

    for task_id in &task_ids {
        for dependency in &graph[*task_id] {
            if !graph.contains_key(dependency) {
                return Err(Error::UnknownDependency {
                    task_id: (*task_id).clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    match find_cycle(graph) {
        Some(path) => Err(Error::DependencyCycle { path }),
        None => Ok(()),
    }
}

/// Return one cycle as a closed path (`a -> b -> a`), if any exists
pub fn find_cycle(graph: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = graph
        .keys()
        .map(|id| (id.as_str(), Mark::Unvisited))
        .collect();
    let mut roots: Vec<&str> = graph.keys().map(String::as_str).collect();
    roots.sort_unstable();

    for root in roots {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        let mut stack = vec![root];
        if let Some(cycle) = visit(graph, root, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    graph: &'a HashMap<String, Vec<String>>,
    node: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(node, Mark::InProgress);

    for next in graph.get(node).into_iter().flatten() {
        match marks.get(next.as_str()).copied() {
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|n| *n == next.as_str()).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
                path.push(next.clone());
                return Some(path);
            }
            Some(Mark::Unvisited) => {
                stack.push(next.as_str());
                if let Some(cycle) = visit(graph, next.as_str(), marks, stack) {
                    return Some(cycle);
                }
                stack.pop();
            }
            // Done, or an unknown id reported by validate_graph
            _ => {}
        }
    }

    marks.insert(node, Mark::Done);
    None
}
