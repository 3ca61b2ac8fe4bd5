//! # Dependency Graph
//!
//! Validation and ordering of the operations inside one transaction.
//!
//! ## Validation Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Unknown ids   every dependency must name an operation of the same  │
//! │                   transaction (ids from other transactions don't count)│
//! │                                                                         │
//! │  2. Cycles        depth-first search with an on-stack marker; the      │
//! │                   reported path starts and ends on the same id         │
//! │                                                                         │
//! │  3. Ordering      Kahn's algorithm; among ready operations the one     │
//! │                   with fewer transitive dependents goes first, ties    │
//! │                   broken by submission sequence                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::DependencyError;
use crate::types::Operation;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Rejects unknown dependency ids and cycles. Nothing is reordered.
pub fn validate(operations: &[Operation]) -> Result<(), DependencyError> {
    let ids: HashSet<&str> = operations.iter().map(|op| op.id.as_str()).collect();

    for op in operations {
        for dep in &op.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(DependencyError::Unknown {
                    operation_id: op.id.clone(),
                    dependency_id: dep.clone(),
                });
            }
        }
    }

    let graph: HashMap<&str, &Operation> =
        operations.iter().map(|op| (op.id.as_str(), op)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    for op in operations {
        visit(op.id.as_str(), &graph, &mut marks, &mut path)?;
    }

    Ok(())
}

fn visit<'a>(
    id: &'a str,
    graph: &HashMap<&'a str, &'a Operation>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<(), DependencyError> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::OnStack) => {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|p| p.to_string()).collect();
            cycle.push(id.to_string());
            return Err(DependencyError::Cycle { path: cycle });
        }
        None => {}
    }

    marks.insert(id, Mark::OnStack);
    path.push(id);

    if let Some(op) = graph.get(id) {
        for dep in &op.dependencies {
            visit(dep.as_str(), graph, marks, path)?;
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}

/// Validates `operations` and returns them in execution order.
///
/// Dependencies always come before their dependents.
pub fn execution_order(operations: &[Operation]) -> Result<Vec<&Operation>, DependencyError> {
    validate(operations)?;

    let position: HashMap<&str, usize> = operations
        .iter()
        .enumerate()
        .map(|(i, op)| (op.id.as_str(), i))
        .collect();

    // dependents[i] = operations that list operations[i] as a dependency
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); operations.len()];
    let mut in_degree = vec![0usize; operations.len()];

    for (i, op) in operations.iter().enumerate() {
        for dep in &op.dependencies {
            if let Some(&d) = position.get(dep.as_str()) {
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let weights: Vec<usize> = (0..operations.len())
        .map(|i| transitive_dependents(i, &dependents))
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, u64, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| Reverse((weights[i], operations[i].sequence, i)))
        .collect();

    let mut order = Vec::with_capacity(operations.len());

    while let Some(Reverse((_, _, i))) = ready.pop() {
        order.push(&operations[i]);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse((weights[j], operations[j].sequence, j)));
            }
        }
    }

    Ok(order)
}

fn transitive_dependents(start: usize, dependents: &[Vec<usize>]) -> usize {
    let mut seen = HashSet::new();
    let mut stack = vec![start];

    while let Some(i) = stack.pop() {
        for &j in &dependents[i] {
            if seen.insert(j) {
                stack.push(j);
            }
        }
    }

    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(id: &str, seq: u64, deps: &[&str]) -> Operation {
        let mut op = Operation::create_node(id, &["Test"], json!({})).with_id(id);
        op.sequence = seq;
        for dep in deps {
            op = op.depends_on(*dep);
        }
        op
    }

    fn ids(order: Vec<&Operation>) -> Vec<String> {
        order.into_iter().map(|op| op.id.clone()).collect()
    }

    #[test]
    fn test_dependencies_run_first() {
        let ops = vec![op("b", 1, &["a"]), op("a", 2, &[])];
        assert_eq!(ids(execution_order(&ops).unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_fewer_dependents_first_then_sequence() {
        // a has one dependent (c); b and d have none.
        let ops = vec![
            op("a", 1, &[]),
            op("b", 2, &[]),
            op("c", 3, &["a"]),
            op("d", 4, &[]),
        ];
        assert_eq!(ids(execution_order(&ops).unwrap()), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let ops = vec![op("a", 1, &["b"]), op("b", 2, &["a"])];
        match validate(&ops) {
            Err(DependencyError::Cycle { path }) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let ops = vec![op("a", 1, &["a"])];
        assert_eq!(
            validate(&ops),
            Err(DependencyError::Cycle {
                path: vec!["a".into(), "a".into()]
            })
        );
    }

    #[test]
    fn test_unknown_dependency_is_reported_before_cycles() {
        let ops = vec![op("a", 1, &["b"]), op("b", 2, &["a", "ghost"])];
        assert_eq!(
            validate(&ops),
            Err(DependencyError::Unknown {
                operation_id: "b".into(),
                dependency_id: "ghost".into(),
            })
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(execution_order(&[]).unwrap().is_empty());
    }
}
