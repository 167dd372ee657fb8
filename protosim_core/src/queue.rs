//! Invariant checks for arena-backed doubly linked queues.
//!
//! A queue is captured as
//!
//! ```text
//! { "head": id, "tail": id,
//!   "nodes": { "<id>": { "prev": id, "next": id, "value": int } } }
//! ```
//!
//! where id `0` is the null pointer.

use num_bigint::BigInt;
use num_traits::Zero;
use protosim_env::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Required ordering of node values from head to tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    Ascending,
    Descending,
}

fn pointer(value: Option<&Value>) -> Option<BigInt> {
    value.and_then(Value::as_int).cloned()
}

/// Checks pointer structure and ordering; returns every problem found.
///
/// Structural checks stop at the first broken link since nothing after it
/// can be trusted.
pub fn check_queue(queue: &Value, order: QueueOrder) -> Vec<String> {
    let mut problems = Vec::new();

    let (Some(head), Some(tail)) = (pointer(queue.child("head")), pointer(queue.child("tail"))) else {
        return vec!["queue is missing head or tail".to_string()];
    };
    let empty = BTreeMap::new();
    let nodes = match queue.child("nodes") {
        Some(Value::Map(m)) => m,
        None => &empty,
        Some(other) => return vec![format!("nodes must be a map, found {}", other.type_name())],
    };

    if head.is_zero() || tail.is_zero() {
        if !(head.is_zero() && tail.is_zero()) {
            problems.push(format!("head {} and tail {} disagree on emptiness", head, tail));
        }
        if !nodes.is_empty() {
            problems.push(format!("{} node(s) unreachable from an empty head", nodes.len()));
        }
        return problems;
    }

    let node = |id: &BigInt| nodes.get(&id.to_string());

    match node(&head).map(|n| pointer(n.child("prev"))) {
        None => return vec![format!("head {} is not a node", head)],
        Some(prev) if prev != Some(BigInt::zero()) => {
            problems.push(format!("head {} has prev {:?}", head, prev.map(|p| p.to_string())));
        }
        _ => {}
    }
    match node(&tail).map(|n| pointer(n.child("next"))) {
        None => return vec![format!("tail {} is not a node", tail)],
        Some(next) if next != Some(BigInt::zero()) => {
            problems.push(format!("tail {} has next {:?}", tail, next.map(|n| n.to_string())));
        }
        _ => {}
    }

    let mut visited = BTreeSet::new();
    let mut previous = BigInt::zero();
    let mut last_value: Option<BigInt> = None;
    let mut current = head.clone();

    while !current.is_zero() {
        if !visited.insert(current.clone()) {
            problems.push(format!("cycle detected at node {}", current));
            return problems;
        }
        let Some(entry) = node(&current) else {
            problems.push(format!("node {} (after {}) does not exist", current, previous));
            return problems;
        };
        if pointer(entry.child("prev")) != Some(previous.clone()) {
            problems.push(format!(
                "node {} prev does not point back to {}",
                current, previous
            ));
        }
        if let Some(value) = pointer(entry.child("value")) {
            if let Some(last) = &last_value {
                let in_order = match order {
                    QueueOrder::Ascending => last <= &value,
                    QueueOrder::Descending => last >= &value,
                };
                if !in_order {
                    problems.push(format!(
                        "node {} value {} out of {:?} order after {}",
                        current, value, order, last
                    ));
                }
            }
            last_value = Some(value);
        } else {
            problems.push(format!("node {} has no integer value", current));
        }

        let next = pointer(entry.child("next")).unwrap_or_else(BigInt::zero);
        previous = current;
        current = next;
    }

    if previous != tail {
        problems.push(format!("traversal ends at {} but tail is {}", previous, tail));
    }
    if visited.len() != nodes.len() {
        problems.push(format!(
            "{} of {} node(s) reachable from head",
            visited.len(),
            nodes.len()
        ));
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_well_formed_queue() {
        let q = queue(
            r#"{"head": 2, "tail": 3, "nodes": {
                "2": {"prev": 0, "next": 1, "value": 5},
                "1": {"prev": 2, "next": 3, "value": 5},
                "3": {"prev": 1, "next": 0, "value": 9}}}"#,
        );
        assert!(check_queue(&q, QueueOrder::Ascending).is_empty());
        assert!(!check_queue(&q, QueueOrder::Descending).is_empty());
    }

    #[test]
    fn test_empty_queue() {
        assert!(check_queue(&queue(r#"{"head": 0, "tail": 0, "nodes": {}}"#), QueueOrder::Ascending).is_empty());
        let broken = queue(r#"{"head": 0, "tail": 4, "nodes": {}}"#);
        assert_eq!(check_queue(&broken, QueueOrder::Ascending).len(), 1);
    }

    #[test]
    fn test_asymmetric_pointers() {
        let q = queue(
            r#"{"head": 1, "tail": 2, "nodes": {
                "1": {"prev": 0, "next": 2, "value": 1},
                "2": {"prev": 0, "next": 0, "value": 2}}}"#,
        );
        let problems = check_queue(&q, QueueOrder::Ascending);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("prev does not point back"));
    }

    #[test]
    fn test_cycle_and_orphan() {
        let cyclic = queue(
            r#"{"head": 1, "tail": 2, "nodes": {
                "1": {"prev": 0, "next": 2, "value": 1},
                "2": {"prev": 1, "next": 1, "value": 2}}}"#,
        );
        let problems = check_queue(&cyclic, QueueOrder::Ascending);
        assert!(problems.iter().any(|p| p.contains("cycle")));

        let orphan = queue(
            r#"{"head": 1, "tail": 1, "nodes": {
                "1": {"prev": 0, "next": 0, "value": 1},
                "5": {"prev": 0, "next": 0, "value": 3}}}"#,
        );
        let problems = check_queue(&orphan, QueueOrder::Ascending);
        assert!(problems.iter().any(|p| p.contains("reachable")));
    }
}
