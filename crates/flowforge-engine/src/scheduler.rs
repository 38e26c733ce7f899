use std::collections::HashMap;

use flowforge_core::graph::{Edge, Node};

/// Group nodes into dependency levels with Kahn's algorithm.
///
/// Every node in a level depends only on nodes in earlier levels. Each level
/// is ordered by node insertion order. Edges touching unknown nodes are
/// ignored. Returns `None` when the graph has a cycle.
pub fn compute_levels(nodes: &[Node], edges: &[Edge]) -> Option<Vec<Vec<String>>> {
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        position.entry(node.id.as_str()).or_insert(i);
    }

    let mut in_degree: HashMap<&str, usize> = position.keys().map(|&id| (id, 0)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        let (source, target) = (edge.source_node_id.as_str(), edge.target_node_id.as_str());
        if !position.contains_key(source) {
            continue;
        }
        let Some(degree) = in_degree.get_mut(target) else {
            continue;
        };
        *degree += 1;
        children.entry(source).or_default().push(target);
    }

    let mut current: Vec<&str> = nodes
        .iter()
        .enumerate()
        .filter(|(i, n)| position[n.id.as_str()] == *i && in_degree[n.id.as_str()] == 0)
        .map(|(_, n)| n.id.as_str())
        .collect();

    let mut levels = Vec::new();
    let mut released = 0;
    while !current.is_empty() {
        released += current.len();
        let mut next = Vec::new();
        for id in &current {
            for &child in children.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(child);
                    }
                }
            }
        }
        next.sort_by_key(|id| position[id]);
        levels.push(current.iter().map(|id| id.to_string()).collect());
        current = next;
    }

    (released == position.len()).then_some(levels)
}

/// Flatten levels into a single execution order.
pub fn execution_order(levels: &[Vec<String>]) -> Vec<String> {
    levels.iter().flatten().cloned().collect()
}
