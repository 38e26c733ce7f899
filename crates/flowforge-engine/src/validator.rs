//! Connection and whole-graph validation.
//!
//! Everything here is pure: the same input always yields the same report.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use flowforge_core::graph::{
    Edge, GraphValidation, IssueKind, Node, Port, ValidationIssue, ANY_TYPE,
};

/// Outcome of checking one prospective edge: `{valid, reason?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConnectionCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// Whether a value typed `source` may flow into a slot typed `target`.
///
/// Exact matches and `any` on either side always pass; `category/*` on
/// either side matches any type in that category.
pub fn data_types_compatible(source: &str, target: &str) -> bool {
    if source == target || source == ANY_TYPE || target == ANY_TYPE {
        return true;
    }
    if let Some(category) = target.strip_suffix("/*") {
        if category_of(source) == category {
            return true;
        }
    }
    if let Some(category) = source.strip_suffix("/*") {
        if category_of(target) == category {
            return true;
        }
    }
    false
}

fn category_of(data_type: &str) -> &str {
    data_type.split('/').next().unwrap_or(data_type)
}

/// Check whether an edge `source.source_port_id -> target.target_port_id`
/// may be added on top of `existing_edges`.
pub fn validate_connection(
    source: &Node,
    target: &Node,
    source_port_id: &str,
    target_port_id: &str,
    existing_edges: &[Edge],
) -> ConnectionCheck {
    match check_connection(source, target, source_port_id, target_port_id, existing_edges) {
        Ok(()) => ConnectionCheck::ok(),
        Err((_, reason)) => ConnectionCheck::rejected(reason),
    }
}

fn check_connection(
    source: &Node,
    target: &Node,
    source_port_id: &str,
    target_port_id: &str,
    existing_edges: &[Edge],
) -> Result<(), (IssueKind, String)> {
    if source.id == target.id {
        return Err((
            IssueKind::SelfConnection,
            format!("self-connection on node '{}' is not allowed", source.id),
        ));
    }

    let (Some(source_port), Some(target_port)) = (
        source.output_port(source_port_id),
        target.input_port(target_port_id),
    ) else {
        return Err((
            IssueKind::InvalidPort,
            format!(
                "invalid port connection: {}.{} -> {}.{}",
                source.id, source_port_id, target.id, target_port_id
            ),
        ));
    };

    if !data_types_compatible(&source_port.data_type, &target_port.data_type) {
        return Err((
            IssueKind::TypeMismatch,
            format!(
                "incompatible data types: {} ({}) -> {} ({})",
                source_port.id, source_port.data_type, target_port.id, target_port.data_type
            ),
        ));
    }

    let inbound = existing_edges
        .iter()
        .filter(|e| e.targets(&target.id, &target_port.id))
        .count();
    if !target_port.cardinality.has_room(inbound) {
        return Err((IssueKind::Cardinality, cardinality_message(&target.id, target_port)));
    }

    let outbound = existing_edges
        .iter()
        .filter(|e| e.sources(&source.id, &source_port.id))
        .count();
    if !source_port.cardinality.has_room(outbound) {
        return Err((IssueKind::Cardinality, cardinality_message(&source.id, source_port)));
    }

    if reaches(&target.id, &source.id, existing_edges) {
        return Err((
            IssueKind::Cycle,
            format!(
                "connecting {} -> {} would create a cycle",
                source.id, target.id
            ),
        ));
    }

    Ok(())
}

fn cardinality_message(node_id: &str, port: &Port) -> String {
    format!(
        "port {}.{} accepts at most {} connection(s)",
        node_id,
        port.id,
        port.cardinality.max.unwrap_or(u32::MAX)
    )
}

/// BFS along edges from `from`; true when `to` is reachable.
fn reaches(from: &str, to: &str, edges: &[Edge]) -> bool {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source_node_id.as_str())
            .or_default()
            .push(edge.target_node_id.as_str());
    }

    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        if current == to {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(next) = adjacency.get(current) {
            queue.extend(next.iter().copied());
        }
    }
    false
}

/// Validate a whole graph and collect every error.
///
/// Each edge is checked against the edges accepted before it, so cycle and
/// cardinality errors name the edge that tips the graph over.
pub fn validate_graph(nodes: &[Node], edges: &[Edge]) -> GraphValidation {
    let mut errors = Vec::new();

    let mut by_id: HashMap<&str, &Node> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if by_id.insert(node.id.as_str(), node).is_some() {
            errors.push(ValidationIssue {
                kind: IssueKind::DuplicateNode,
                node_id: Some(node.id.clone()),
                edge_id: None,
                message: format!("duplicate node id '{}'", node.id),
            });
        }
    }
    // Later duplicates must not shadow the first definition.
    for node in nodes.iter().rev() {
        by_id.insert(node.id.as_str(), node);
    }

    let mut accepted: Vec<Edge> = Vec::with_capacity(edges.len());
    for edge in edges {
        let issue = |kind, node_id: Option<&str>, message| ValidationIssue {
            kind,
            node_id: node_id.map(str::to_string),
            edge_id: Some(edge.id.clone()),
            message,
        };

        let (Some(source), Some(target)) = (
            by_id.get(edge.source_node_id.as_str()),
            by_id.get(edge.target_node_id.as_str()),
        ) else {
            let missing = if by_id.contains_key(edge.source_node_id.as_str()) {
                &edge.target_node_id
            } else {
                &edge.source_node_id
            };
            errors.push(issue(
                IssueKind::UnknownNode,
                Some(missing.as_str()),
                format!("edge '{}' references unknown node '{}'", edge.id, missing),
            ));
            continue;
        };

        if let Err((kind, reason)) = check_connection(
            source,
            target,
            &edge.source_port_id,
            &edge.target_port_id,
            &accepted,
        ) {
            errors.push(issue(
                kind,
                Some(edge.target_node_id.as_str()),
                format!("edge '{}': {}", edge.id, reason),
            ));
            continue;
        }

        // Ports exist at this point.
        let source_type = source
            .output_port(&edge.source_port_id)
            .map(|p| p.data_type.as_str())
            .unwrap_or(ANY_TYPE);
        let target_type = target
            .input_port(&edge.target_port_id)
            .map(|p| p.data_type.as_str())
            .unwrap_or(ANY_TYPE);
        if !data_types_compatible(source_type, &edge.data_type)
            || !data_types_compatible(&edge.data_type, target_type)
        {
            errors.push(issue(
                IssueKind::TypeMismatch,
                Some(edge.target_node_id.as_str()),
                format!(
                    "edge '{}' carries {} between {} and {}",
                    edge.id, edge.data_type, source_type, target_type
                ),
            ));
            continue;
        }

        accepted.push(edge.clone());
    }

    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.id.as_str()) {
            continue;
        }
        let missing: Vec<&str> = node
            .required_inputs()
            .filter(|port| !edges.iter().any(|e| e.targets(&node.id, &port.id)))
            .map(|port| port.name.as_str())
            .collect();
        if !missing.is_empty() {
            errors.push(ValidationIssue {
                kind: IssueKind::MissingInput,
                node_id: Some(node.id.clone()),
                edge_id: None,
                message: format!(
                    "node '{}' is missing required inputs: {}",
                    node.id,
                    missing.join(", ")
                ),
            });
        }
    }

    GraphValidation::from_errors(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::graph::{Cardinality, NodeKind, Port};

    fn producer(id: &str, data_type: &str) -> Node {
        Node::new(id, NodeKind::Input).with_output(Port::output("out", data_type))
    }

    fn consumer(id: &str, data_type: &str) -> Node {
        Node::new(id, NodeKind::Output).with_input(Port::input("in", data_type))
    }

    fn relay(id: &str) -> Node {
        Node::new(id, NodeKind::Transform)
            .with_input(Port::input("in", "any"))
            .with_output(Port::output("out", "any"))
    }

    #[test]
    fn test_data_type_wildcards() {
        assert!(data_types_compatible("image/png", "image/png"));
        assert!(data_types_compatible("image/png", "image/*"));
        assert!(data_types_compatible("image/*", "image/png"));
        assert!(data_types_compatible("any", "video/mp4"));
        assert!(data_types_compatible("audio/wav", "any"));
        assert!(!data_types_compatible("image/png", "video/*"));
        assert!(!data_types_compatible("image/*", "video/*"));
        assert!(!data_types_compatible("text/plain", "image/png"));
    }

    #[test]
    fn test_connection_accepts_compatible_ports() {
        let a = producer("a", "image/png");
        let b = consumer("b", "image/*");
        let check = validate_connection(&a, &b, "out", "in", &[]);
        assert_eq!(check, ConnectionCheck::ok());
    }

    #[test]
    fn test_connection_rejects_missing_ports() {
        let a = producer("a", "any");
        let b = consumer("b", "any");
        let check = validate_connection(&a, &b, "nope", "in", &[]);
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("invalid port connection"));

        // Source port must be an output, target port an input.
        let check = validate_connection(&b, &a, "in", "out", &[]);
        assert!(!check.valid);
    }

    #[test]
    fn test_connection_rejects_type_mismatch() {
        let a = producer("a", "text/plain");
        let b = consumer("b", "image/*");
        let check = validate_connection(&a, &b, "out", "in", &[]);
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("incompatible data types"));
    }

    #[test]
    fn test_target_cardinality_enforced() {
        let a = producer("a", "any");
        let c = producer("c", "any");
        let b = consumer("b", "any");
        let existing = vec![Edge::new("e1", ("a", "out"), ("b", "in"))];
        let check = validate_connection(&c, &b, "out", "in", &existing);
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("at most 1"));
    }

    #[test]
    fn test_source_cardinality_enforced() {
        let a = Node::new("a", NodeKind::Input)
            .with_output(Port::output("out", "any").with_cardinality(Cardinality::single()));
        let b = consumer("b", "any");
        let c = consumer("c", "any");
        let existing = vec![Edge::new("e1", ("a", "out"), ("b", "in"))];
        assert!(!validate_connection(&a, &c, "out", "in", &existing).valid);
    }

    #[test]
    fn test_self_connection_rejected() {
        let n = relay("n");
        let check = validate_connection(&n, &n, "out", "in", &[]);
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("self-connection"));
    }

    #[test]
    fn test_cycle_rejected() {
        let a = relay("a");
        let b = relay("b");
        let c = relay("c");
        let existing = vec![
            Edge::new("e1", ("a", "out"), ("b", "in")),
            Edge::new("e2", ("b", "out"), ("c", "in")),
        ];
        // c -> a would close a -> b -> c -> a
        let check = validate_connection(&c, &a, "out", "in", &existing);
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("cycle"));
    }

    #[test]
    fn test_graph_reports_missing_inputs_once_per_node() {
        let node = Node::new("mix", NodeKind::Combine)
            .with_input(Port::input("left", "any"))
            .with_input(Port::input("right", "any"))
            .with_input(Port::input("extra", "any").optional());
        let report = validate_graph(&[node], &[]);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, IssueKind::MissingInput);
        assert!(report.errors[0].message.contains("left, right"));
    }

    #[test]
    fn test_graph_reports_structural_errors() {
        let nodes = vec![producer("a", "text/plain"), producer("a", "any"), consumer("b", "any")];
        let edges = vec![
            Edge::new("e1", ("a", "out"), ("b", "in")),
            Edge::new("e2", ("ghost", "out"), ("b", "in")),
        ];
        let report = validate_graph(&nodes, &edges);
        let kinds: Vec<IssueKind> = report.errors.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![IssueKind::DuplicateNode, IssueKind::UnknownNode]);
        assert_eq!(report.errors[1].edge_id.as_deref(), Some("e2"));
    }

    #[test]
    fn test_graph_edge_data_type_checked() {
        let nodes = vec![producer("a", "image/png"), consumer("b", "image/*")];
        let edges = vec![Edge::new("e1", ("a", "out"), ("b", "in")).with_data_type("audio/wav")];
        let report = validate_graph(&nodes, &edges);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, IssueKind::TypeMismatch);
    }

    #[test]
    fn test_graph_cycle_names_closing_edge() {
        let nodes = vec![relay("a"), relay("b")];
        let edges = vec![
            Edge::new("e1", ("a", "out"), ("b", "in")),
            Edge::new("e2", ("b", "out"), ("a", "in")),
        ];
        let report = validate_graph(&nodes, &edges);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, IssueKind::Cycle);
        assert_eq!(report.errors[0].edge_id.as_deref(), Some("e2"));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let nodes = vec![relay("a"), relay("b"), consumer("c", "text/plain")];
        let edges = vec![
            Edge::new("e1", ("a", "out"), ("b", "in")),
            Edge::new("e2", ("b", "out"), ("a", "in")),
            Edge::new("e3", ("b", "out"), ("c", "in")),
        ];
        let first = validate_graph(&nodes, &edges);
        let second = validate_graph(&nodes, &edges);
        assert_eq!(first, second);
    }

    #[test]
    fn test_valid_chain_passes() {
        let nodes = vec![producer("a", "text/plain"), relay("b"), consumer("c", "any")];
        let edges = vec![
            Edge::new("e1", ("a", "out"), ("b", "in")),
            Edge::new("e2", ("b", "out"), ("c", "in")),
        ];
        let report = validate_graph(&nodes, &edges);
        assert!(report.valid, "{:?}", report.errors);
    }
}
