use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::{Graph, Node};
use flowforge_core::types::{NodeOutput, NodeStatus, RunId};

use crate::scheduler::execution_order;

/// Mutable state of one run: node statuses, outputs, and errors.
///
/// Owned by the run's coordinator task; node tasks never touch it.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub project_id: String,
    graph: Arc<Graph>,
    levels: Vec<Vec<String>>,
    statuses: HashMap<String, NodeStatus>,
    outputs: HashMap<String, NodeOutput>,
    errors: HashMap<String, String>,
    completed: usize,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        project_id: impl Into<String>,
        graph: Arc<Graph>,
        levels: Vec<Vec<String>>,
    ) -> Self {
        let statuses = graph
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Idle))
            .collect();
        Self {
            run_id,
            project_id: project_id.into(),
            graph,
            levels,
            statuses,
            outputs: HashMap::new(),
            errors: HashMap::new(),
            completed: 0,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn execution_order(&self) -> Vec<String> {
        execution_order(&self.levels)
    }

    pub fn total_nodes(&self) -> usize {
        self.statuses.len()
    }

    /// Count of nodes that succeeded so far.
    pub fn completed_nodes(&self) -> usize {
        self.completed
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.statuses.get(node_id).copied()
    }

    pub fn output(&self, node_id: &str) -> Option<&NodeOutput> {
        self.outputs.get(node_id)
    }

    pub fn error(&self, node_id: &str) -> Option<&str> {
        self.errors.get(node_id).map(String::as_str)
    }

    /// Move a node to `next`, rejecting anything but a forward transition.
    pub fn transition(&mut self, node_id: &str, next: NodeStatus) -> Result<()> {
        let current = self
            .statuses
            .get_mut(node_id)
            .ok_or_else(|| FlowError::node(node_id, "unknown node"))?;
        if !current.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                node: node_id.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        *current = next;
        Ok(())
    }

    /// Mark every idle node as queued.
    pub fn queue_all(&mut self) {
        for status in self.statuses.values_mut() {
            if *status == NodeStatus::Idle {
                *status = NodeStatus::Queued;
            }
        }
    }

    pub fn record_success(&mut self, node_id: &str, output: NodeOutput) -> Result<()> {
        self.transition(node_id, NodeStatus::Succeeded)?;
        self.outputs.insert(node_id.to_string(), output);
        self.completed += 1;
        Ok(())
    }

    pub fn record_failure(&mut self, node_id: &str, message: impl Into<String>) -> Result<()> {
        self.transition(node_id, NodeStatus::Failed)?;
        self.errors.insert(node_id.to_string(), message.into());
        Ok(())
    }

    /// A node is skipped when any direct upstream node failed, was skipped,
    /// or was canceled. Applied level by level this reaches every descendant.
    pub fn should_skip(&self, node_id: &str) -> bool {
        self.graph.upstream(node_id).any(|up| {
            matches!(
                self.status(up),
                Some(NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Canceled)
            )
        })
    }

    /// Build the input map for a node: its params, overlaid with upstream
    /// outputs keyed by input port name.
    ///
    /// Ports that accept several edges receive an array in edge order; other
    /// ports receive the single upstream output.
    pub fn assemble_inputs(&self, node: &Node) -> Map<String, Value> {
        let mut inputs = node.params.to_map();
        for port in &node.inputs {
            let values: Vec<Value> = self
                .graph
                .incoming(&node.id)
                .filter(|e| e.target_port_id == port.id)
                .filter_map(|e| self.outputs.get(&e.source_node_id))
                .map(NodeOutput::to_value)
                .collect();
            if values.is_empty() {
                continue;
            }
            let value = if port.cardinality.accepts_many() {
                Value::Array(values)
            } else {
                values.into_iter().next().unwrap_or(Value::Null)
            };
            inputs.insert(port.name.clone(), value);
        }
        inputs
    }

    /// Nodes in execution order whose status equals `status`.
    pub fn nodes_with(&self, status: NodeStatus) -> Vec<String> {
        self.execution_order()
            .into_iter()
            .filter(|id| self.status(id) == Some(status))
            .collect()
    }

    /// Nodes in execution order that have not reached a terminal state.
    pub fn unfinished(&self) -> Vec<String> {
        self.execution_order()
            .into_iter()
            .filter(|id| self.status(id).is_some_and(|s| !s.is_terminal()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::graph::{Cardinality, Edge, NodeKind, NodeParams, Port, TextParams};
    use serde_json::json;

    fn context(nodes: Vec<Node>, edges: Vec<Edge>) -> RunContext {
        let levels = crate::scheduler::compute_levels(&nodes, &edges).unwrap();
        let graph = Arc::new(Graph::new(nodes, edges));
        let mut ctx = RunContext::new(RunId::from_string("r"), "p", graph, levels);
        ctx.queue_all();
        ctx
    }

    fn src(id: &str) -> Node {
        Node::new(id, NodeKind::Input).with_output(Port::output("out", "any"))
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let mut ctx = context(vec![src("a")], vec![]);
        assert_eq!(ctx.status("a"), Some(NodeStatus::Queued));
        ctx.transition("a", NodeStatus::Running).unwrap();
        ctx.record_success("a", NodeOutput::text("x")).unwrap();
        assert_eq!(ctx.completed_nodes(), 1);

        let err = ctx.transition("a", NodeStatus::Running).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
        assert!(ctx.record_failure("a", "late").is_err());
        assert_eq!(ctx.completed_nodes(), 1);
    }

    #[test]
    fn test_should_skip_on_failed_or_skipped_upstream() {
        let relay = |id: &str| {
            Node::new(id, NodeKind::Transform)
                .with_input(Port::input("in", "any"))
                .with_output(Port::output("out", "any"))
        };
        let nodes = vec![src("a"), relay("b"), relay("c")];
        let edges = vec![
            Edge::new("e1", ("a", "out"), ("b", "in")),
            Edge::new("e2", ("b", "out"), ("c", "in")),
        ];
        let mut ctx = context(nodes, edges);
        assert!(!ctx.should_skip("b"));

        ctx.transition("a", NodeStatus::Running).unwrap();
        ctx.record_failure("a", "boom").unwrap();
        assert!(ctx.should_skip("b"));
        assert!(!ctx.should_skip("c"));

        ctx.transition("b", NodeStatus::Skipped).unwrap();
        assert!(ctx.should_skip("c"));
        assert_eq!(ctx.error("a"), Some("boom"));
        assert_eq!(ctx.unfinished(), vec!["c"]);
    }

    #[test]
    fn test_assemble_inputs_edges_override_params() {
        let gen = Node::new("gen", NodeKind::GenerateText)
            .with_input(Port::input("prompt", "text/*"))
            .with_params(NodeParams::GenerateText(TextParams {
                prompt: Some("static".into()),
                model: Some("m1".into()),
                ..Default::default()
            }));
        let nodes = vec![src("a"), gen];
        let edges = vec![Edge::new("e1", ("a", "out"), ("gen", "prompt"))];
        let mut ctx = context(nodes, edges);
        ctx.transition("a", NodeStatus::Running).unwrap();
        ctx.record_success("a", NodeOutput::text("from edge")).unwrap();

        let node = ctx.graph().node("gen").unwrap().clone();
        let inputs = ctx.assemble_inputs(&node);
        assert_eq!(inputs["model"], "m1");
        assert_eq!(inputs["prompt"], json!({"type": "text", "data": "from edge"}));
    }

    #[test]
    fn test_assemble_inputs_many_port_gets_array() {
        let combine = Node::new("mix", NodeKind::Combine)
            .with_input(Port::input("parts", "any").with_cardinality(Cardinality::at_most(2)));
        let nodes = vec![src("a"), src("b"), combine];
        let edges = vec![
            Edge::new("e1", ("b", "out"), ("mix", "parts")),
            Edge::new("e2", ("a", "out"), ("mix", "parts")),
        ];
        let mut ctx = context(nodes, edges);
        for (id, text) in [("a", "A"), ("b", "B")] {
            ctx.transition(id, NodeStatus::Running).unwrap();
            ctx.record_success(id, NodeOutput::text(text)).unwrap();
        }
        let node = ctx.graph().node("mix").unwrap().clone();
        let inputs = ctx.assemble_inputs(&node);
        // Edge order, not node order.
        assert_eq!(
            inputs["parts"],
            json!([{"type": "text", "data": "B"}, {"type": "text", "data": "A"}])
        );
        assert_eq!(ctx.nodes_with(NodeStatus::Succeeded), vec!["a", "b"]);
    }
}
