//! End-to-end runs over the SQLite store, checked through the wire frames.

use std::sync::Arc;

use flowforge_backends::EchoBackend;
use flowforge_core::config::EngineConfig;
use flowforge_core::event::ProgressEvent;
use flowforge_core::frame::{encode_frame, FrameParser};
use flowforge_core::graph::{CombineStrategy, MediaFamily, NodeKind};
use flowforge_core::traits::RunStore;
use flowforge_core::types::{NodeStatus, RunStatus};
use flowforge_engine::{Engine, HandlerRegistry, RunView};
use flowforge_store::SqliteStore;
use flowforge_test_utils::{
    chain_submission, combine, edge, output, submission, text_input, two_branch_submission,
    Script, ScriptedHandler,
};

fn echo_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::with_local_handlers();
    for family in MediaFamily::ALL {
        registry.register(family.kind(), EchoBackend::new(family, None));
    }
    registry
}

/// Encode every event and feed the text back through the parser in small chunks.
fn over_the_wire(events: &[ProgressEvent]) -> Vec<ProgressEvent> {
    let text: String = events.iter().map(|e| encode_frame(e).unwrap()).collect();
    let mut parser = FrameParser::new();
    let mut decoded = vec![];
    let chars: Vec<char> = text.chars().collect();
    for chunk in chars.chunks(7) {
        let chunk: String = chunk.iter().collect();
        decoded.extend(parser.feed(&chunk).into_iter().map(|r| r.unwrap()));
    }
    assert!(parser.pending().is_empty());
    decoded
}

#[tokio::test]
async fn chain_runs_and_replays_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("flowforge.db")).unwrap());
    let engine = Engine::new(echo_registry(), store.clone(), EngineConfig::default());

    let handle = engine.start(chain_submission()).unwrap();
    let run_id = handle.run_id.clone();
    let (events, outcome) = handle.collect().await;
    let outcome = outcome.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.completed_nodes, 3);

    let decoded = over_the_wire(&events);
    assert_eq!(decoded.len(), events.len());
    let live = RunView::from_events(&decoded);
    assert_eq!(live.levels, vec![vec!["prompt"], vec!["image"], vec!["video"]]);
    assert_eq!(live.status, RunStatus::Completed);
    let video = live.node("video").unwrap();
    assert_eq!(video.status, NodeStatus::Succeeded);
    assert!(video
        .output
        .as_ref()
        .and_then(|o| o.url.as_deref())
        .unwrap()
        .starts_with("echo://video/"));

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_nodes, 3);
    let stored = store.run_events(&run_id).await.unwrap();
    let replayed = RunView::from_record(&run, &stored);
    for id in ["prompt", "image", "video"] {
        assert_eq!(replayed.status_of(id), live.status_of(id), "node {}", id);
    }
    assert_eq!(replayed.node("video").unwrap().output, video.output);
}

#[tokio::test]
async fn failed_branch_is_skipped_downstream_only() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let scripted = ScriptedHandler::new().script("right_gen", Script::Fail("quota".into()));
    let mut registry = HandlerRegistry::with_local_handlers();
    registry.register(NodeKind::GenerateText, scripted.clone());

    let mut graph = two_branch_submission();
    // A second consumer of the healthy branch must still run.
    graph.nodes.push(output("left_out"));
    graph
        .edges
        .push(edge("e5", ("left_gen", "out"), ("left_out", "in")));

    let engine = Engine::new(registry, store.clone(), EngineConfig::default());
    let handle = engine.start(graph).unwrap();
    let run_id = handle.run_id.clone();
    let (events, outcome) = handle.collect().await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.failed_nodes, vec!["right_gen"]);
    assert_eq!(outcome.skipped_nodes, vec!["mix"]);

    let live = RunView::from_events(&over_the_wire(&events));
    assert_eq!(live.status_of("left_out"), Some(NodeStatus::Succeeded));
    assert_eq!(live.failed_nodes, vec!["right_gen"]);
    assert!(live.node("right_gen").unwrap().error.as_deref().unwrap().contains("quota"));

    let run = store.get_run(&run_id).await.unwrap().unwrap();
    let replayed = RunView::from_record(&run, &store.run_events(&run_id).await.unwrap());
    assert_eq!(replayed.status_of("mix"), Some(NodeStatus::Skipped));
    assert_eq!(replayed.failed_nodes, vec!["right_gen"]);
    assert_eq!(run.completed_nodes, 4);
}

#[tokio::test]
async fn combine_gathers_many_inputs_in_edge_order() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let engine = Engine::new(echo_registry(), store, EngineConfig::default());
    let graph = submission(
        "fan-in",
        vec![
            text_input("a", "one"),
            text_input("b", "two"),
            text_input("c", "three"),
            combine("all", 3, CombineStrategy::List),
        ],
        vec![
            edge("e1", ("c", "text"), ("all", "parts")),
            edge("e2", ("a", "text"), ("all", "parts")),
            edge("e3", ("b", "text"), ("all", "parts")),
        ],
    );
    let (events, outcome) = engine.start(graph).unwrap().collect().await;
    assert_eq!(outcome.unwrap().completed_nodes, 4);

    let view = RunView::from_events(&events);
    let data = view.node("all").unwrap().output.clone().unwrap().data.unwrap();
    let texts: Vec<_> = data
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["data"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["three", "one", "two"]);
}

#[tokio::test]
async fn input_over_cardinality_is_rejected() {
    let graph = submission(
        "too-many",
        vec![
            text_input("a", "1"),
            text_input("b", "2"),
            combine("pair", 2, CombineStrategy::List),
        ],
        vec![
            edge("e1", ("a", "text"), ("pair", "parts")),
            edge("e2", ("b", "text"), ("pair", "parts")),
            edge("e3", ("a", "text"), ("pair", "parts")),
        ],
    );
    let report = Engine::validate(&graph);
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].edge_id.as_deref(), Some("e3"));
    // Validation is a pure function of the graph.
    assert_eq!(Engine::validate(&graph), report);
}
