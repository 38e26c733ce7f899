//! Graph execution engine.
//!
//! A run goes through [`validator`] (port, type, cardinality and cycle
//! checks), [`scheduler`] (dependency levels), and [`executor`] (level by
//! level dispatch with skip propagation), reporting through
//! [`progress::ProgressStreamer`]. [`Engine`] ties these together and keeps
//! track of active runs.

pub mod context;
pub mod engine;
pub mod executor;
pub mod handlers;
pub mod observer;
pub mod progress;
pub mod scheduler;
pub mod validator;

pub use context::RunContext;
pub use engine::{Engine, RunHandle};
pub use executor::{Executor, ExecutorConfig, RunOutcome};
pub use handlers::HandlerRegistry;
pub use observer::{NodeView, RunView};
pub use progress::ProgressStreamer;
pub use scheduler::compute_levels;
pub use validator::{validate_connection, validate_graph, ConnectionCheck};
