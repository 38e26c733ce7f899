pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use event::{EventSink, ProgressEvent, ProgressReporter};
pub use frame::{encode_frame, FrameParser};
pub use graph::{
    Edge, Graph, GraphSubmission, GraphValidation, MediaFamily, Node, NodeKind, NodeParams, Port,
};
pub use traits::{GraphStore, OperationHandler, RunStore};
pub use types::*;
