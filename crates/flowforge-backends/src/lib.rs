//! Generation backends for the four media families.
//!
//! Each configured `[backends.<family>]` section becomes one
//! [`OperationHandler`] bound to that family's `generate-*` node kind.

pub mod echo;
pub mod http;

use std::sync::Arc;

use flowforge_core::config::{BackendConfig, BackendProvider, BackendsConfig};
use flowforge_core::error::Result;
use flowforge_core::graph::{MediaFamily, NodeKind};
use flowforge_core::traits::OperationHandler;

pub use echo::EchoBackend;
pub use http::HttpBackend;

/// Create a backend for one family based on the provider name.
pub fn create_backend(
    family: MediaFamily,
    config: &BackendConfig,
) -> Result<Arc<dyn OperationHandler>> {
    Ok(match config.provider {
        BackendProvider::Echo => Arc::new(EchoBackend::new(family, config.model.clone())),
        BackendProvider::Http => Arc::new(HttpBackend::new(family, config.clone())?),
    })
}

/// Backends for every configured family, keyed by the node kind they serve.
/// Families without a section get no handler.
pub fn create_backends(
    config: &BackendsConfig,
) -> Result<Vec<(NodeKind, Arc<dyn OperationHandler>)>> {
    config
        .configured()
        .map(|(family, backend)| Ok((family.kind(), create_backend(family, backend)?)))
        .collect()
}
