mod routes;
mod server;
mod state;

pub use server::{build_router, GatewayServer};
pub use state::AppState;
