//! HTTP surface: session CRUD/lifecycle handlers, SSE streams, and the
//! route table that wires them behind bearer auth.

mod handlers;
mod routes;
mod sse;
mod state;

pub use routes::router;
pub use state::AppState;
