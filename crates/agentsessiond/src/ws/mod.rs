//! Multiplexed WebSocket stream (`/api/ws`): in-band auth handshake plus
//! per-session subscribe/unsubscribe.

mod handler;
mod types;

pub use handler::ws_handler;
pub use types::{WsCommand, WsServerMessage};
