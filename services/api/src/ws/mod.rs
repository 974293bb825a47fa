//! WebSocket Gateway
//!
//! - `connection`: adapts an axum WebSocket to the core `Connection` trait.
//! - `session`: resolves the client identity, wires providers and tools, and
//!   runs a voice session until the socket closes.

pub mod connection;
pub mod session;

pub use session::ws_handler;
