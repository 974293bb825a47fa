//! Voice Gateway Library Crate
//!
//! Configuration, shared state, routing and the WebSocket gateway of the
//! voice service. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod router;
pub mod state;
pub mod ws;
