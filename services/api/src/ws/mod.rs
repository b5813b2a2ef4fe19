//! WebSocket voice sessions
//!
//! - `protocol`: the JSON messages exchanged with the voice client.
//! - `registry`: the process-wide record of the one active session.
//! - `bridge`: the session bridge between the client and the model service.
//! - `tools`: tracked tool-execution tasks.
//! - `transcript`: the per-session transcript log.
//! - `session`: the axum upgrade handler.

pub mod bridge;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tools;
pub mod transcript;

pub use session::ws_handler;
