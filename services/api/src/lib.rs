//! Parley API Library Crate
//!
//! The voice bridge service: configuration, the conversation pool, the
//! PostgreSQL store, REST handlers, the WebSocket session bridge, and routing.
//! The `api` binary is a thin wrapper around this library.

pub mod audio;
pub mod config;
pub mod conversations;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
