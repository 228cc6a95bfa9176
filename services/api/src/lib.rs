//! Vocabulary API Library Crate
//!
//! Configuration, Postgres persistence, REST handlers, the WebSocket session
//! transport and routing for the vocabulary tutor. The `api` binary is a thin
//! wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
