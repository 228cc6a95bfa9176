//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the database handle,
//! the phase orchestrator and the loaded configuration.

use crate::config::Config;
use std::sync::Arc;
use vocab_core::PhaseOrchestrator;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<crate::db::Db>,
    pub orchestrator: Arc<PhaseOrchestrator>,
    pub config: Arc<Config>,
}
