pub mod agent;
pub mod context;
pub mod error;
pub mod io;
pub mod llm_agent;
pub mod llm_client;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod phase;
pub mod prompt_server;
pub mod prompt_store;
pub mod repository;
pub mod resumption;
pub mod retry;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{AbandonReason, PhaseAgent, PhaseAgentFactory, PhaseHandle, PhaseSignal};
pub use context::SessionContext;
pub use error::SessionError;
pub use orchestrator::{
    Collaborators, OrchestratorSettings, PhaseOrchestrator, SessionEvent, SessionEvents,
    SessionOutcome,
};
pub use phase::{PhaseId, PhaseRegistry, PhaseTable};
pub use resumption::{EntryDecision, GreetingStyle, ResumptionPolicy};
