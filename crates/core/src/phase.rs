//! Phase identifiers and the static phase table.
//!
//! The phase order is configuration: a list of phase ids resolved against a
//! `PhaseRegistry` of agent factories once at process start. The resulting
//! `PhaseTable` is shared read-only (behind an `Arc`) by every session.

use crate::agent::PhaseAgentFactory;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const ANALYSIS_ROUTE: &str = "analysis_route";
pub const WORD_CREATION_LOGIC: &str = "word_creation_logic";
pub const SYNONYM_DIFFERENTIATION: &str = "synonym_differentiation";
pub const CO_OCCURRENCE: &str = "co_occurrence";
pub const QUESTION_ANSWER: &str = "question_answer";

/// The order phases run in when none is configured.
pub const DEFAULT_ORDER: [&str; 5] = [
    ANALYSIS_ROUTE,
    WORD_CREATION_LOGIC,
    SYNONYM_DIFFERENTIATION,
    CO_OCCURRENCE,
    QUESTION_ANSWER,
];

/// Identifier of a pedagogical phase.
///
/// Kept as an open string rather than an enum so progress rows written under an
/// older configuration can still be loaded and recognised as unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(String);

impl PhaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PhaseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PhaseId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseTableError {
    #[error("Phase order is empty")]
    Empty,
    #[error("Phase '{0}' appears more than once")]
    Duplicate(PhaseId),
    #[error("Phase '{phase}' requires '{requires}', which does not run before it")]
    UnknownRequirement { phase: PhaseId, requires: PhaseId },
    #[error("No agent factory registered for phase '{0}'")]
    NoFactory(PhaseId),
}

/// One row of the phase table.
#[derive(Clone)]
pub struct PhaseDescriptor {
    pub id: PhaseId,
    pub factory: Arc<dyn PhaseAgentFactory>,
    /// Phase that must already be complete before this one may start.
    pub requires: Option<PhaseId>,
}

impl fmt::Debug for PhaseDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseDescriptor")
            .field("id", &self.id)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// Agent factories keyed by phase id, with an optional catch-all.
#[derive(Default, Clone)]
pub struct PhaseRegistry {
    factories: HashMap<PhaseId, Arc<dyn PhaseAgentFactory>>,
    fallback: Option<Arc<dyn PhaseAgentFactory>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the factory used for `phase`, replacing any previous one.
    pub fn register(mut self, phase: impl Into<PhaseId>, factory: Arc<dyn PhaseAgentFactory>) -> Self {
        self.factories.insert(phase.into(), factory);
        self
    }

    /// Factory used for any phase without a dedicated registration.
    pub fn with_fallback(mut self, factory: Arc<dyn PhaseAgentFactory>) -> Self {
        self.fallback = Some(factory);
        self
    }

    pub fn resolve(&self, phase: &PhaseId) -> Option<Arc<dyn PhaseAgentFactory>> {
        self.factories
            .get(phase)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

/// The ordered, validated list of phases.
#[derive(Debug, Clone)]
pub struct PhaseTable {
    phases: Vec<PhaseDescriptor>,
}

impl PhaseTable {
    /// Validates an explicit descriptor list.
    ///
    /// Ids must be unique and every requirement must name a phase that comes
    /// earlier in the order.
    pub fn new(phases: Vec<PhaseDescriptor>) -> Result<Self, PhaseTableError> {
        if phases.is_empty() {
            return Err(PhaseTableError::Empty);
        }
        let mut seen = HashSet::new();
        for descriptor in &phases {
            if let Some(requires) = &descriptor.requires {
                if !seen.contains(requires) {
                    return Err(PhaseTableError::UnknownRequirement {
                        phase: descriptor.id.clone(),
                        requires: requires.clone(),
                    });
                }
            }
            if !seen.insert(descriptor.id.clone()) {
                return Err(PhaseTableError::Duplicate(descriptor.id.clone()));
            }
        }
        Ok(Self { phases })
    }

    /// Builds a strictly linear table: each phase requires the one before it.
    pub fn from_order(order: &[PhaseId], registry: &PhaseRegistry) -> Result<Self, PhaseTableError> {
        let mut phases = Vec::with_capacity(order.len());
        let mut previous: Option<PhaseId> = None;
        for id in order {
            let factory = registry
                .resolve(id)
                .ok_or_else(|| PhaseTableError::NoFactory(id.clone()))?;
            phases.push(PhaseDescriptor {
                id: id.clone(),
                factory,
                requires: previous.replace(id.clone()),
            });
        }
        Self::new(phases)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn first(&self) -> &PhaseDescriptor {
        // `new` rejects empty tables.
        &self.phases[0]
    }

    pub fn get(&self, index: usize) -> Option<&PhaseDescriptor> {
        self.phases.get(index)
    }

    pub fn position(&self, phase: &PhaseId) -> Option<usize> {
        self.phases.iter().position(|d| &d.id == phase)
    }

    pub fn contains(&self, phase: &PhaseId) -> bool {
        self.position(phase).is_some()
    }

    pub fn is_last(&self, phase: &PhaseId) -> bool {
        self.phases.last().is_some_and(|d| &d.id == phase)
    }

    pub fn ids(&self) -> impl Iterator<Item = &PhaseId> {
        self.phases.iter().map(|d| &d.id)
    }
}

/// Parses a comma-separated phase order, ignoring blanks.
pub fn parse_order(raw: &str) -> Vec<PhaseId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PhaseId::from)
        .collect()
}

pub fn default_order() -> Vec<PhaseId> {
    DEFAULT_ORDER.iter().copied().map(PhaseId::from).collect()
}
