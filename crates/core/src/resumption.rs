//! Entry-phase selection for new and returning learners.

use crate::model::{ProgressRecord, UserId, WordId};
use crate::phase::{PhaseId, PhaseTable};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// How the entry phase agent should open the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GreetingStyle {
    /// First time on this word.
    Fresh,
    /// Coming back after a long gap; recap before continuing.
    WarmReturn,
    /// Picking up shortly after the last session.
    BriefContinue,
}

impl GreetingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            GreetingStyle::Fresh => "fresh",
            GreetingStyle::WarmReturn => "warm-return",
            GreetingStyle::BriefContinue => "brief-continue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDecision {
    Start {
        phase: PhaseId,
        greeting: GreetingStyle,
    },
    /// Every phase is already done for this word; nothing should run.
    AlreadyComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumptionPolicy {
    pub warm_return_after: Duration,
}

impl Default for ResumptionPolicy {
    fn default() -> Self {
        Self {
            warm_return_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ResumptionPolicy {
    pub fn new(warm_return_after: Duration) -> Self {
        Self { warm_return_after }
    }

    /// Decides where a session for `(user_id, word_id)` starts.
    ///
    /// Never fails. Progress that does not fit the current phase table is
    /// logged and treated as a fresh start.
    pub fn choose_entry(
        &self,
        phases: &PhaseTable,
        user_id: UserId,
        word_id: WordId,
        progress: &[ProgressRecord],
        last_interaction_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EntryDecision {
        let fresh = EntryDecision::Start {
            phase: phases.first().id.clone(),
            greeting: GreetingStyle::Fresh,
        };

        if progress.is_empty() {
            return fresh;
        }

        if let Some(unknown) = progress.iter().find(|r| !phases.contains(&r.phase_id)) {
            warn!(
                user_id,
                word_id,
                phase = %unknown.phase_id,
                "Progress references an unknown phase, starting fresh"
            );
            return fresh;
        }

        let completed: HashSet<&PhaseId> = progress.iter().map(|r| &r.phase_id).collect();
        if phases.ids().all(|id| completed.contains(id)) {
            return EntryDecision::AlreadyComplete;
        }

        // Latest completion wins; ties go to the later phase in the order.
        let Some((latest, position)) = progress
            .iter()
            .filter_map(|r| phases.position(&r.phase_id).map(|pos| (r, pos)))
            .max_by_key(|(r, pos)| (r.completed_at, *pos))
        else {
            return fresh;
        };

        let Some(next) = phases.get(position + 1) else {
            return EntryDecision::AlreadyComplete;
        };

        if let Some(required) = &next.requires {
            if !completed.contains(required) {
                warn!(
                    user_id,
                    word_id,
                    phase = %next.id,
                    %required,
                    "Prerequisite missing from progress, starting fresh"
                );
                return fresh;
            }
        }

        let greeting = self.greeting_for(last_interaction_at, now);
        debug!(
            user_id,
            word_id,
            after = %latest.phase_id,
            entry = %next.id,
            greeting = greeting.as_str(),
            "Resuming"
        );
        EntryDecision::Start {
            phase: next.id.clone(),
            greeting,
        }
    }

    fn greeting_for(
        &self,
        last_interaction_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> GreetingStyle {
        let Some(last) = last_interaction_at else {
            return GreetingStyle::WarmReturn;
        };
        let threshold = TimeDelta::from_std(self.warm_return_after).unwrap_or(TimeDelta::MAX);
        if now.signed_duration_since(last) > threshold {
            GreetingStyle::WarmReturn
        } else {
            GreetingStyle::BriefContinue
        }
    }
}
