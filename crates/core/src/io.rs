//! Dialogue I/O between a phase agent and the learner.
//!
//! A `TurnIo` is the agent's only view of the transport. Every method is a
//! suspension point: `next_user_turn` waits for a final transcript and `speak`
//! waits until playback has finished on the learner's side.

use crate::error::TurnError;
use async_trait::async_trait;

#[async_trait]
pub trait TurnIo: Send {
    /// Waits for the learner's next final transcript.
    ///
    /// Returns `Ok(None)` when the learner has left the session.
    async fn next_user_turn(&mut self) -> Result<Option<String>, TurnError>;

    /// Sends a reply and waits for its playback to complete.
    async fn speak(&mut self, text: &str) -> Result<(), TurnError>;
}

/// Enforces the per-phase learner turn ceiling on top of another `TurnIo`.
pub struct BoundedTurnIo<'a> {
    inner: &'a mut dyn TurnIo,
    max_turns: u32,
    turns: u32,
}

impl<'a> BoundedTurnIo<'a> {
    pub fn new(inner: &'a mut dyn TurnIo, max_turns: u32) -> Self {
        Self {
            inner,
            max_turns,
            turns: 0,
        }
    }

    /// Learner turns consumed so far.
    pub fn turns(&self) -> u32 {
        self.turns
    }
}

#[async_trait]
impl TurnIo for BoundedTurnIo<'_> {
    async fn next_user_turn(&mut self) -> Result<Option<String>, TurnError> {
        if self.turns >= self.max_turns {
            return Err(TurnError::TurnLimitReached {
                limit: self.max_turns,
            });
        }
        let turn = self.inner.next_user_turn().await?;
        if turn.is_some() {
            self.turns += 1;
        }
        Ok(turn)
    }

    async fn speak(&mut self, text: &str) -> Result<(), TurnError> {
        self.inner.speak(text).await
    }
}
