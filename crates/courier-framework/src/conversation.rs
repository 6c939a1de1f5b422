//! Finite-state conversation engine.
//!
//! The engine is stateless between turns. For each event it looks up the
//! handler registered for the user's current state, runs it, and persists
//! the resulting transition before returning:
//!
//! | Step | Store effect | Outbound |
//! |---|---|---|
//! | `Stay` | session rewritten, context optionally replaced | reply, if any |
//! | `To` | session written with the new state | reply, if any |
//! | `Complete` | session deleted | reply, if any |
//! | `Reject` | none | error-class response |
//!
//! Callers must serialize turns per user; the
//! [`CommandRouter`](crate::router::CommandRouter) does so with a keyed lock.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use courier_core::{ChatId, Event, OutboundAction, SessionStore, UserId, UserSession, now_ms};

use crate::error::{EngineError, EngineResult};
use crate::step::{BoxedStepHandler, Step, StepHandler, Transition, Turn, into_step_handler};

/// How session writes are issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Plain `save`; the newest `updated_at` wins.
    #[default]
    LastWriteWins,
    /// `save_if_unchanged` against the session read at turn start. Needed
    /// when several processes share one store.
    Conditional,
}

/// What a turn did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnKind {
    /// The session stayed in its state.
    Stayed,
    /// The session moved to (or started in) the named state.
    Entered(String),
    /// The session was deleted.
    Completed,
    /// Input rejected; nothing written.
    Rejected,
    /// No handler applied; nothing written.
    Ignored,
}

/// Result of one conversational turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Session after the turn, `None` when absent.
    pub session: Option<UserSession>,
    /// Response to deliver, if any.
    pub action: Option<OutboundAction>,
    /// Kind of transition.
    pub kind: TurnKind,
}

impl TurnOutcome {
    pub(crate) fn ignored(session: Option<UserSession>) -> Self {
        Self {
            session,
            action: None,
            kind: TurnKind::Ignored,
        }
    }
}

/// Builder for [`ConversationEngine`].
pub struct ConversationEngineBuilder {
    states: HashMap<String, BoxedStepHandler>,
    entry: Option<BoxedStepHandler>,
    write_mode: WriteMode,
}

impl ConversationEngineBuilder {
    /// Registers the handler of a state.
    pub fn state(mut self, name: impl Into<String>, handler: impl StepHandler) -> Self {
        self.states.insert(name.into(), into_step_handler(handler));
        self
    }

    /// Registers the handler run when the user has no session.
    pub fn entry(mut self, handler: impl StepHandler) -> Self {
        self.entry = Some(into_step_handler(handler));
        self
    }

    /// Sets the write mode.
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Builds the engine on top of a store.
    pub fn build(self, store: Arc<dyn SessionStore>) -> ConversationEngine {
        ConversationEngine {
            states: self.states,
            entry: self.entry,
            store,
            write_mode: self.write_mode,
        }
    }
}

/// Drives per-user dialogue over a [`SessionStore`].
pub struct ConversationEngine {
    states: HashMap<String, BoxedStepHandler>,
    entry: Option<BoxedStepHandler>,
    store: Arc<dyn SessionStore>,
    write_mode: WriteMode,
}

impl ConversationEngine {
    /// Starts building an engine.
    pub fn builder() -> ConversationEngineBuilder {
        ConversationEngineBuilder {
            states: HashMap::new(),
            entry: None,
            write_mode: WriteMode::default(),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Whether a handler exists for `state`.
    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    /// Whether an entry handler is registered.
    pub fn has_entry(&self) -> bool {
        self.entry.is_some()
    }

    /// Runs one turn.
    ///
    /// With a session the handler of its state runs; without one the entry
    /// handler does. A session whose state has no handler is deleted and the
    /// turn completes quietly.
    pub async fn handle(
        &self,
        event: Event,
        session: Option<UserSession>,
        level: u32,
    ) -> EngineResult<TurnOutcome> {
        let handler = match &session {
            Some(s) => match self.states.get(&s.state) {
                Some(handler) => handler.clone(),
                None => {
                    warn!(user_id = s.user_id, state = %s.state, "No handler for session state, completing");
                    self.store.delete(s.user_id).await?;
                    return Ok(TurnOutcome {
                        session: None,
                        action: None,
                        kind: TurnKind::Completed,
                    });
                }
            },
            None => match &self.entry {
                Some(handler) => handler.clone(),
                None => return Ok(TurnOutcome::ignored(None)),
            },
        };

        let turn = Turn {
            state: session.as_ref().map(|s| s.state.clone()),
            context: session
                .as_ref()
                .map(|s| s.context.clone())
                .unwrap_or_default(),
            level,
            event,
        };
        let chat_id = turn.chat_id();
        let user_id = turn.user_id();

        let step = handler(turn).await;
        self.apply(user_id, chat_id, session, step).await
    }

    /// Persists `step` on top of `prior` and builds the outbound response.
    ///
    /// Also used by the router for stateless command results, so a command
    /// can open a conversation.
    pub async fn apply(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        prior: Option<UserSession>,
        step: Step,
    ) -> EngineResult<TurnOutcome> {
        let reply = step.reply.map(|text| OutboundAction::reply(chat_id, text));

        let (next, kind) = match step.transition {
            Transition::Reject(reason) => {
                debug!(user_id, reason = %reason, "Input rejected");
                return Ok(TurnOutcome {
                    session: prior,
                    action: Some(OutboundAction::error(chat_id, reason)),
                    kind: TurnKind::Rejected,
                });
            }
            Transition::Complete => {
                if prior.is_some() {
                    self.store.delete(user_id).await?;
                }
                debug!(user_id, "Conversation completed");
                return Ok(TurnOutcome {
                    session: None,
                    action: reply,
                    kind: TurnKind::Completed,
                });
            }
            Transition::Stay(context) => match &prior {
                Some(p) => {
                    let context = context.unwrap_or_else(|| p.context.clone());
                    (
                        UserSession::new(user_id, p.state.clone()).with_context(context),
                        TurnKind::Stayed,
                    )
                }
                // Nothing to stay in: the implicit initial state is not stored.
                None => {
                    return Ok(TurnOutcome {
                        session: None,
                        action: reply,
                        kind: TurnKind::Stayed,
                    });
                }
            },
            Transition::To { state, context } => {
                if !self.states.contains_key(&state) {
                    warn!(user_id, state = %state, "Entering state without a handler");
                }
                let kind = TurnKind::Entered(state.clone());
                (UserSession::new(user_id, state).with_context(context), kind)
            }
        };

        let prior_at = prior.as_ref().map(|p| p.updated_at);
        let next = next.updated_at(prior_at.map_or(now_ms(), |at| now_ms().max(at + 1)));

        match self.write_mode {
            WriteMode::LastWriteWins => self.store.save(&next).await?,
            WriteMode::Conditional => {
                if !self.store.save_if_unchanged(&next, prior_at).await? {
                    return Err(EngineError::Conflict { user_id });
                }
            }
        }
        debug!(user_id, state = %next.state, "Session written");

        Ok(TurnOutcome {
            session: Some(next),
            action: reply,
            kind,
        })
    }
}
