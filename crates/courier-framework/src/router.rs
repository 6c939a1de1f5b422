//! Routing of events to commands and conversations.
//!
//! For each event the [`CommandRouter`] takes the sender's lock, loads their
//! session and picks exactly one target:
//!
//! 1. a matching global command runs, session or not;
//! 2. an active session goes to the [`ConversationEngine`];
//! 3. otherwise a matching stateless command runs;
//! 4. otherwise the engine's entry handler, if one is registered;
//! 5. otherwise the fallback handler, if any;
//! 6. otherwise the event is dropped.
//!
//! Commands are subject to the sender's level. Their results go through the
//! same persistence path as conversation steps, so `/start` can open a
//! conversation and a global `/cancel` can close one.
//!
//! # Tower Service Integration
//!
//! `CommandRouter` implements `tower::Service<Event>`, so tower middleware
//! applies directly:
//!
//! ```rust,ignore
//! use tower::ServiceBuilder;
//! use tower::timeout::TimeoutLayer;
//!
//! let service = ServiceBuilder::new()
//!     .layer(TimeoutLayer::new(Duration::from_secs(5)))
//!     .service(router.clone());
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tower::Service;
use tracing::{debug, trace};

use courier_core::{
    Event, OutboundAction, UniformLevel, UserId, UserLevelProvider, UserSession,
};

use crate::command::parse_command;
use crate::conversation::{ConversationEngine, TurnOutcome};
use crate::error::{EngineError, EngineResult};
use crate::keyed::KeyedMutex;
use crate::step::{BoxedStepHandler, Step, StepHandler, Turn, into_step_handler};

/// Which target handled an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The sender's active conversation.
    Conversation,
    /// A stateless command.
    Command(String),
    /// The conversation entry handler.
    Entry,
    /// The fallback handler.
    Fallback,
    /// Nothing matched.
    Dropped,
}

/// Result of routing one event.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Target that handled the event.
    pub route: Route,
    /// What the turn did.
    pub turn: TurnOutcome,
}

impl RouteOutcome {
    /// The outbound response, if any.
    pub fn action(&self) -> Option<&OutboundAction> {
        self.turn.action.as_ref()
    }

    /// Takes the outbound response out of the outcome.
    pub fn take_action(&mut self) -> Option<OutboundAction> {
        self.turn.action.take()
    }

    /// The sender's session after the turn.
    pub fn session(&self) -> Option<&UserSession> {
        self.turn.session.as_ref()
    }
}

struct CommandEntry {
    handler: BoxedStepHandler,
    min_level: u32,
    global: bool,
}

struct RouterInner {
    engine: ConversationEngine,
    commands: HashMap<String, CommandEntry>,
    fallback: Option<BoxedStepHandler>,
    levels: Arc<dyn UserLevelProvider>,
    locks: KeyedMutex<UserId>,
}

/// Builder for [`CommandRouter`].
pub struct CommandRouterBuilder {
    engine: ConversationEngine,
    commands: HashMap<String, CommandEntry>,
    fallback: Option<BoxedStepHandler>,
    levels: Arc<dyn UserLevelProvider>,
}

impl CommandRouterBuilder {
    /// Registers a command open to every user.
    pub fn command(self, name: impl Into<String>, handler: impl StepHandler) -> Self {
        self.command_with_level(name, 0, handler)
    }

    /// Registers a command that requires at least `min_level`.
    pub fn command_with_level(
        mut self,
        name: impl Into<String>,
        min_level: u32,
        handler: impl StepHandler,
    ) -> Self {
        self.commands.insert(
            name.into(),
            CommandEntry {
                handler: into_step_handler(handler),
                min_level,
                global: false,
            },
        );
        self
    }

    /// Registers a command that also runs while a conversation is active.
    ///
    /// The handler sees the session's state and context, and its step is
    /// applied to that session: `Step::complete()` ends the conversation.
    pub fn global_command(mut self, name: impl Into<String>, handler: impl StepHandler) -> Self {
        self.commands.insert(
            name.into(),
            CommandEntry {
                handler: into_step_handler(handler),
                min_level: 0,
                global: true,
            },
        );
        self
    }

    /// Handles input that matches nothing else.
    pub fn fallback(mut self, handler: impl StepHandler) -> Self {
        self.fallback = Some(into_step_handler(handler));
        self
    }

    /// Sets the provider of user levels (default: everybody at level 0).
    pub fn user_levels(mut self, levels: Arc<dyn UserLevelProvider>) -> Self {
        self.levels = levels;
        self
    }

    /// Builds the router.
    pub fn build(self) -> CommandRouter {
        CommandRouter {
            inner: Arc::new(RouterInner {
                engine: self.engine,
                commands: self.commands,
                fallback: self.fallback,
                levels: self.levels,
                locks: KeyedMutex::new(),
            }),
        }
    }
}

/// Maps events onto commands or the conversation engine.
///
/// Turns of the same user are serialized; different users run in parallel.
/// Cloning is cheap.
#[derive(Clone)]
pub struct CommandRouter {
    inner: Arc<RouterInner>,
}

impl CommandRouter {
    /// Starts building a router around an engine.
    pub fn builder(engine: ConversationEngine) -> CommandRouterBuilder {
        CommandRouterBuilder {
            engine,
            commands: HashMap::new(),
            fallback: None,
            levels: Arc::new(UniformLevel::default()),
        }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &ConversationEngine {
        &self.inner.engine
    }

    /// Names of the registered commands.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.inner.commands.keys().map(String::as_str)
    }

    /// Runs one turn for the sender of `event`.
    ///
    /// # Errors
    ///
    /// Store failures propagate; the sender's prior session stays in place.
    pub async fn route(&self, event: Event) -> EngineResult<RouteOutcome> {
        let inner = &self.inner;
        let user_id = event.user_id;
        let chat_id = event.chat_id;

        let _guard = inner.locks.lock(user_id).await;
        trace!(user_id, event_id = event.event_id, "Acquired user lock");

        let session = inner.engine.store().get(user_id).await?;
        let level = inner.levels.user_level(user_id);

        let command = event
            .plain_text()
            .and_then(parse_command)
            .filter(|name| match inner.commands.get(*name) {
                Some(entry) => session.is_none() || entry.global,
                None => false,
            })
            .map(str::to_owned);

        if let Some(name) = command {
            let entry = &inner.commands[&name];
            let step = if level < entry.min_level {
                debug!(user_id, command = %name, level, required = entry.min_level, "Insufficient level");
                Step::reject(format!(
                    "You are not allowed to use /{name} (level {} required).",
                    entry.min_level
                ))
            } else {
                debug!(user_id, command = %name, "Running command");
                (entry.handler)(command_turn(event, session.as_ref(), level)).await
            };
            let turn = inner.engine.apply(user_id, chat_id, session, step).await?;
            return Ok(RouteOutcome {
                route: Route::Command(name),
                turn,
            });
        }

        if let Some(session) = session {
            let turn = inner.engine.handle(event, Some(session), level).await?;
            return Ok(RouteOutcome {
                route: Route::Conversation,
                turn,
            });
        }

        if inner.engine.has_entry() {
            let turn = inner.engine.handle(event, None, level).await?;
            return Ok(RouteOutcome {
                route: Route::Entry,
                turn,
            });
        }

        if let Some(fallback) = &inner.fallback {
            let step = fallback(command_turn(event, None, level)).await;
            let turn = inner.engine.apply(user_id, chat_id, None, step).await?;
            return Ok(RouteOutcome {
                route: Route::Fallback,
                turn,
            });
        }

        debug!(user_id, event_id = event.event_id, "No route, dropping event");
        Ok(RouteOutcome {
            route: Route::Dropped,
            turn: TurnOutcome::ignored(None),
        })
    }
}

fn command_turn(event: Event, session: Option<&UserSession>, level: u32) -> Turn {
    Turn {
        event,
        state: session.map(|s| s.state.clone()),
        context: session.map(|s| s.context.clone()).unwrap_or_default(),
        level,
    }
}

impl Service<Event> for CommandRouter {
    type Response = RouteOutcome;
    type Error = EngineError;
    type Future = BoxFuture<'static, Result<RouteOutcome, EngineError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Event) -> Self::Future {
        let router = self.clone();
        async move { router.route(event).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{ContextData, MemorySessionStore, SessionStore};
    use tower::ServiceExt;

    use super::*;
    use crate::conversation::TurnKind;

    struct Admins;

    impl UserLevelProvider for Admins {
        fn user_level(&self, user_id: UserId) -> u32 {
            if user_id == 1 { 10 } else { 0 }
        }
    }

    fn registration_router(store: Arc<MemorySessionStore>) -> CommandRouter {
        let engine = ConversationEngine::builder()
            .state("AWAITING_NAME", |turn: Turn| async move {
                let name = turn.text().trim().to_owned();
                Step::complete().reply(format!("Nice to meet you, {name}!"))
            })
            .build(store);

        CommandRouter::builder(engine)
            .command("start", |_turn: Turn| async {
                Step::goto("AWAITING_NAME", ContextData::new()).reply("What is your name?")
            })
            .command_with_level("stats", 5, |_turn: Turn| async {
                Step::stay().reply("42 users")
            })
            .user_levels(Arc::new(Admins))
            .build()
    }

    #[tokio::test]
    async fn test_registration_flow() {
        let store = Arc::new(MemorySessionStore::new());
        let router = registration_router(store.clone());

        let out = router.route(Event::text(1, 7, "/start")).await.unwrap();
        assert_eq!(out.route, Route::Command("start".into()));
        assert_eq!(out.action().unwrap().text, "What is your name?");
        let session = store.get(7).await.unwrap().unwrap();
        assert_eq!(session.state, "AWAITING_NAME");
        assert!(session.context.is_empty());

        let out = router.route(Event::text(2, 7, "Alice")).await.unwrap();
        assert_eq!(out.route, Route::Conversation);
        assert_eq!(out.turn.kind, TurnKind::Completed);
        assert_eq!(out.action().unwrap().text, "Nice to meet you, Alice!");
        assert!(store.get(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_global_command_ends_conversation() {
        let store = Arc::new(MemorySessionStore::new());
        let engine = ConversationEngine::builder()
            .state("AWAITING_NAME", |turn: Turn| async move {
                if turn.text().starts_with('/') {
                    return Step::reject("Please send your name as plain text.");
                }
                Step::complete()
            })
            .build(store.clone());
        let router = CommandRouter::builder(engine)
            .command("start", |_turn: Turn| async {
                Step::goto("AWAITING_NAME", ContextData::new()).reply("What is your name?")
            })
            .global_command("cancel", |turn: Turn| async move {
                match turn.state {
                    Some(state) => Step::complete().reply(format!("Cancelled {state}.")),
                    None => Step::stay().reply("Nothing to cancel."),
                }
            })
            .build();

        let out = router.route(Event::text(1, 7, "/cancel")).await.unwrap();
        assert_eq!(out.action().unwrap().text, "Nothing to cancel.");
        assert!(store.get(7).await.unwrap().is_none());

        router.route(Event::text(2, 7, "/start")).await.unwrap();

        // Plain commands do not interrupt the conversation.
        let out = router.route(Event::text(3, 7, "/start")).await.unwrap();
        assert_eq!(out.route, Route::Conversation);
        assert_eq!(out.turn.kind, TurnKind::Rejected);

        let out = router.route(Event::text(4, 7, "/cancel")).await.unwrap();
        assert_eq!(out.route, Route::Command("cancel".into()));
        assert_eq!(out.turn.kind, TurnKind::Completed);
        assert_eq!(out.action().unwrap().text, "Cancelled AWAITING_NAME.");
        assert!(store.get(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_level_gate() {
        let store = Arc::new(MemorySessionStore::new());
        let router = registration_router(store);

        let denied = router.route(Event::text(1, 2, "/stats")).await.unwrap();
        assert_eq!(denied.turn.kind, TurnKind::Rejected);
        assert!(denied.action().unwrap().is_error());

        let allowed = router.route(Event::text(2, 1, "/stats")).await.unwrap();
        assert_eq!(allowed.action().unwrap().text, "42 users");
    }

    #[tokio::test]
    async fn test_unmatched_without_fallback_is_dropped() {
        let store = Arc::new(MemorySessionStore::new());
        let router = registration_router(store.clone());

        let out = router.route(Event::text(1, 7, "hello")).await.unwrap();
        assert_eq!(out.route, Route::Dropped);
        assert!(out.action().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_and_mention_suffix() {
        let store = Arc::new(MemorySessionStore::new());
        let engine = ConversationEngine::builder().build(store);
        let router = CommandRouter::builder(engine)
            .command("ping", |_turn: Turn| async { Step::stay().reply("pong") })
            .fallback(|turn: Turn| async move {
                Step::stay().reply(format!("unknown: {}", turn.text()))
            })
            .build();

        let out = router.route(Event::text(1, 7, "/ping@courier_bot")).await.unwrap();
        assert_eq!(out.action().unwrap().text, "pong");

        let out = router.route(Event::text(2, 7, "/PING")).await.unwrap();
        assert_eq!(out.route, Route::Fallback);
        assert_eq!(out.action().unwrap().text, "unknown: /PING");
    }

    #[tokio::test]
    async fn test_router_as_tower_service() {
        let store = Arc::new(MemorySessionStore::new());
        let router = registration_router(store);
        let out = router
            .oneshot(Event::text(1, 7, "/start"))
            .await
            .unwrap();
        assert_eq!(out.route, Route::Command("start".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_user_turns_are_serialized() {
        let store = Arc::new(MemorySessionStore::new());
        let engine = ConversationEngine::builder()
            .entry(|turn: Turn| async move {
                Step::goto("COUNTING", turn.context_with("n", 1))
            })
            .state("COUNTING", |turn: Turn| async move {
                let n = turn.get::<u64>("n").unwrap_or_default();
                tokio::task::yield_now().await;
                Step::stay_with(turn.context_with("n", n + 1))
            })
            .build(store.clone());
        let router = CommandRouter::builder(engine).build();

        let mut tasks = Vec::new();
        for id in 0..50 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                router.route(Event::text(id, 9, "tick")).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let session = store.get(9).await.unwrap().unwrap();
        assert_eq!(session.context.get("n"), Some(&serde_json::json!(50)));
    }
}
