//! Event dispatcher.
//!
//! The [`Dispatcher`] sits between an ingestion source and the
//! [`CommandRouter`]. Each event goes through the same pipeline:
//!
//! 1. dedup by `event_id` against a bounded window of recent ids
//! 2. route (retrying transient store failures)
//! 3. deliver the resulting action through the [`OutboundSender`]
//!
//! Batches are ordered by `event_id` and grouped by user. A user's events
//! run one after another; different users run concurrently, up to
//! `max_parallel_users` at once.
//!
//! # Failure handling
//!
//! | Failure | Dedup window | Replay queue |
//! |---|---|---|
//! | routing, after retries | id forgotten, a redelivery reruns the turn | queued |
//! | delivery, after retries | id kept, the session already moved on | queued |
//!
//! Failed events are available through [`Dispatcher::take_failed`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, span, warn};

use courier_core::{Event, FailureClass, IngestionSource, SourceError, UserId};

use crate::dedup::DedupWindow;
use crate::error::EngineResult;
use crate::outbound::OutboundSender;
use crate::retry::RetryPolicy;
use crate::router::{CommandRouter, Route, RouteOutcome};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of recent event ids remembered for deduplication.
    pub dedup_window: usize,
    /// Maximum events fetched per poll.
    pub batch_size: usize,
    /// Pause after an empty poll.
    pub poll_interval: Duration,
    /// Users processed concurrently within a batch.
    pub max_parallel_users: usize,
    /// Maximum failed events kept for replay; the oldest are dropped.
    pub replay_capacity: usize,
    /// Backoff for routing retries and source errors.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_window: 10_000,
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            max_parallel_users: 64,
            replay_capacity: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Routed, and its response (if any) delivered.
    Handled(Route),
    /// Already seen; skipped.
    Duplicate,
    /// Routing failed; the turn did not happen.
    RouteFailed,
    /// The turn happened but its response could not be delivered.
    DeliveryFailed,
}

/// An event kept for replay.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// The event.
    pub event: Event,
    /// Why it failed.
    pub reason: String,
    /// Failure class of the last error.
    pub class: FailureClass,
}

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Events routed successfully.
    pub handled: usize,
    /// Events skipped as duplicates.
    pub duplicates: usize,
    /// Events that failed routing or delivery.
    pub failed: usize,
}

impl BatchSummary {
    fn record(&mut self, status: &DispatchStatus) {
        match status {
            DispatchStatus::Handled(_) => self.handled += 1,
            DispatchStatus::Duplicate => self.duplicates += 1,
            DispatchStatus::RouteFailed | DispatchStatus::DeliveryFailed => self.failed += 1,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.handled += other.handled;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self
    }
}

struct DispatcherInner {
    router: CommandRouter,
    sender: OutboundSender,
    config: DispatcherConfig,
    dedup: Mutex<DedupWindow>,
    failed: Mutex<VecDeque<FailedEvent>>,
}

/// Pulls, deduplicates, routes and answers events.
///
/// Cloning is cheap; clones share the dedup window and replay queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(router: CommandRouter, sender: OutboundSender, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
                failed: Mutex::new(VecDeque::new()),
                router,
                sender,
                config,
            }),
        }
    }

    /// The router events are handed to.
    pub fn router(&self) -> &CommandRouter {
        &self.inner.router
    }

    /// The dispatcher settings.
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Processes one event.
    pub async fn dispatch(&self, event: Event) -> DispatchStatus {
        let span = span!(
            Level::DEBUG,
            "dispatch",
            event_id = event.event_id,
            user_id = event.user_id,
            kind = event.payload.kind()
        );
        self.dispatch_inner(event).instrument(span).await
    }

    async fn dispatch_inner(&self, event: Event) -> DispatchStatus {
        let event_id = event.event_id;
        if !self.inner.dedup.lock().insert(event_id) {
            debug!("Duplicate event, skipping");
            return DispatchStatus::Duplicate;
        }

        let mut outcome = match self.route_with_retry(&event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Routing failed, queued for replay");
                self.inner.dedup.lock().forget(event_id);
                self.push_failed(event, e.to_string(), e.class());
                return DispatchStatus::RouteFailed;
            }
        };

        if let Some(action) = outcome.take_action()
            && let Err(e) = self.inner.sender.send(&action).await
        {
            warn!(chat_id = action.chat_id, error = %e, "Delivery failed, queued for replay");
            self.push_failed(event, e.to_string(), e.class());
            return DispatchStatus::DeliveryFailed;
        }

        debug!(route = ?outcome.route, "Event handled");
        DispatchStatus::Handled(outcome.route)
    }

    async fn route_with_retry(&self, event: &Event) -> EngineResult<RouteOutcome> {
        let policy = &self.inner.config.retry;
        let mut retries = 0;
        loop {
            match self.inner.router.route(event.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.class().is_retryable() && policy.allows(retries) => {
                    retries += 1;
                    let delay = policy.delay_for(retries);
                    debug!(retry = retries, delay = ?delay, error = %e, "Retrying turn");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn push_failed(&self, event: Event, reason: String, class: FailureClass) {
        let mut failed = self.inner.failed.lock();
        if failed.len() >= self.inner.config.replay_capacity.max(1) {
            if let Some(dropped) = failed.pop_front() {
                warn!(event_id = dropped.event.event_id, "Replay queue full, dropping oldest");
            }
        }
        failed.push_back(FailedEvent {
            event,
            reason,
            class,
        });
    }

    /// Drains the replay queue.
    pub fn take_failed(&self) -> Vec<FailedEvent> {
        self.inner.failed.lock().drain(..).collect()
    }

    /// Processes a batch: ordered by `event_id`, sequential per user,
    /// concurrent across users.
    pub async fn dispatch_batch(&self, mut events: Vec<Event>) -> BatchSummary {
        events.sort_by_key(|e| e.event_id);

        let mut index: HashMap<UserId, usize> = HashMap::new();
        let mut groups: Vec<Vec<Event>> = Vec::new();
        for event in events {
            let slot = *index.entry(event.user_id).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(event);
        }

        futures::stream::iter(groups)
            .map(|group| async move {
                let mut summary = BatchSummary::default();
                for event in group {
                    summary.record(&self.dispatch(event).await);
                }
                summary
            })
            .buffer_unordered(self.inner.config.max_parallel_users.max(1))
            .fold(BatchSummary::default(), |acc, s| async move { acc.merge(s) })
            .await
    }

    /// Long-polls `source` until `shutdown` fires or the source closes.
    pub async fn run_polling(&self, source: Arc<dyn IngestionSource>, shutdown: CancellationToken) {
        let config = &self.inner.config;
        let mut offset = None;
        let mut errors = 0u32;
        info!(batch_size = config.batch_size, "Polling started");

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = source.poll(offset, config.batch_size) => polled,
            };

            let pause = match polled {
                Ok(batch) => {
                    errors = 0;
                    offset = batch.resolve_offset(offset);
                    if batch.events.is_empty() {
                        Some(config.poll_interval)
                    } else {
                        let count = batch.events.len();
                        let summary = self.dispatch_batch(batch.events).await;
                        debug!(
                            count,
                            handled = summary.handled,
                            duplicates = summary.duplicates,
                            failed = summary.failed,
                            "Batch dispatched"
                        );
                        None
                    }
                }
                Err(SourceError::Closed) => {
                    info!("Ingestion source closed");
                    break;
                }
                Err(e) => {
                    errors += 1;
                    let delay = config.retry.delay_for(errors);
                    warn!(error = %e, attempt = errors, delay = ?delay, "Poll failed, backing off");
                    Some(delay)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("Polling stopped");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("pending_replay", &self.inner.failed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use courier_core::{
        Batch, ContextData, MemorySessionStore, SendError, SessionStore,
        SourceResult, StoreError, StoreResult, UserSession,
    };

    use super::*;
    use crate::conversation::ConversationEngine;
    use crate::outbound::tests::{ScriptedClient, fast_limiter};
    use crate::step::{Step, Turn};

    fn no_retry() -> DispatcherConfig {
        DispatcherConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    fn echo_dispatcher(
        store: Arc<dyn SessionStore>,
        client: Arc<ScriptedClient>,
        config: DispatcherConfig,
    ) -> Dispatcher {
        let engine = ConversationEngine::builder()
            .state("AWAITING_NAME", |turn: Turn| async move {
                Step::complete().reply(format!("Hello, {}!", turn.text()))
            })
            .build(store);
        let router = CommandRouter::builder(engine)
            .command("start", |_turn: Turn| async {
                Step::goto("AWAITING_NAME", ContextData::new()).reply("Name?")
            })
            .fallback(|turn: Turn| async move { Step::stay().reply(turn.text().to_owned()) })
            .build();
        let sender = OutboundSender::new(fast_limiter(), client).with_retry(RetryPolicy::none());
        Dispatcher::new(router, sender, config)
    }

    fn sent_texts(client: &ScriptedClient) -> Vec<String> {
        client.sent.lock().iter().map(|a| a.text.clone()).collect()
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let client = Arc::new(ScriptedClient::default());
        let dispatcher =
            echo_dispatcher(Arc::new(MemorySessionStore::new()), client.clone(), no_retry());

        let first = dispatcher.dispatch(Event::text(1, 7, "hi")).await;
        let second = dispatcher.dispatch(Event::text(1, 7, "hi")).await;
        assert_eq!(first, DispatchStatus::Handled(Route::Fallback));
        assert_eq!(second, DispatchStatus::Duplicate);
        assert_eq!(sent_texts(&client), vec!["hi"]);
    }

    #[tokio::test]
    async fn test_end_to_end_registration() {
        let store = Arc::new(MemorySessionStore::new());
        let client = Arc::new(ScriptedClient::default());
        let dispatcher = echo_dispatcher(store.clone(), client.clone(), no_retry());

        dispatcher.dispatch(Event::text(1, 7, "/start")).await;
        let session = store.get(7).await.unwrap().unwrap();
        assert_eq!(session.state, "AWAITING_NAME");
        assert!(session.context.is_empty());

        dispatcher.dispatch(Event::text(2, 7, "Alice")).await;
        assert!(store.get(7).await.unwrap().is_none());
        assert_eq!(sent_texts(&client), vec!["Name?", "Hello, Alice!"]);
    }

    #[tokio::test]
    async fn test_batch_orders_each_user_by_event_id() {
        let store = Arc::new(MemorySessionStore::new());
        let client = Arc::new(ScriptedClient::default());
        let dispatcher = echo_dispatcher(store.clone(), client.clone(), no_retry());

        // Out of order and interleaved across two users.
        let summary = dispatcher
            .dispatch_batch(vec![
                Event::text(4, 7, "Bob"),
                Event::text(2, 8, "/start"),
                Event::text(3, 7, "/start"),
                Event::text(5, 8, "Carol"),
                Event::text(3, 7, "/start"),
            ])
            .await;

        assert_eq!(summary.handled, 4);
        assert_eq!(summary.duplicates, 1);
        assert!(store.is_empty());
        let texts = sent_texts(&client);
        assert!(texts.contains(&"Hello, Bob!".to_string()));
        assert!(texts.contains(&"Hello, Carol!".to_string()));
    }

    struct FlakyStore {
        inner: MemorySessionStore,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn save(&self, session: &UserSession) -> StoreResult<()> {
            self.inner.save(session).await
        }
        async fn get(&self, user_id: i64) -> StoreResult<Option<UserSession>> {
            let fail = {
                let mut failures = self.failures.lock();
                let fail = *failures > 0;
                *failures = failures.saturating_sub(1);
                fail
            };
            if fail {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.get(user_id).await
        }
        async fn delete(&self, user_id: i64) -> StoreResult<()> {
            self.inner.delete(user_id).await
        }
        async fn cleanup_expired(&self, timeout: Duration) -> StoreResult<u64> {
            self.inner.cleanup_expired(timeout).await
        }
        async fn save_if_unchanged(
            &self,
            session: &UserSession,
            expected: Option<u64>,
        ) -> StoreResult<bool> {
            self.inner.save_if_unchanged(session, expected).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_failure_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemorySessionStore::new(),
            failures: Mutex::new(2),
        });
        let client = Arc::new(ScriptedClient::default());
        let dispatcher = echo_dispatcher(store, client.clone(), DispatcherConfig::default());

        let status = dispatcher.dispatch(Event::text(1, 7, "hi")).await;
        assert_eq!(status, DispatchStatus::Handled(Route::Fallback));
        assert!(dispatcher.take_failed().is_empty());
    }

    #[tokio::test]
    async fn test_route_failure_forgets_id_and_queues_replay() {
        let store = Arc::new(FlakyStore {
            inner: MemorySessionStore::new(),
            failures: Mutex::new(1),
        });
        let client = Arc::new(ScriptedClient::default());
        let dispatcher = echo_dispatcher(store, client.clone(), no_retry());

        let status = dispatcher.dispatch(Event::text(1, 7, "hi")).await;
        assert_eq!(status, DispatchStatus::RouteFailed);

        let failed = dispatcher.take_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].class, FailureClass::Transient);

        // The redelivered event is processed this time.
        let status = dispatcher.dispatch(failed[0].event.clone()).await;
        assert_eq!(status, DispatchStatus::Handled(Route::Fallback));
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_id() {
        let client = Arc::new(ScriptedClient::default());
        client
            .script
            .lock()
            .push_back(SendError::Permanent("bot was blocked".into()));
        let dispatcher =
            echo_dispatcher(Arc::new(MemorySessionStore::new()), client, no_retry());

        let status = dispatcher.dispatch(Event::text(1, 7, "hi")).await;
        assert_eq!(status, DispatchStatus::DeliveryFailed);
        assert_eq!(dispatcher.take_failed()[0].class, FailureClass::Permanent);
        assert_eq!(
            dispatcher.dispatch(Event::text(1, 7, "hi")).await,
            DispatchStatus::Duplicate
        );
    }

    struct ScriptedSource {
        batches: Mutex<VecDeque<SourceResult<Batch>>>,
        offsets: Mutex<Vec<Option<u64>>>,
    }

    #[async_trait]
    impl IngestionSource for ScriptedSource {
        async fn poll(&self, offset: Option<u64>, _limit: usize) -> SourceResult<Batch> {
            self.offsets.lock().push(offset);
            self.batches
                .lock()
                .pop_front()
                .unwrap_or(Err(SourceError::Closed))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_advances_offset_and_survives_errors() {
        let client = Arc::new(ScriptedClient::default());
        let dispatcher =
            echo_dispatcher(Arc::new(MemorySessionStore::new()), client.clone(), no_retry());
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(VecDeque::from([
                Ok(Batch::new(vec![Event::text(10, 1, "a"), Event::text(11, 2, "b")])),
                Err(SourceError::Unavailable("timeout".into())),
                Ok(Batch::default()),
                Ok(Batch::new(vec![Event::text(12, 1, "c")])),
            ])),
            offsets: Mutex::new(Vec::new()),
        });

        dispatcher
            .run_polling(source.clone(), CancellationToken::new())
            .await;

        assert_eq!(
            *source.offsets.lock(),
            vec![None, Some(12), Some(12), Some(12), Some(13)]
        );
        let mut texts = sent_texts(&client);
        texts.sort();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_polling_stops_on_cancel() {
        let dispatcher = echo_dispatcher(
            Arc::new(MemorySessionStore::new()),
            Arc::new(ScriptedClient::default()),
            no_retry(),
        );
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(VecDeque::new()),
            offsets: Mutex::new(Vec::new()),
        });
        let token = CancellationToken::new();
        token.cancel();
        dispatcher.run_polling(source, token).await;
    }
}
