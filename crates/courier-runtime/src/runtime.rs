//! Runtime wiring and lifecycle.
//!
//! The runtime owns one [`RateLimiter`] shared by the dispatcher and every
//! broadcast job, so replies and mass sends draw from the same budget.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use courier_runtime::CourierRuntime;
//!
//! let runtime = CourierRuntime::builder()
//!     .platform_client(client)
//!     .command("start", start)
//!     .state("AWAITING_NAME", awaiting_name)
//!     .build()
//!     .await?;
//!
//! runtime.run(source).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::{
    BoxedPlatformClient, IngestionSource, MemorySessionStore, SessionStore, TargetProvider,
    UserLevelProvider,
};
use courier_framework::{
    BoxedStepHandler, BroadcastEngine, BroadcastHandle, CommandRouter, ConversationEngine,
    ConversationEngineBuilder, Dispatcher, OutboundSender, RateLimiter, StepHandler, Turn,
    WriteMode, into_step_handler,
};

use crate::config::{
    ConfigLoader, CourierConfig, SessionBackend, SessionsConfig, validate_config,
};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// A wired Courier instance.
pub struct CourierRuntime {
    config: CourierConfig,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn SessionStore>,
    dispatcher: Dispatcher,
    broadcasts: BroadcastEngine,
    shutdown: CancellationToken,
}

impl CourierRuntime {
    /// Creates a runtime builder.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// The shared outbound rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The session backend.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// The event dispatcher, for push-style ingestion.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The broadcast engine.
    pub fn broadcasts(&self) -> &BroadcastEngine {
        &self.broadcasts
    }

    /// Starts a broadcast of `text` to every recipient of `targets`.
    pub fn broadcast(&self, targets: impl TargetProvider, text: impl Into<String>) -> BroadcastHandle {
        self.broadcasts.launch(targets, text)
    }

    /// Cancelling this token stops a running [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Polls `source` until Ctrl+C, SIGTERM or the source closes.
    pub async fn run(&self, source: Arc<dyn IngestionSource>) -> RuntimeResult<()> {
        info!("Courier runtime is now running. Press Ctrl+C to stop.");
        self.drive(Some(source), wait_for_shutdown()).await
    }

    /// Polls `source` until `shutdown` completes or the source closes.
    pub async fn run_until<F>(&self, source: Arc<dyn IngestionSource>, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.drive(Some(source), shutdown).await
    }

    /// Serves the configured webhook until Ctrl+C or SIGTERM.
    #[cfg(feature = "webhook")]
    pub async fn serve(&self) -> RuntimeResult<()> {
        self.drive(None, wait_for_shutdown()).await
    }

    async fn drive<F>(&self, source: Option<Arc<dyn IngestionSource>>, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        let token = self.shutdown.clone();
        let cleanup = self.spawn_cleanup(token.clone());

        #[cfg(feature = "webhook")]
        let webhook = match &self.config.webhook {
            Some(settings) => {
                let mut config =
                    courier_transport::WebhookConfig::new(settings.addr(), settings.path.clone());
                config.secret.clone_from(&settings.secret);
                Some(courier_transport::serve_webhook(config, self.dispatcher.clone()).await?)
            }
            None => None,
        };

        let polling = async {
            match source {
                Some(source) => self.dispatcher.run_polling(source, token.clone()).await,
                None => token.cancelled().await,
            }
        };

        tokio::pin!(polling);

        // Polling stops between batches, so a turn that already ran still
        // gets its reply delivered or queued for replay.
        tokio::select! {
            _ = &mut polling => {}
            _ = shutdown => {
                info!("Shutdown requested, finishing in-flight events");
                token.cancel();
                polling.await;
            }
        }

        info!("Stopping Courier runtime");
        token.cancel();

        #[cfg(feature = "webhook")]
        if let Some(handle) = webhook {
            handle.stop().await;
        }

        if let Some(cleanup) = cleanup
            && let Err(e) = cleanup.await
        {
            error!(error = %e, "Session cleanup task failed");
        }

        let pending = self.dispatcher.take_failed();
        if !pending.is_empty() {
            warn!(count = pending.len(), "Events left in the replay queue at shutdown");
            for failed in &pending {
                debug!(event_id = failed.event.event_id, reason = %failed.reason, "Unreplayed event");
            }
        }

        info!("Runtime stopped");
        Ok(())
    }

    fn spawn_cleanup(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let sessions = &self.config.sessions;
        if sessions.cleanup_interval().is_zero() {
            return None;
        }
        Some(tokio::spawn(run_session_cleanup(
            self.store.clone(),
            sessions.timeout(),
            sessions.cleanup_interval(),
            token,
        )))
    }
}

impl std::fmt::Debug for CourierRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierRuntime")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Sweeps expired sessions every `interval` until `token` is cancelled.
pub async fn run_session_cleanup(
    store: Arc<dyn SessionStore>,
    timeout: Duration,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match store.cleanup_expired(timeout).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Expired sessions removed"),
            Err(e) => warn!(error = %e, "Session cleanup failed"),
        }
    }
}

/// Waits for shutdown signals (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Cannot listen for Ctrl+C, shutting down"),
    }
}

/// Opens the configured session backend.
pub async fn open_session_store(config: &SessionsConfig) -> RuntimeResult<Arc<dyn SessionStore>> {
    match &config.backend {
        SessionBackend::Memory => Ok(Arc::new(MemorySessionStore::new())),
        #[cfg(feature = "sqlite")]
        SessionBackend::Sqlite { url } => {
            let pool = courier_storage::connect(url).await?;
            let store = courier_storage::SqliteSessionStore::new(pool);
            store.init().await?;
            info!(url = %url, "SQLite session store ready");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        SessionBackend::Sqlite { .. } => Err(crate::config::ConfigError::FeatureDisabled {
            setting: "sessions.backend = sqlite",
            feature: "sqlite",
        }
        .into()),
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

struct CommandEntry {
    name: String,
    min_level: u32,
    global: bool,
    handler: BoxedStepHandler,
}

/// Builder for [`CourierRuntime`].
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<CourierConfig>,
    init_logging: bool,
    client: Option<BoxedPlatformClient>,
    store: Option<Arc<dyn SessionStore>>,
    levels: Option<Arc<dyn UserLevelProvider>>,
    engine: ConversationEngineBuilder,
    commands: Vec<CommandEntry>,
    fallback: Option<BoxedStepHandler>,
}

impl RuntimeBuilder {
    /// Creates a new runtime builder.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            config: None,
            init_logging: true,
            client: None,
            store: None,
            levels: None,
            engine: ConversationEngine::builder(),
            commands: Vec::new(),
            fallback: None,
        }
    }

    // ---- configuration ----

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: CourierConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `config` as is, skipping files and environment.
    pub fn config(mut self, config: CourierConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    // ---- collaborators ----

    /// Sets the outbound platform client. Required.
    pub fn platform_client(mut self, client: BoxedPlatformClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Overrides the session backend chosen by configuration.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the provider of user levels.
    pub fn user_levels(mut self, levels: Arc<dyn UserLevelProvider>) -> Self {
        self.levels = Some(levels);
        self
    }

    // ---- handlers ----

    /// Registers the handler of a conversation state.
    pub fn state(mut self, name: impl Into<String>, handler: impl StepHandler) -> Self {
        self.engine = self.engine.state(name, handler);
        self
    }

    /// Registers the handler for users without a session.
    pub fn entry(mut self, handler: impl StepHandler) -> Self {
        self.engine = self.engine.entry(handler);
        self
    }

    /// Sets how the engine writes sessions.
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.engine = self.engine.write_mode(mode);
        self
    }

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
        self.commands.push(CommandEntry {
            name: name.into(),
            min_level,
            global: false,
            handler: into_step_handler(handler),
        });
        self
    }

    /// Registers a command that also interrupts active conversations,
    /// such as `/cancel`.
    pub fn global_command(mut self, name: impl Into<String>, handler: impl StepHandler) -> Self {
        self.commands.push(CommandEntry {
            name: name.into(),
            min_level: 0,
            global: true,
            handler: into_step_handler(handler),
        });
        self
    }

    /// Handles input that matches nothing else.
    pub fn fallback(mut self, handler: impl StepHandler) -> Self {
        self.fallback = Some(into_step_handler(handler));
        self
    }

    /// Loads configuration, opens the session backend and wires the engines.
    pub async fn build(self) -> RuntimeResult<CourierRuntime> {
        let config = match self.config {
            Some(config) => {
                validate_config(&config)?;
                config
            }
            None => self.config_loader.load()?,
        };

        if self.init_logging {
            logging::init_from_config(&config.logging);
        }

        let client = self.client.ok_or(RuntimeError::MissingPlatformClient)?;
        let store = match self.store {
            Some(store) => store,
            None => open_session_store(&config.sessions).await?,
        };

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.to_limiter_config()));
        let retry = config.retry.to_policy();
        let sender = OutboundSender::new(limiter.clone(), client)
            .with_retry(retry)
            .with_acquire_timeout(config.rate_limit.acquire_timeout());

        let engine = self.engine.build(store.clone());
        let mut router = CommandRouter::builder(engine);
        for entry in self.commands {
            let handler = entry.handler;
            let handler = move |turn: Turn| handler(turn);
            router = if entry.global {
                router.global_command(entry.name, handler)
            } else {
                router.command_with_level(entry.name, entry.min_level, handler)
            };
        }
        if let Some(fallback) = self.fallback {
            router = router.fallback(move |turn: Turn| fallback(turn));
        }
        if let Some(levels) = self.levels {
            router = router.user_levels(levels);
        }
        let router = router.build();

        let dispatcher = Dispatcher::new(
            router,
            sender.clone(),
            config.dispatcher.to_dispatcher_config(retry),
        );
        let broadcasts = BroadcastEngine::new(sender, config.broadcast.to_broadcast_config());

        info!(
            log_level = %config.logging.level,
            global_rate = config.rate_limit.global_rate,
            backend = ?config.sessions.backend,
            commands = dispatcher.router().commands().count(),
            "Runtime initialized from configuration"
        );

        Ok(CourierRuntime {
            config,
            limiter,
            store,
            dispatcher,
            broadcasts,
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use courier_core::{
        ContextData, Event, IterTargets, OutboundAction, PlatformClient, PlatformResponse,
        SendError, UserSession,
    };
    use courier_framework::{JobStatus, Step};
    use courier_transport::ChannelSource;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        delay: Duration,
        sent: Mutex<Vec<OutboundAction>>,
    }

    #[async_trait]
    impl PlatformClient for Recorder {
        async fn send(&self, action: &OutboundAction) -> Result<PlatformResponse, SendError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.sent.lock().await.push(action.clone());
            Ok(PlatformResponse::default())
        }
    }

    impl Recorder {
        async fn texts(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|a| a.text.clone()).collect()
        }
    }

    fn test_config() -> CourierConfig {
        let mut config = CourierConfig::default();
        config.rate_limit.global_rate = 10_000.0;
        config.rate_limit.burst = 10_000;
        config.rate_limit.per_chat_interval_ms = 0;
        config.sessions.cleanup_interval_secs = 0;
        config
    }

    async fn registration_runtime(client: Arc<Recorder>) -> CourierRuntime {
        CourierRuntime::builder()
            .config(test_config())
            .without_logging()
            .platform_client(client)
            .command("start", |_turn: Turn| async {
                Step::goto("AWAITING_NAME", ContextData::new()).reply("What is your name?")
            })
            .state("AWAITING_NAME", |turn: Turn| async move {
                Step::complete().reply(format!("Registered {}.", turn.text()))
            })
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_client() {
        let err = CourierRuntime::builder()
            .config(test_config())
            .without_logging()
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MissingPlatformClient));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = test_config();
        config.broadcast.concurrency = 0;
        let err = CourierRuntime::builder()
            .config(config)
            .without_logging()
            .platform_client(Arc::new(Recorder::default()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[tokio::test]
    async fn test_registration_flow_through_dispatcher() {
        let client = Arc::new(Recorder::default());
        let runtime = registration_runtime(client.clone()).await;

        runtime.dispatcher().dispatch(Event::text(1, 7, "/start")).await;
        let session = runtime.store().get(7).await.unwrap().unwrap();
        assert_eq!(session.state, "AWAITING_NAME");
        assert!(session.context.is_empty());

        runtime.dispatcher().dispatch(Event::text(2, 7, "Alice")).await;
        assert!(runtime.store().get(7).await.unwrap().is_none());
        assert_eq!(
            client.texts().await,
            vec!["What is your name?", "Registered Alice."]
        );
    }

    #[tokio::test]
    async fn test_run_until_source_closes() {
        let client = Arc::new(Recorder::default());
        let runtime = registration_runtime(client.clone()).await;

        let (tx, source) = ChannelSource::new(8);
        let source = source.with_wait(Duration::from_millis(20));
        tx.send(Event::text(1, 7, "/start")).await.unwrap();
        tx.send(Event::text(2, 7, "Bob")).await.unwrap();
        drop(tx);

        runtime
            .run_until(Arc::new(source), std::future::pending())
            .await
            .unwrap();

        assert_eq!(client.texts().await, vec!["What is your name?", "Registered Bob."]);
    }

    #[tokio::test]
    async fn test_run_until_shutdown_future() {
        let client = Arc::new(Recorder::default());
        let runtime = registration_runtime(client).await;
        let (_tx, source) = ChannelSource::new(8);
        let source = source.with_wait(Duration::from_millis(10));

        let stop = runtime.shutdown_token();
        tokio::time::timeout(
            Duration::from_secs(5),
            runtime.run_until(Arc::new(source), async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_finishes_in_flight_turn() {
        let client = Arc::new(Recorder {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let runtime = registration_runtime(client.clone()).await;

        let (tx, source) = ChannelSource::new(8);
        let source = source.with_wait(Duration::from_millis(10));
        tx.send(Event::text(1, 7, "/start")).await.unwrap();

        runtime
            .run_until(Arc::new(source), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await
            .unwrap();

        let session = runtime.store().get(7).await.unwrap().unwrap();
        assert_eq!(session.state, "AWAITING_NAME");
        assert_eq!(client.texts().await, vec!["What is your name?"]);
        assert!(runtime.dispatcher().take_failed().is_empty());
    }

    #[tokio::test]
    async fn test_global_cancel_through_runtime() {
        let client = Arc::new(Recorder::default());
        let runtime = CourierRuntime::builder()
            .config(test_config())
            .without_logging()
            .platform_client(client.clone())
            .command("start", |_turn: Turn| async {
                Step::goto("AWAITING_NAME", ContextData::new())
            })
            .global_command("cancel", |_turn: Turn| async { Step::complete().reply("Cancelled.") })
            .state("AWAITING_NAME", |_turn: Turn| async { Step::reject("Name, please.") })
            .build()
            .await
            .unwrap();

        runtime.dispatcher().dispatch(Event::text(1, 7, "/start")).await;
        assert!(runtime.store().get(7).await.unwrap().is_some());

        runtime.dispatcher().dispatch(Event::text(2, 7, "/cancel")).await;
        assert!(runtime.store().get(7).await.unwrap().is_none());
        assert_eq!(client.texts().await, vec!["Cancelled."]);
    }

    #[tokio::test]
    async fn test_broadcast_shares_runtime_sender() {
        let client = Arc::new(Recorder::default());
        let runtime = registration_runtime(client.clone()).await;

        let report = runtime
            .broadcast(IterTargets::new(1..=10), "maintenance at noon")
            .wait()
            .await;
        assert_eq!(report.sent, 10);
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(client.sent.lock().await.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_loop_sweeps_expired() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        store.save(&UserSession::new(1, "S").updated_at(0)).await.unwrap();
        store.save(&UserSession::new(2, "S")).await.unwrap();

        let token = CancellationToken::new();
        let task = tokio::spawn(run_session_cleanup(
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(store.get(1).await.unwrap().is_none());
        assert!(store.get(2).await.unwrap().is_some());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_backend_by_default() {
        let store = open_session_store(&SessionsConfig::default()).await.unwrap();
        assert!(store.get(1).await.unwrap().is_none());
    }
}
