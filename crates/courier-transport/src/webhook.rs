//! Push-callback endpoint.
//!
//! The platform POSTs one event, or a JSON array of events, to the configured
//! path. The request is acknowledged as soon as the body parses; routing and
//! replies continue in a background task so slow handlers never make the
//! platform retry the delivery. Those tasks are tracked, and
//! [`WebhookHandle::stop`] waits for them.

use std::net::SocketAddr;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use courier_core::Event;
use courier_framework::Dispatcher;

use crate::error::{TransportError, TransportResult};

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "x-courier-secret";

/// Webhook listener settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Address to bind, e.g. `0.0.0.0:8443`.
    pub addr: String,
    /// Route the platform posts to.
    pub path: String,
    /// Expected value of [`SECRET_HEADER`]. `None` accepts any request.
    pub secret: Option<String>,
}

impl WebhookConfig {
    /// Creates settings without a secret.
    pub fn new(addr: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            path: path.into(),
            secret: None,
        }
    }

    /// Requires every request to carry `secret`.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

#[derive(Clone)]
struct WebhookState {
    dispatcher: Dispatcher,
    secret: Option<String>,
    tasks: TaskTracker,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    One(Event),
    Many(Vec<Event>),
}

impl Incoming {
    fn into_events(self) -> Vec<Event> {
        match self {
            Self::One(event) => vec![event],
            Self::Many(events) => events,
        }
    }
}

/// Builds the axum router serving `path`.
///
/// Dispatch of accepted events is spawned on `tasks`; close and wait on it
/// to drain them before shutting down.
pub fn webhook_router(
    dispatcher: Dispatcher,
    path: &str,
    secret: Option<String>,
    tasks: TaskTracker,
) -> Router {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    Router::new()
        .route(&path, post(webhook_handler))
        .with_state(WebhookState {
            dispatcher,
            secret,
            tasks,
        })
}

/// Handle to a running webhook listener.
#[derive(Debug)]
pub struct WebhookHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
    tasks: TaskTracker,
}

impl WebhookHandle {
    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting requests, then waits until every accepted event
    /// has been dispatched.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.server.await {
            error!(error = %e, "Webhook server task failed");
        }
        self.tasks.close();
        if !self.tasks.is_empty() {
            debug!(pending = self.tasks.len(), "Draining webhook dispatches");
        }
        self.tasks.wait().await;
    }
}

/// Binds `config.addr` and serves the webhook in a background task.
pub async fn serve_webhook(
    config: WebhookConfig,
    dispatcher: Dispatcher,
) -> TransportResult<WebhookHandle> {
    let tasks = TaskTracker::new();
    let router = webhook_router(dispatcher, &config.path, config.secret, tasks.clone());

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: config.addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, path = %config.path, "Webhook listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "Webhook server error");
        }
        info!("Webhook stopped");
    });

    Ok(WebhookHandle {
        local_addr,
        shutdown: shutdown_tx,
        server,
        tasks,
    })
}

async fn webhook_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(expected) = &state.secret {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            warn!("Rejected webhook request with a bad secret");
            return (StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let events = match serde_json::from_slice::<Incoming>(&body) {
        Ok(incoming) => incoming.into_events(),
        Err(e) => {
            debug!(error = %e, len = body.len(), "Malformed webhook body");
            return (StatusCode::BAD_REQUEST, "malformed body");
        }
    };

    debug!(count = events.len(), "Webhook events received");

    let dispatcher = state.dispatcher.clone();
    state.tasks.spawn(async move {
        dispatcher.dispatch_batch(events).await;
    });

    (StatusCode::OK, "ok")
}
