//! # Courier Transport
//!
//! Ways for inbound events to reach a [`Dispatcher`](courier_framework::Dispatcher).
//!
//! ## Features
//!
//! - (always): [`ChannelSource`], an in-process [`IngestionSource`](courier_core::IngestionSource)
//!   fed through a Tokio channel
//! - `webhook`: axum push endpoint that hands posted events to a dispatcher
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Platform / Producer│
//! ├─────────────────────┤
//! │  courier-transport  │  <- This crate (pull or push ingestion)
//! ├─────────────────────┤
//! │  Dispatcher         │  (courier-framework)
//! └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier_transport::webhook::{WebhookConfig, serve_webhook};
//!
//! let config = WebhookConfig::new("0.0.0.0:8443", "/updates").with_secret("s3cret");
//! let handle = serve_webhook(config, dispatcher.clone()).await?;
//! // ...
//! handle.stop().await;
//! ```

pub mod channel;
pub mod error;

#[cfg(feature = "webhook")]
pub mod webhook;

pub use channel::{ChannelSource, EventSender};
pub use error::{TransportError, TransportResult};

#[cfg(feature = "webhook")]
pub use webhook::{SECRET_HEADER, WebhookConfig, WebhookHandle, serve_webhook, webhook_router};
