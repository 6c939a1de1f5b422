//! Rate-limited, retrying delivery of outbound actions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use courier_core::{BoxedPlatformClient, OutboundAction, PlatformResponse, SendError};

use crate::error::{DeliveryError, DeliveryResult};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;

/// Sends actions through the shared [`RateLimiter`] and the platform client.
///
/// Every attempt, including retries, takes its own limiter slot. Transient
/// failures are retried with exponential backoff. Platform throttling waits
/// the full `retry_after`, unless it exceeds the policy's `max_delay`, in
/// which case the delivery fails as rate limited. Permanent and systemic
/// failures return at once.
#[derive(Clone)]
pub struct OutboundSender {
    limiter: Arc<RateLimiter>,
    client: BoxedPlatformClient,
    retry: RetryPolicy,
    acquire_timeout: Duration,
}

impl OutboundSender {
    /// Creates a sender.
    pub fn new(limiter: Arc<RateLimiter>, client: BoxedPlatformClient) -> Self {
        Self {
            limiter,
            client,
            retry: RetryPolicy::default(),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how long one attempt may wait for the rate limiter.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Returns the shared limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Delivers one action.
    pub async fn send(&self, action: &OutboundAction) -> DeliveryResult<PlatformResponse> {
        let mut retries = 0u32;
        loop {
            self.limiter
                .acquire(Some(action.chat_id), self.acquire_timeout)
                .await?;

            let err = match self.client.send(action).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let wait = match &err {
                SendError::Transient(_) => self.retry.delay_for(retries + 1),
                SendError::RateLimited { retry_after } if self.retry.tolerates(*retry_after) => {
                    *retry_after
                }
                SendError::RateLimited { retry_after } => {
                    warn!(chat_id = action.chat_id, retry_after = ?retry_after, "Throttled beyond the retry cap, giving up");
                    return Err(DeliveryError::Rejected {
                        source: err,
                        attempts: retries + 1,
                    });
                }
                SendError::Permanent(_) | SendError::Unauthorized(_) => {
                    return Err(DeliveryError::Rejected {
                        source: err,
                        attempts: retries + 1,
                    });
                }
            };

            if !self.retry.allows(retries) {
                warn!(chat_id = action.chat_id, attempts = retries + 1, error = %err, "Giving up on delivery");
                return Err(DeliveryError::Rejected {
                    source: err,
                    attempts: retries + 1,
                });
            }

            retries += 1;
            debug!(chat_id = action.chat_id, retry = retries, delay = ?wait, error = %err, "Retrying delivery");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use courier_core::{FailureClass, PlatformClient};

    use super::*;
    use crate::ratelimit::RateLimitConfig;

    /// Records sends and replays scripted failures.
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        pub(crate) sent: Mutex<Vec<OutboundAction>>,
        pub(crate) script: Mutex<VecDeque<SendError>>,
    }

    #[async_trait]
    impl PlatformClient for ScriptedClient {
        async fn send(&self, action: &OutboundAction) -> Result<PlatformResponse, SendError> {
            if let Some(err) = self.script.lock().pop_front() {
                return Err(err);
            }
            let mut sent = self.sent.lock();
            sent.push(action.clone());
            Ok(PlatformResponse::message(sent.len() as i64))
        }
    }

    pub(crate) fn fast_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig::global(10_000.0, 10_000)))
    }

    fn sender(client: Arc<ScriptedClient>, max_retries: u32) -> OutboundSender {
        OutboundSender::new(fast_limiter(), client).with_retry(RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_is_retried() {
        let client = Arc::new(ScriptedClient::default());
        client
            .script
            .lock()
            .extend([SendError::Transient("reset".into()), SendError::Transient("503".into())]);

        let response = sender(client.clone(), 3)
            .send(&OutboundAction::reply(1, "hi"))
            .await
            .unwrap();
        assert_eq!(response.message_id, Some(1));
        assert_eq!(client.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let client = Arc::new(ScriptedClient::default());
        client.script.lock().extend([
            SendError::Transient("a".into()),
            SendError::Transient("b".into()),
            SendError::Transient("c".into()),
        ]);

        let err = sender(client, 2)
            .send(&OutboundAction::reply(1, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { attempts: 3, .. }));
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_is_not_retried() {
        let client = Arc::new(ScriptedClient::default());
        client
            .script
            .lock()
            .push_back(SendError::Permanent("blocked".into()));

        let err = sender(client.clone(), 5)
            .send(&OutboundAction::reply(1, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { attempts: 1, .. }));
        assert_eq!(err.class(), FailureClass::Permanent);
        assert!(client.script.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_waits_retry_after() {
        let client = Arc::new(ScriptedClient::default());
        client.script.lock().push_back(SendError::RateLimited {
            retry_after: Duration::from_millis(700),
        });

        let start = tokio::time::Instant::now();
        sender(client, 1)
            .send(&OutboundAction::reply(1, "hi"))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_cap_fails_fast() {
        let client = Arc::new(ScriptedClient::default());
        client.script.lock().push_back(SendError::RateLimited {
            retry_after: Duration::from_secs(30),
        });

        let start = tokio::time::Instant::now();
        let err = sender(client.clone(), 3)
            .send(&OutboundAction::reply(1, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { attempts: 1, .. }));
        assert_eq!(err.class(), FailureClass::RateLimited);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(client.sent.lock().is_empty());
    }
}
