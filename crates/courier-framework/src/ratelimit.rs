//! Outbound rate limiting.
//!
//! [`RateLimiter`] combines two gates:
//!
//! 1. a **global token bucket** refilling at `global_rate` tokens per second
//!    with room for `burst` tokens;
//! 2. a **per-chat minimum interval** between two sends to the same chat.
//!
//! Acquiring works by reservation: a caller claims the next free slot under a
//! short lock and then sleeps until the slot matures. Throughput therefore
//! never exceeds the configured ceiling no matter how many tasks call
//! [`acquire`](RateLimiter::acquire) at once, and waiting tasks never spin.
//!
//! One limiter is constructed at startup and shared (`Arc<RateLimiter>`)
//! between the dispatcher and the broadcast engine.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use courier_core::{ChatId, RateLimitError};

/// Idle per-chat entries are swept once the map grows past this size.
const CHAT_GATE_SWEEP_THRESHOLD: usize = 1024;

/// Rate limiter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained global sends per second.
    pub global_rate: f64,
    /// Bucket capacity: sends allowed back-to-back after an idle period.
    pub burst: u32,
    /// Minimum delay between two sends to the same chat.
    pub per_chat_interval: Duration,
    /// Maximum number of sends waiting on one chat's interval.
    pub per_chat_queue_depth: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Telegram publishes ~30 msg/s globally and ~1 msg/s per chat.
        Self {
            global_rate: 25.0,
            burst: 25,
            per_chat_interval: Duration::from_millis(1100),
            per_chat_queue_depth: 32,
        }
    }
}

impl RateLimitConfig {
    /// A config with only a global ceiling.
    pub fn global(rate: f64, burst: u32) -> Self {
        Self {
            global_rate: rate,
            burst,
            per_chat_interval: Duration::ZERO,
            per_chat_queue_depth: usize::MAX,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    /// May go negative: each negative unit is a pending reservation.
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct ChatGate {
    next_slot: Instant,
    waiting: usize,
}

/// Token-bucket limiter with a per-chat interval gate.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    chats: Mutex<HashMap<ChatId, ChatGate>>,
}

/// Releases a per-chat queue slot when dropped, including on cancellation.
struct WaitSlot<'a> {
    limiter: &'a RateLimiter,
    chat_id: ChatId,
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.limiter.chats.lock().get_mut(&self.chat_id) {
            gate.waiting = gate.waiting.saturating_sub(1);
        }
    }
}

impl RateLimiter {
    /// Creates a limiter with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst.max(1)),
                last_refill: Instant::now(),
            }),
            chats: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Returns the limiter configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits until a send is allowed.
    ///
    /// With `chat_id`, the per-chat interval applies as well. A `timeout` too
    /// large to represent as an instant, such as `Duration::MAX`, means no
    /// deadline. The future is cancel-safe: dropping it gives back its queue
    /// slot.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::Backpressure`] if the chat queue is full;
    /// - [`RateLimitError::DeadlineExceeded`] if no slot matures within
    ///   `timeout`.
    pub async fn acquire(
        &self,
        chat_id: Option<ChatId>,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        let deadline = Instant::now().checked_add(timeout);

        if let Some(chat_id) = chat_id
            && !self.config.per_chat_interval.is_zero()
        {
            let (slot, _guard) = self.reserve_chat_slot(chat_id, deadline, timeout)?;
            if slot > Instant::now() {
                trace!(chat_id, "Waiting for per-chat slot");
                sleep_until(slot).await;
            }
        }

        let ready_at = self.reserve_token(deadline, timeout)?;
        if ready_at > Instant::now() {
            trace!("Waiting for global token");
            sleep_until(ready_at).await;
        }
        Ok(())
    }

    /// Claims the next slot of a chat, or fails fast.
    fn reserve_chat_slot(
        &self,
        chat_id: ChatId,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> Result<(Instant, WaitSlot<'_>), RateLimitError> {
        let now = Instant::now();
        let mut chats = self.chats.lock();

        if chats.len() >= CHAT_GATE_SWEEP_THRESHOLD {
            chats.retain(|_, gate| gate.waiting > 0 || gate.next_slot > now);
        }

        let gate = chats.entry(chat_id).or_insert(ChatGate {
            next_slot: now,
            waiting: 0,
        });

        if gate.waiting >= self.config.per_chat_queue_depth {
            return Err(RateLimitError::Backpressure {
                chat_id,
                depth: self.config.per_chat_queue_depth,
            });
        }

        let slot = gate.next_slot.max(now);
        if deadline.is_some_and(|deadline| slot > deadline) {
            return Err(RateLimitError::DeadlineExceeded { timeout });
        }

        gate.next_slot = slot + self.config.per_chat_interval;
        gate.waiting += 1;
        drop(chats);

        Ok((
            slot,
            WaitSlot {
                limiter: self,
                chat_id,
            },
        ))
    }

    /// Takes one token and returns when it becomes usable.
    fn reserve_token(
        &self,
        deadline: Option<Instant>,
        timeout: Duration,
    ) -> Result<Instant, RateLimitError> {
        let now = Instant::now();
        let rate = self.config.global_rate;
        let mut bucket = self.bucket.lock();

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(f64::from(self.config.burst.max(1)));
        bucket.last_refill = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            return Ok(now);
        }

        let ready_at = Duration::try_from_secs_f64(-bucket.tokens / rate)
            .ok()
            .and_then(|wait| now.checked_add(wait));
        match ready_at {
            Some(ready_at) if deadline.is_none_or(|deadline| ready_at <= deadline) => Ok(ready_at),
            _ => {
                // Give the reservation back; nobody will use this slot.
                bucket.tokens += 1.0;
                Err(RateLimitError::DeadlineExceeded { timeout })
            }
        }
    }

    /// Returns the number of chats currently tracked by the per-chat gate.
    pub fn tracked_chats(&self) -> usize {
        self.chats.lock().len()
    }
}
