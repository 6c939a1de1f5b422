//! Event ingestion and broadcast target contracts.

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::SourceResult;
use crate::event::{ChatId, Event, EventId};

/// One batch returned by a long-poll.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Events in platform order.
    pub events: Vec<Event>,
    /// Offset to pass to the next poll. `None` lets the caller derive it
    /// from the highest event id seen.
    pub next_offset: Option<EventId>,
}

impl Batch {
    /// Creates a batch with no explicit next offset.
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            next_offset: None,
        }
    }

    /// Returns the offset the next poll should start from.
    pub fn resolve_offset(&self, current: Option<EventId>) -> Option<EventId> {
        self.next_offset.or_else(|| {
            self.events
                .iter()
                .map(|e| e.event_id + 1)
                .max()
                .max(current)
        })
    }
}

/// Pull-based producer of inbound events.
///
/// Sources are at-least-once: a batch may repeat events already returned by
/// an earlier poll. Deduplication is the dispatcher's job.
#[async_trait]
pub trait IngestionSource: Send + Sync + 'static {
    /// Fetches up to `limit` events starting at `offset`.
    async fn poll(&self, offset: Option<EventId>, limit: usize) -> SourceResult<Batch>;
}

/// Lazy, single-pass sequence of broadcast recipients.
///
/// A provider is consumed exactly once per broadcast; the engine pulls one id
/// at a time and never materializes the sequence.
#[async_trait]
pub trait TargetProvider: Send + 'static {
    /// Returns the next recipient, or `None` once the sequence is exhausted.
    async fn next_target(&mut self) -> Option<ChatId>;
}

/// [`TargetProvider`] over any iterator.
pub struct IterTargets<I> {
    iter: I,
}

impl<I> IterTargets<I>
where
    I: Iterator<Item = ChatId> + Send + 'static,
{
    /// Wraps an iterator.
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

#[async_trait]
impl<I> TargetProvider for IterTargets<I>
where
    I: Iterator<Item = ChatId> + Send + 'static,
{
    async fn next_target(&mut self) -> Option<ChatId> {
        self.iter.next()
    }
}

/// [`TargetProvider`] over an async stream, e.g. a paginated database cursor.
pub struct StreamTargets<S> {
    stream: S,
}

impl<S> StreamTargets<S>
where
    S: Stream<Item = ChatId> + Send + Unpin + 'static,
{
    /// Wraps a stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> TargetProvider for StreamTargets<S>
where
    S: Stream<Item = ChatId> + Send + Unpin + 'static,
{
    async fn next_target(&mut self) -> Option<ChatId> {
        self.stream.next().await
    }
}
