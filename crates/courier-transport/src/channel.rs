//! In-process ingestion over a Tokio channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use courier_core::{Batch, Event, EventId, IngestionSource, SourceError, SourceResult};

/// Producer half of a [`ChannelSource`].
pub type EventSender = mpsc::Sender<Event>;

/// An [`IngestionSource`] fed by an [`EventSender`].
///
/// Each poll waits up to `wait` for the first event, then drains whatever
/// else is already queued, up to the requested limit. Once every sender is
/// dropped and the queue is empty, polls return [`SourceError::Closed`].
///
/// Events are consumed on read, so the poll offset is ignored.
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<Event>>,
    wait: Duration,
}

impl ChannelSource {
    /// Creates a source with a bounded queue of `capacity` events.
    pub fn new(capacity: usize) -> (EventSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            rx: Mutex::new(rx),
            wait: Duration::from_secs(1),
        };
        (tx, source)
    }

    /// Sets how long a poll waits for the first event.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

#[async_trait]
impl IngestionSource for ChannelSource {
    async fn poll(&self, _offset: Option<EventId>, limit: usize) -> SourceResult<Batch> {
        let mut rx = self.rx.lock().await;

        let first = match tokio::time::timeout(self.wait, rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(SourceError::Closed),
            Err(_) => return Ok(Batch::default()),
        };

        let mut events = vec![first];
        while events.len() < limit.max(1) {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }

        trace!(count = events.len(), "Drained channel");
        Ok(Batch::new(events))
    }
}

impl std::fmt::Debug for ChannelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSource")
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_drains_up_to_limit() {
        let (tx, source) = ChannelSource::new(16);
        for id in 1..=5 {
            tx.send(Event::text(id, 1, "x")).await.unwrap();
        }

        let batch = source.poll(None, 3).await.unwrap();
        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.resolve_offset(None), Some(4));

        let batch = source.poll(Some(4), 10).await.unwrap();
        let ids: Vec<_> = batch.events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_times_out() {
        let (_tx, source) = ChannelSource::new(4);
        let source = source.with_wait(Duration::from_millis(50));
        let batch = source.poll(None, 10).await.unwrap();
        assert!(batch.events.is_empty());
    }

    #[tokio::test]
    async fn test_closed_after_senders_drop() {
        let (tx, source) = ChannelSource::new(4);
        tx.send(Event::text(1, 1, "last")).await.unwrap();
        drop(tx);

        assert_eq!(source.poll(None, 10).await.unwrap().events.len(), 1);
        assert!(matches!(source.poll(None, 10).await, Err(SourceError::Closed)));
    }
}
