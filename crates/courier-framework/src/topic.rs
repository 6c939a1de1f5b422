//! Get-or-create for forum topics.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use courier_core::{ChatId, TopicCache, TopicId};

use crate::error::TopicError;
use crate::keyed::KeyedMutex;

/// Resolves topic names to ids, creating each missing topic exactly once.
///
/// Concurrent callers asking for the same `(chat, name)` are serialized; the
/// first one runs the creator and the others read its result from the cache.
pub struct TopicResolver {
    cache: Arc<dyn TopicCache>,
    creating: KeyedMutex<(ChatId, String)>,
}

impl TopicResolver {
    /// Creates a resolver over a cache.
    pub fn new(cache: Arc<dyn TopicCache>) -> Self {
        Self {
            cache,
            creating: KeyedMutex::new(),
        }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &Arc<dyn TopicCache> {
        &self.cache
    }

    /// Returns the id of `name` in `chat_id`, calling `create` on a miss.
    ///
    /// A failed `create` caches nothing, so the next call tries again.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        chat_id: ChatId,
        name: &str,
        create: F,
    ) -> Result<TopicId, TopicError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TopicId, E>>,
    {
        if let Some(id) = self.cache.get_topic_id(chat_id, name).await? {
            return Ok(id);
        }

        let _guard = self.creating.lock((chat_id, name.to_owned())).await;
        if let Some(id) = self.cache.get_topic_id(chat_id, name).await? {
            return Ok(id);
        }

        let created = create().await.map_err(TopicError::Create)?;
        let id = self.cache.save_topic_id(chat_id, name, created).await?;
        debug!(chat_id, topic = name, topic_id = id, "Topic created");
        Ok(id)
    }
}
