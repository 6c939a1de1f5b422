//! Forum topic name↔id memoization.
//!
//! The cache supports get-or-create: callers look a topic up, and on a miss
//! create the remote topic and save its id exactly once. The cache never
//! creates remote resources itself, and cannot by itself prevent two callers
//! from racing to create the same topic. `TopicResolver` in
//! `courier-framework` adds the per-name serialization.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::StoreResult;
use crate::event::{ChatId, TopicId};

/// Bidirectional `(chat, name) ↔ (chat, id)` mapping.
///
/// Invariants:
/// - once a name is bound to an id, saving the same name with another id
///   keeps the first binding;
/// - evicting by name or by id removes both directions.
#[async_trait]
pub trait TopicCache: Send + Sync + 'static {
    /// Binds `name` to `topic_id` in `chat_id` and returns the authoritative id.
    ///
    /// If the name is already bound, the existing id is returned unchanged.
    async fn save_topic_id(
        &self,
        chat_id: ChatId,
        name: &str,
        topic_id: TopicId,
    ) -> StoreResult<TopicId>;

    /// Looks up the id bound to `name`.
    async fn get_topic_id(&self, chat_id: ChatId, name: &str) -> StoreResult<Option<TopicId>>;

    /// Looks up the name bound to `topic_id`.
    async fn get_topic_name(&self, chat_id: ChatId, topic_id: TopicId)
    -> StoreResult<Option<String>>;

    /// Removes the binding of `name`.
    async fn evict_by_name(&self, chat_id: ChatId, name: &str) -> StoreResult<()>;

    /// Removes the binding of `topic_id`.
    async fn evict_by_id(&self, chat_id: ChatId, topic_id: TopicId) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct TopicIndex {
    by_name: HashMap<(ChatId, String), TopicId>,
    by_id: HashMap<(ChatId, TopicId), String>,
}

/// Process-local [`TopicCache`]. Both indices live under one lock.
#[derive(Debug, Default)]
pub struct MemoryTopicCache {
    index: RwLock<TopicIndex>,
}

impl MemoryTopicCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bindings.
    pub fn len(&self) -> usize {
        self.index.read().by_name.len()
    }

    /// Returns `true` if the cache holds no binding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TopicCache for MemoryTopicCache {
    async fn save_topic_id(
        &self,
        chat_id: ChatId,
        name: &str,
        topic_id: TopicId,
    ) -> StoreResult<TopicId> {
        let mut index = self.index.write();
        let key = (chat_id, name.to_string());

        if let Some(&existing) = index.by_name.get(&key) {
            if existing != topic_id {
                warn!(
                    chat_id,
                    topic = name,
                    existing,
                    rejected = topic_id,
                    "Topic name already bound to another id, keeping the first binding"
                );
            }
            return Ok(existing);
        }

        // The id may have been bound to an older name (topic renamed).
        if let Some(old_name) = index.by_id.insert((chat_id, topic_id), name.to_string()) {
            index.by_name.remove(&(chat_id, old_name));
        }
        index.by_name.insert(key, topic_id);
        Ok(topic_id)
    }

    async fn get_topic_id(&self, chat_id: ChatId, name: &str) -> StoreResult<Option<TopicId>> {
        Ok(self
            .index
            .read()
            .by_name
            .get(&(chat_id, name.to_string()))
            .copied())
    }

    async fn get_topic_name(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
    ) -> StoreResult<Option<String>> {
        Ok(self.index.read().by_id.get(&(chat_id, topic_id)).cloned())
    }

    async fn evict_by_name(&self, chat_id: ChatId, name: &str) -> StoreResult<()> {
        let mut index = self.index.write();
        if let Some(id) = index.by_name.remove(&(chat_id, name.to_string())) {
            index.by_id.remove(&(chat_id, id));
        }
        Ok(())
    }

    async fn evict_by_id(&self, chat_id: ChatId, topic_id: TopicId) -> StoreResult<()> {
        let mut index = self.index.write();
        if let Some(name) = index.by_id.remove(&(chat_id, topic_id)) {
            index.by_name.remove(&(chat_id, name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_evict_by_id_clears_both_directions() {
        let cache = MemoryTopicCache::new();
        cache.save_topic_id(7, "general", 42).await.unwrap();
        assert_eq!(cache.get_topic_id(7, "general").await.unwrap(), Some(42));
        assert_eq!(
            cache.get_topic_name(7, 42).await.unwrap().as_deref(),
            Some("general")
        );

        cache.evict_by_id(7, 42).await.unwrap();

        assert_eq!(cache.get_topic_id(7, "general").await.unwrap(), None);
        assert_eq!(cache.get_topic_name(7, 42).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_evict_by_name_clears_reverse_index() {
        let cache = MemoryTopicCache::new();
        cache.save_topic_id(7, "general", 42).await.unwrap();
        cache.evict_by_name(7, "general").await.unwrap();
        assert_eq!(cache.get_topic_name(7, 42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_binding_wins() {
        let cache = MemoryTopicCache::new();
        assert_eq!(cache.save_topic_id(7, "general", 42).await.unwrap(), 42);
        assert_eq!(cache.save_topic_id(7, "general", 43).await.unwrap(), 42);
        assert_eq!(cache.get_topic_id(7, "general").await.unwrap(), Some(42));
        assert_eq!(cache.get_topic_name(7, 43).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_renamed_topic_drops_old_name() {
        let cache = MemoryTopicCache::new();
        cache.save_topic_id(7, "general", 42).await.unwrap();
        cache.save_topic_id(7, "lobby", 42).await.unwrap();

        assert_eq!(cache.get_topic_id(7, "general").await.unwrap(), None);
        assert_eq!(cache.get_topic_id(7, "lobby").await.unwrap(), Some(42));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_chats_are_isolated() {
        let cache = MemoryTopicCache::new();
        cache.save_topic_id(1, "general", 10).await.unwrap();
        cache.save_topic_id(2, "general", 20).await.unwrap();
        assert_eq!(cache.get_topic_id(1, "general").await.unwrap(), Some(10));
        assert_eq!(cache.get_topic_id(2, "general").await.unwrap(), Some(20));
    }
}
