//! SQLite-backed [`TopicCache`].

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use courier_core::{ChatId, StoreResult, TopicCache, TopicId};

use crate::map_sqlx_error;

/// Topic bindings in a `courier_topics` table.
///
/// `(chat_id, name)` is the primary key and `(chat_id, topic_id)` is unique,
/// so each direction of the mapping has at most one row.
#[derive(Debug, Clone)]
pub struct SqliteTopicCache {
    pool: SqlitePool,
}

impl SqliteTopicCache {
    /// Wraps a pool. Call [`init`](Self::init) once before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the table if it does not exist.
    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS courier_topics (
                chat_id  INTEGER NOT NULL,
                name     TEXT    NOT NULL,
                topic_id INTEGER NOT NULL,
                PRIMARY KEY (chat_id, name),
                UNIQUE (chat_id, topic_id)
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl TopicCache for SqliteTopicCache {
    async fn save_topic_id(
        &self,
        chat_id: ChatId,
        name: &str,
        topic_id: TopicId,
    ) -> StoreResult<TopicId> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT topic_id FROM courier_topics WHERE chat_id = ? AND name = ?",
        )
        .bind(chat_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if let Some(existing) = existing {
            tx.commit().await.map_err(map_sqlx_error)?;
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

        // Drop a stale name still bound to this id (topic renamed).
        sqlx::query("DELETE FROM courier_topics WHERE chat_id = ? AND topic_id = ?")
            .bind(chat_id)
            .bind(topic_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query("INSERT INTO courier_topics (chat_id, name, topic_id) VALUES (?, ?, ?)")
            .bind(chat_id)
            .bind(name)
            .bind(topic_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(topic_id)
    }

    async fn get_topic_id(&self, chat_id: ChatId, name: &str) -> StoreResult<Option<TopicId>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT topic_id FROM courier_topics WHERE chat_id = ? AND name = ?",
        )
        .bind(chat_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn get_topic_name(
        &self,
        chat_id: ChatId,
        topic_id: TopicId,
    ) -> StoreResult<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT name FROM courier_topics WHERE chat_id = ? AND topic_id = ?",
        )
        .bind(chat_id)
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn evict_by_name(&self, chat_id: ChatId, name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM courier_topics WHERE chat_id = ? AND name = ?")
            .bind(chat_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn evict_by_id(&self, chat_id: ChatId, topic_id: TopicId) -> StoreResult<()> {
        sqlx::query("DELETE FROM courier_topics WHERE chat_id = ? AND topic_id = ?")
            .bind(chat_id)
            .bind(topic_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool;

    async fn cache() -> SqliteTopicCache {
        let cache = SqliteTopicCache::new(memory_pool().await);
        cache.init().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_save_lookup_and_evict_by_id() {
        let cache = cache().await;
        assert_eq!(cache.save_topic_id(-100, "general", 42).await.unwrap(), 42);
        assert_eq!(cache.get_topic_id(-100, "general").await.unwrap(), Some(42));
        assert_eq!(
            cache.get_topic_name(-100, 42).await.unwrap().as_deref(),
            Some("general")
        );

        cache.evict_by_id(-100, 42).await.unwrap();
        assert_eq!(cache.get_topic_id(-100, "general").await.unwrap(), None);
        assert_eq!(cache.get_topic_name(-100, 42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_binding_wins() {
        let cache = cache().await;
        cache.save_topic_id(1, "news", 5).await.unwrap();
        assert_eq!(cache.save_topic_id(1, "news", 6).await.unwrap(), 5);
        assert_eq!(cache.get_topic_name(1, 6).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rename_replaces_old_name() {
        let cache = cache().await;
        cache.save_topic_id(1, "old", 9).await.unwrap();
        cache.save_topic_id(1, "new", 9).await.unwrap();
        assert_eq!(cache.get_topic_id(1, "old").await.unwrap(), None);
        assert_eq!(cache.get_topic_id(1, "new").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_evict_by_name_and_chat_isolation() {
        let cache = cache().await;
        cache.save_topic_id(1, "general", 1).await.unwrap();
        cache.save_topic_id(2, "general", 1).await.unwrap();

        cache.evict_by_name(1, "general").await.unwrap();
        assert_eq!(cache.get_topic_name(1, 1).await.unwrap(), None);
        assert_eq!(cache.get_topic_id(2, "general").await.unwrap(), Some(1));
    }
}
