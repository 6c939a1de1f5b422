//! SQLite-backed [`SessionStore`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use courier_core::{SessionStore, StoreError, StoreResult, UserId, UserSession, now_ms};

use crate::map_sqlx_error;

#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: i64,
    state: String,
    context: String,
    updated_at: i64,
}

impl SessionRow {
    fn into_session(self) -> StoreResult<UserSession> {
        let context = serde_json::from_str(&self.context).map_err(|e| StoreError::Corrupt {
            user_id: self.user_id,
            reason: e.to_string(),
        })?;
        Ok(UserSession {
            user_id: self.user_id,
            state: self.state,
            context,
            updated_at: self.updated_at as u64,
        })
    }
}

fn encode_context(session: &UserSession) -> StoreResult<String> {
    serde_json::to_string(&session.context).map_err(|e| StoreError::Backend(e.to_string()))
}

/// Sessions in a `courier_sessions` table, one row per user.
///
/// Context is stored as JSON text. Timestamps are milliseconds since the
/// Unix epoch.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Wraps a pool. Call [`init`](Self::init) once before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the table if it does not exist.
    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS courier_sessions (
                user_id    INTEGER PRIMARY KEY,
                state      TEXT    NOT NULL,
                context    TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_courier_sessions_updated_at \
             ON courier_sessions (updated_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, session: &UserSession) -> StoreResult<()> {
        let result = sqlx::query(
            r#"INSERT INTO courier_sessions (user_id, state, context, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                 state = excluded.state,
                 context = excluded.context,
                 updated_at = excluded.updated_at
               WHERE excluded.updated_at >= courier_sessions.updated_at"#,
        )
        .bind(session.user_id)
        .bind(&session.state)
        .bind(encode_context(session)?)
        .bind(session.updated_at as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            debug!(user_id = session.user_id, "Ignoring stale session write");
        }
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> StoreResult<Option<UserSession>> {
        sqlx::query_as::<_, SessionRow>(
            "SELECT user_id, state, context, updated_at FROM courier_sessions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .map(SessionRow::into_session)
        .transpose()
    }

    async fn delete(&self, user_id: UserId) -> StoreResult<()> {
        sqlx::query("DELETE FROM courier_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn cleanup_expired(&self, timeout: Duration) -> StoreResult<u64> {
        // now - updated_at > timeout, as one statement so a row renewed
        // concurrently is judged on its new timestamp.
        let cutoff = now_ms().saturating_sub(timeout.as_millis() as u64) as i64;
        let result = sqlx::query("DELETE FROM courier_sessions WHERE updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn save_if_unchanged(
        &self,
        session: &UserSession,
        expected_updated_at: Option<u64>,
    ) -> StoreResult<bool> {
        let context = encode_context(session)?;
        let result = match expected_updated_at {
            None => {
                sqlx::query(
                    r#"INSERT INTO courier_sessions (user_id, state, context, updated_at)
                       VALUES (?, ?, ?, ?)
                       ON CONFLICT(user_id) DO NOTHING"#,
                )
                .bind(session.user_id)
                .bind(&session.state)
                .bind(context)
                .bind(session.updated_at as i64)
                .execute(&self.pool)
                .await
            }
            Some(expected) => {
                sqlx::query(
                    r#"UPDATE courier_sessions
                       SET state = ?, context = ?, updated_at = ?
                       WHERE user_id = ? AND updated_at = ?"#,
                )
                .bind(&session.state)
                .bind(context)
                .bind(session.updated_at as i64)
                .bind(session.user_id)
                .bind(expected as i64)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}
