//! Scalar process state: named keys used as resumption checkpoints.

use chrono::Utc;
use keystone_core::ResearchPhase;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::parse_uuid;

pub const CURRENT_MILESTONE_KEY: &str = "current_milestone";
pub const RESEARCH_PHASE_KEY: &str = "research_phase";
pub const RESEARCH_CONTEXT_KEY: &str = "research_context";

#[derive(Clone)]
pub struct ProcessStateRepository {
    pool: SqlitePool,
}

impl ProcessStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        let value: Option<(String,)> =
            sqlx::query_as("SELECT value FROM process_state WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|(v,)| v))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, key, value).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM process_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Writes `value` only when `key` is unset. Returns whether it was written.
    pub async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            "INSERT INTO process_state (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn current_milestone(&self) -> Result<Option<Uuid>, DbError> {
        match self.get(CURRENT_MILESTONE_KEY).await? {
            Some(value) => Ok(Some(parse_uuid("process_state", "value", &value)?)),
            None => Ok(None),
        }
    }

    pub async fn research_phase(&self) -> Result<ResearchPhase, DbError> {
        match self.get(RESEARCH_PHASE_KEY).await? {
            Some(value) => ResearchPhase::parse(&value)
                .ok_or_else(|| DbError::corrupt("process_state", "value", value)),
            None => Ok(ResearchPhase::NotStarted),
        }
    }

    pub async fn set_research_phase(&self, phase: ResearchPhase) -> Result<(), DbError> {
        self.set(RESEARCH_PHASE_KEY, phase.as_str()).await
    }

    pub async fn load_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, DbError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn save_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), DbError> {
        let encoded = serde_json::to_string(value)?;
        self.set(key, &encoded).await
    }

    /// Every key and value, for diagnostics.
    pub async fn snapshot(&self) -> Result<Value, DbError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM process_state ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        Ok(Value::Object(
            rows.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        ))
    }
}

pub(crate) async fn upsert(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO process_state (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn remove(conn: &mut SqliteConnection, key: &str) -> Result<(), DbError> {
    sqlx::query("DELETE FROM process_state WHERE key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect;

    async fn setup() -> ProcessStateRepository {
        ProcessStateRepository::new(connect("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let repo = setup().await;
        assert_eq!(repo.get("k").await.unwrap(), None);

        repo.set("k", "v1").await.unwrap();
        repo.set("k", "v2").await.unwrap();
        assert_eq!(repo.get("k").await.unwrap().as_deref(), Some("v2"));

        assert!(repo.delete("k").await.unwrap());
        assert!(!repo.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let repo = setup().await;
        assert!(repo.set_if_absent("k", "first").await.unwrap());
        assert!(!repo.set_if_absent("k", "second").await.unwrap());
        assert_eq!(repo.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_research_phase_defaults_and_rejects_garbage() {
        let repo = setup().await;
        assert_eq!(repo.research_phase().await.unwrap(), ResearchPhase::NotStarted);

        repo.set_research_phase(ResearchPhase::Dispatching).await.unwrap();
        assert_eq!(repo.research_phase().await.unwrap(), ResearchPhase::Dispatching);

        repo.set(RESEARCH_PHASE_KEY, "daydreaming").await.unwrap();
        assert!(matches!(
            repo.research_phase().await,
            Err(DbError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_json_checkpoint() {
        let repo = setup().await;
        repo.save_json("ctx", &vec!["a", "b"]).await.unwrap();
        let loaded: Option<Vec<String>> = repo.load_json("ctx").await.unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string(), "b".to_string()]));

        let snapshot = repo.snapshot().await.unwrap();
        assert!(snapshot.get("ctx").is_some());
    }
}
