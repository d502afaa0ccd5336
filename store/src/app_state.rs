//! Opaque app-state key/value records.

use chrono::Utc;
use ct_core::types::AppStateRecord;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::StoreResult;
use crate::time::{fmt_ts, parse_ts};

#[derive(Debug, Clone)]
pub struct AppState {
    pool: SqlitePool,
}

impl AppState {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<AppStateRecord>> {
        let row = sqlx::query("SELECT * FROM app_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let value: String = r.get("value");
            Ok(AppStateRecord {
                key: r.get("key"),
                value: serde_json::from_str(&value)?,
                updated_at: parse_ts("app_state", "updated_at", &r.get::<String, _>("updated_at"))?,
            })
        })
        .transpose()
    }

    pub async fn set(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO app_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value.to_string())
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM app_state WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
