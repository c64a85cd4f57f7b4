//! SQLite-backed implementation of the local store.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tether_engine::{record, IndexRange};

use super::Pool;
use crate::error::Result;
use crate::store::LocalStore;

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub record_id: String,
    pub body: String,
    /// Modification marker copied out of the body on write
    pub updated_at: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            record_id: row.try_get("record_id")?,
            body: row.try_get("body")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredRecord {
    /// Decode the JSON body.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::from_str(&self.body).map_err(|e| {
            tracing::warn!(record_id = %self.record_id, error = %e, "Stored body is not valid JSON");
            e.into()
        })
    }

    /// Whether the marker column lies in `range`. Rows without a marker never match.
    pub fn modified_in(&self, range: &IndexRange) -> bool {
        self.updated_at.is_some_and(|ts| range.contains(&Value::from(ts)))
    }
}

/// Local store persisted in a single `records` table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn fetch_collection(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT record_id, body, updated_at
            FROM records
            WHERE collection = ?1
            ORDER BY record_id
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        self.fetch_collection(collection)
            .await?
            .iter()
            .map(StoredRecord::to_value)
            .collect()
    }

    async fn get_by_key(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT record_id, body, updated_at
            FROM records
            WHERE collection = ?1 AND record_id = ?2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(StoredRecord::to_value).transpose()
    }

    async fn put(&self, collection: &str, value: &Value) -> Result<()> {
        let id = record::require_id(value)?;
        let body = serde_json::to_string(value)?;
        let updated_at = record::modified_at(value).map(|ts| ts as i64);

        sqlx::query(
            r#"
            INSERT INTO records (collection, record_id, body, updated_at, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (collection, record_id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .bind(updated_at)
        .bind(crate::now_millis() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?1 AND record_id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_by_index(
        &self,
        collection: &str,
        index: &str,
        range: &IndexRange,
    ) -> Result<Vec<Value>> {
        // The marker has its own column; only matching bodies get decoded.
        if index == record::MODIFIED_FIELD {
            return self
                .fetch_collection(collection)
                .await?
                .iter()
                .filter(|row| row.modified_in(range))
                .map(StoredRecord::to_value)
                .collect();
        }

        // Other index paths are arbitrary JSON paths, so filtering happens after decode.
        let records = self.get_all(collection).await?;
        Ok(records
            .into_iter()
            .filter(|r| record::index_value(r, index).is_some_and(|v| range.contains(v)))
            .collect())
    }

    async fn clear(&self, collection: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?1")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT collection FROM records ORDER BY collection")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("collection").map_err(Into::into))
            .collect()
    }
}
