//! Document store holding canonical records keyed by normalized id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tdh_core::CanonicalRecord;
use tokio::sync::RwLock;

use crate::{validate_table_name, StoreError};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, StoreError>;

    /// Batch read used to prefetch prior records once per batch.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<CanonicalRecord>, StoreError>;

    /// Single-row atomic insert-or-replace by `record.id`.
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), StoreError>;

    /// Returns `false` when no row existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn ids_by_source(&self, source: &str, record_type: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    rows: RwLock<BTreeMap<String, CanonicalRecord>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, StoreError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<CanonicalRecord>, StoreError> {
        let rows = self.rows.read().await;
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), StoreError> {
        self.rows
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.rows.write().await.remove(id).is_some())
    }

    async fn ids_by_source(&self, source: &str, record_type: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.source == source && r.record_type() == record_type)
            .map(|r| r.id.clone())
            .collect())
    }
}

/// Postgres JSONB table `(id text primary key, data jsonb, rawdataid text)`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    table: String,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Self::new(pool, table)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (id text PRIMARY KEY, data jsonb NOT NULL, rawdataid text)",
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<CanonicalRecord, StoreError> {
        let Json(record) = row.try_get::<Json<CanonicalRecord>, _>("data")?;
        Ok(record)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, StoreError> {
        let sql = format!("SELECT data FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<CanonicalRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT data FROM {} WHERE id = ANY($1)", self.table);
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, data, rawdataid) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, rawdataid = EXCLUDED.rawdataid",
            self.table
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(Json(record))
            .bind(record.raw_data_id.as_ref().map(|r| r.0.clone()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ids_by_source(&self, source: &str, record_type: &str) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            "SELECT id FROM {} WHERE data->>'Source' = $1 AND data->'_Meta'->>'Type' = $2",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(record_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips_by_id() {
        let store = InMemoryDocumentStore::new();
        let mut record = CanonicalRecord::new("A1", "lts", "poi");
        store.upsert(&record).await.expect("insert");

        record.active = false;
        store.upsert(&record).await.expect("update");

        let loaded = store.get("A1").await.expect("get").expect("present");
        assert!(!loaded.active);
        assert_eq!(store.len().await, 1);

        let many = store
            .get_many(&["A1".to_string(), "MISSING".to_string()])
            .await
            .expect("get_many");
        assert_eq!(many.len(), 1);

        assert_eq!(store.ids_by_source("lts", "poi").await.expect("ids"), vec!["A1"]);
        assert!(store.ids_by_source("lts", "event").await.expect("ids").is_empty());

        assert!(store.delete("A1").await.expect("delete"));
        assert!(!store.delete("A1").await.expect("second delete"));
        assert!(store.is_empty().await);
    }
}
