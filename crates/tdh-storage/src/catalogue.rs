//! Tag catalogue lookups. One `load` call serves a whole batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tdh_core::CatalogueTag;
use tokio::sync::RwLock;

use crate::{validate_table_name, StoreError};

#[async_trait]
pub trait TagCatalogue: Send + Sync {
    /// Loads every tag whose id or `source.id` alias is in `ids`. Unknown ids
    /// are simply absent from the result.
    async fn load(&self, ids: &BTreeSet<String>) -> Result<Vec<CatalogueTag>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTagCatalogue {
    tags: RwLock<BTreeMap<String, CatalogueTag>>,
    load_calls: AtomicUsize,
}

impl InMemoryTagCatalogue {
    pub fn new(tags: impl IntoIterator<Item = CatalogueTag>) -> Self {
        Self {
            tags: RwLock::new(tags.into_iter().map(|t| (t.id.clone(), t)).collect()),
            load_calls: AtomicUsize::new(0),
        }
    }

    /// Number of `load` round-trips served so far.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TagCatalogue for InMemoryTagCatalogue {
    async fn load(&self, ids: &BTreeSet<String>) -> Result<Vec<CatalogueTag>, StoreError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .tags
            .read()
            .await
            .values()
            .filter(|t| ids.contains(&t.id) || ids.contains(&t.alias()))
            .cloned()
            .collect())
    }
}

/// Postgres JSONB tag table `(id text primary key, data jsonb)`.
#[derive(Debug, Clone)]
pub struct PgTagCatalogue {
    pool: PgPool,
    table: String,
}

impl PgTagCatalogue {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl TagCatalogue for PgTagCatalogue {
    async fn load(&self, ids: &BTreeSet<String>) -> Result<Vec<CatalogueTag>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.iter().cloned().collect::<Vec<_>>();
        let sql = format!(
            "SELECT data FROM {} WHERE id = ANY($1) OR (data->>'Source') || '.' || id = ANY($1)",
            self.table
        );
        let rows = sqlx::query(&sql).bind(&ids).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<CatalogueTag, StoreError> {
                let Json(tag) = row.try_get::<Json<CatalogueTag>, _>("data")?;
                Ok(tag)
            })
            .collect()
    }
}
