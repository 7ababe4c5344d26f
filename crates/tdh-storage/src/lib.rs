//! Persistence collaborators (document store, tag catalogue, raw store) and
//! HTTP utilities for TDH.

use std::path::PathBuf;

use thiserror::Error;

pub mod catalogue;
pub mod document;
pub mod http;
pub mod raw;

pub use catalogue::{InMemoryTagCatalogue, PgTagCatalogue, TagCatalogue};
pub use document::{DocumentStore, InMemoryDocumentStore, PgDocumentStore};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse, HttpClient,
    HttpClientConfig, RetryDisposition,
};
pub use raw::{FileRawStore, RawStore};

pub const CRATE_NAME: &str = "tdh-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("document (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("{0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub(crate) fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}
