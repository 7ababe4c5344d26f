//! Sync-Diff-Upsert-Notify engine: the generic pipeline every source adapter
//! feeds into.

use tdh_adapters::AdapterError;
use tdh_storage::StoreError;
use thiserror::Error;

pub mod aggregate;
pub mod compare;
pub mod config;
pub mod locks;
pub mod notify;
pub mod pipeline;
pub mod publish;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod tags;
pub mod upsert;

pub use aggregate::ResultAggregator;
pub use compare::{ChangeDetector, ChangeOutcome, CompareConfig};
pub use config::{ChannelConfig, SourceConfig, SourceRegistry, SyncConfig};
pub use locks::KeyedLocks;
pub use notify::{
    ChannelRegistry, DispatchError, DispatchRequest, HttpPushChannel, NotificationChannel,
    NotificationDispatcher, PushAck, PushMessage,
};
pub use pipeline::{BatchOutcome, CancelFlag, PipelineOptions, RunOptions, SyncPipeline};
pub use publish::{PublishRule, PublishedOnRules};
pub use retry::{RetryFailure, RetryPassSummary, RetryPolicy, RetryQueue, RetryQueueHandle, RetryWorker};
pub use service::{SourceRun, SyncRunSummary, SyncService};
pub use tags::{CatalogueSnapshot, TagReconciler};
pub use upsert::{
    CrudCondition, CrudConstraints, DeletePolicy, FeedKind, UpsertEngine, UpsertOutcome, WriteContext, WriteMode,
    WriteRules,
};

pub const CRATE_NAME: &str = "tdh-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation failed for {id}: {message}")]
    Validation { id: String, message: String },
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("tag catalogue unavailable: {0}")]
    Catalogue(#[source] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("write rejected for {id}: {reason}")]
    WriteRejected { id: String, reason: &'static str },
    #[error("retry worker stopped")]
    RetryWorkerStopped,
    #[error("retry queue not persisted: {0}")]
    RetryPersist(String),
}
