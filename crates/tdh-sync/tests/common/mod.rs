#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tdh_core::{CandidateRecord, CanonicalRecord, CatalogueTag};
use tdh_storage::{DocumentStore, InMemoryDocumentStore, InMemoryTagCatalogue};
pub use tdh_sync::notify::testing::{Behaviour, ScriptedChannel};
use tdh_sync::{
    ChannelRegistry, NotificationChannel, NotificationDispatcher, PipelineOptions, PublishRule, PublishedOnRules,
    RetryPolicy, RetryQueueHandle, RetryWorker, SyncPipeline,
};

pub const RECORD_TYPE: &str = "odhactivitypoi";
pub const SOURCE: &str = "suedtirolwein";

pub fn catalogue_tag(id: &str, name: &str) -> CatalogueTag {
    CatalogueTag {
        id: id.to_string(),
        source: "lts".to_string(),
        types: vec!["ltscategory".to_string()],
        tag_name: [("en".to_string(), name.to_string())].into(),
        tag_entry: None,
    }
}

pub fn candidate(id: &str, tags: &[&str]) -> CandidateRecord {
    let mut record = CanonicalRecord::new(id, SOURCE, RECORD_TYPE);
    record.tag_ids = tags.iter().map(|t| t.to_string()).collect();
    record
        .detail
        .insert("de".to_string(), serde_json::json!({ "Title": format!("Weingut {id}") }));
    CandidateRecord::new(record)
}

/// Both channels publish every active record of the test source.
pub fn rules(channels: &[&str]) -> PublishedOnRules {
    PublishedOnRules::new(
        channels
            .iter()
            .map(|channel| PublishRule {
                channel: channel.to_string(),
                record_types: vec![RECORD_TYPE.to_string()],
                sources: Vec::new(),
                require_active: true,
                require_tags_any: Vec::new(),
                exclude_tags: Vec::new(),
                exclude_reduced: true,
            })
            .collect(),
    )
}

pub struct Harness<S = InMemoryDocumentStore> {
    pub store: Arc<S>,
    pub catalogue: Arc<InMemoryTagCatalogue>,
    pub pipeline: SyncPipeline,
    pub retry: RetryQueueHandle,
}

pub fn harness(
    channels: &[Arc<ScriptedChannel>],
    catalogue: impl IntoIterator<Item = CatalogueTag>,
    push_timeout: Duration,
    policy: RetryPolicy,
) -> Harness {
    harness_on(
        Arc::new(InMemoryDocumentStore::new()),
        channels,
        catalogue,
        push_timeout,
        policy,
        None,
    )
}

/// Like [`harness`] over any store, optionally persisting the retry queue.
pub fn harness_on<S: DocumentStore + 'static>(
    store: Arc<S>,
    channels: &[Arc<ScriptedChannel>],
    catalogue: impl IntoIterator<Item = CatalogueTag>,
    push_timeout: Duration,
    policy: RetryPolicy,
    retry_path: Option<PathBuf>,
) -> Harness<S> {
    let mut registry = ChannelRegistry::new();
    for channel in channels {
        registry.register(channel.clone());
    }
    let names = channels.iter().map(|c| c.name().to_string()).collect::<Vec<_>>();
    let dispatcher = Arc::new(NotificationDispatcher::new(Arc::new(registry), "tdh.test", push_timeout));
    let (retry, _task) = RetryWorker::new(Default::default(), policy, retry_path, dispatcher.clone()).spawn();

    let catalogue = Arc::new(InMemoryTagCatalogue::new(catalogue));
    let pipeline = SyncPipeline::new(
        store.clone(),
        catalogue.clone(),
        dispatcher,
        retry.clone(),
        PipelineOptions::default(),
    )
    .with_rules(rules(&names.iter().map(String::as_str).collect::<Vec<_>>()));

    Harness {
        store,
        catalogue,
        pipeline,
        retry,
    }
}

pub fn immediate_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}
