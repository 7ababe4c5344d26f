//! The generic import engine: candidate → validate → tags → diff → upsert →
//! notify, with per-id serialization and record-boundary cancellation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tdh_adapters::{AdapterContext, SourceAdapter};
use tdh_core::{
    CandidateRecord, CanonicalRecord, CodecRegistry, EditInfo, IdStyle, RawDataId, RawPayload, UpdateDetail,
    UpdateResult,
};
use tdh_storage::{DocumentStore, RawStore, TagCatalogue};
use tracing::{error, info, info_span, warn, Instrument};

use crate::aggregate::ResultAggregator;
use crate::compare::{ChangeDetector, CompareConfig};
use crate::locks::KeyedLocks;
use crate::notify::NotificationDispatcher;
use crate::publish::PublishedOnRules;
use crate::retry::{RetryFailure, RetryQueueHandle};
use crate::tags::{CatalogueSnapshot, TagReconciler};
use crate::upsert::{DeletePolicy, UpsertEngine, UpsertOutcome, WriteContext, WriteRules};
use crate::SyncError;

/// Shared stop signal, observed only between records.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub id_style: IdStyle,
    pub record_concurrency: usize,
    pub operation: String,
    pub edit: EditInfo,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            id_style: IdStyle::default(),
            record_concurrency: 8,
            operation: "import".to_string(),
            edit: EditInfo::default(),
        }
    }
}

/// Per-source settings for [`SyncPipeline::run_adapter`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Retire stored records the feed no longer lists.
    pub removal: Option<DeletePolicy>,
    pub write: WriteRules,
}

/// Prior rows read before any record lock was taken, and the write sequence
/// they are current for.
struct Prefetch {
    priors: BTreeMap<String, CanonicalRecord>,
    epoch: u64,
}

/// Aggregate result plus the per-record details it was built from.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub result: UpdateResult,
    pub details: Vec<UpdateDetail>,
}

impl BatchOutcome {
    fn from_aggregator(aggregator: &ResultAggregator) -> Self {
        let result = aggregator.finish();
        info!(
            source = %result.source,
            created = result.created,
            updated = result.updated,
            deleted = result.deleted,
            errors = result.error,
            objectcompared = result.objectcompared,
            "batch finished"
        );
        Self {
            result,
            details: aggregator.details().to_vec(),
        }
    }
}

pub struct SyncPipeline {
    store: Arc<dyn DocumentStore>,
    raw_store: Option<Arc<dyn RawStore>>,
    reconciler: TagReconciler,
    detector: ChangeDetector,
    upsert: UpsertEngine,
    dispatcher: Arc<NotificationDispatcher>,
    retry: RetryQueueHandle,
    codecs: Arc<CodecRegistry>,
    locks: KeyedLocks,
    options: PipelineOptions,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        catalogue: Arc<dyn TagCatalogue>,
        dispatcher: Arc<NotificationDispatcher>,
        retry: RetryQueueHandle,
        options: PipelineOptions,
    ) -> Self {
        Self {
            upsert: UpsertEngine::new(store.clone(), Arc::new(PublishedOnRules::default())),
            store,
            raw_store: None,
            reconciler: TagReconciler::new(catalogue),
            detector: ChangeDetector::default(),
            dispatcher,
            retry,
            codecs: Arc::new(CodecRegistry::with_defaults()),
            locks: KeyedLocks::new(),
            options,
        }
    }

    pub fn with_rules(mut self, rules: PublishedOnRules) -> Self {
        self.upsert = UpsertEngine::new(self.store.clone(), Arc::new(rules));
        self
    }

    pub fn with_compare(mut self, config: CompareConfig) -> Self {
        self.detector = ChangeDetector::new(config);
        self
    }

    pub fn with_raw_store(mut self, raw_store: Arc<dyn RawStore>) -> Self {
        self.raw_store = Some(raw_store);
        self
    }

    pub fn with_preferred_tag_type(mut self, preferred_type: impl Into<String>) -> Self {
        self.reconciler = self.reconciler.with_preferred_type(preferred_type);
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn retry(&self) -> &RetryQueueHandle {
        &self.retry
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Imports already-canonical candidates as one batch with unrestricted
    /// upserts.
    pub async fn import_batch(
        &self,
        source: &str,
        candidates: Vec<CandidateRecord>,
        raw_data_id: Option<RawDataId>,
        cancel: &CancelFlag,
    ) -> BatchOutcome {
        self.import_batch_with(source, candidates, raw_data_id, &WriteRules::default(), cancel)
            .await
    }

    pub async fn import_batch_with(
        &self,
        source: &str,
        candidates: Vec<CandidateRecord>,
        raw_data_id: Option<RawDataId>,
        write: &WriteRules,
        cancel: &CancelFlag,
    ) -> BatchOutcome {
        let mut aggregator = ResultAggregator::new(source, &self.options.operation, "batch");
        match self.process_candidates(candidates, raw_data_id, write, cancel).await {
            Ok(details) => aggregator.extend(details),
            Err(err) => {
                error!(source, error = %err, "batch aborted");
                aggregator.batch_error(err.to_string());
            }
        }
        if cancel.is_cancelled() {
            aggregator = aggregator.with_otherinfo("cancelled");
        }
        BatchOutcome::from_aggregator(&aggregator)
    }

    /// Source-signaled removal of individual ids.
    pub async fn delete_records(
        &self,
        source: &str,
        record_type: &str,
        ids: Vec<String>,
        policy: DeletePolicy,
        write: &WriteRules,
        cancel: &CancelFlag,
    ) -> BatchOutcome {
        let mut aggregator = ResultAggregator::new(source, "delete", "batch");
        let ids = ids
            .iter()
            .map(|id| self.options.id_style.apply(id))
            .collect::<Vec<_>>();
        aggregator.extend(self.remove_ids(record_type, ids, policy, write, cancel).await);
        BatchOutcome::from_aggregator(&aggregator)
    }

    /// Full cycle for one adapter: fetch, archive, parse, import and, when a
    /// removal policy is given, retire stored records the feed no longer lists.
    pub async fn run_adapter(&self, adapter: &dyn SourceAdapter, run: &RunOptions, cancel: &CancelFlag) -> BatchOutcome {
        let source = adapter.source_id().to_string();
        let record_type = adapter.record_type().to_string();
        let ctx = AdapterContext::new();
        let span = info_span!("source_run", source = %source, run_id = %ctx.run_id);
        async {
            let mut aggregator = ResultAggregator::new(&source, &self.options.operation, "batch");

            let payload = match adapter.fetch(&ctx).await {
                Ok(payload) => payload,
                Err(err) => {
                    aggregator.batch_error(SyncError::from(err).to_string());
                    return BatchOutcome::from_aggregator(&aggregator);
                }
            };
            let raw_data_id = self.archive(&payload).await;
            let items = match adapter.parse(&payload) {
                Ok(items) => items,
                Err(err) => {
                    aggregator.batch_error(SyncError::from(err).to_string());
                    return BatchOutcome::from_aggregator(&aggregator);
                }
            };
            let item_count = items.len();

            let mut candidates = Vec::with_capacity(item_count);
            for item in items {
                let item_id = item
                    .get("Id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                match adapter.to_canonical(item) {
                    Ok(mut candidate) => {
                        candidate.record.normalize_id(self.options.id_style);
                        candidates.push(candidate);
                    }
                    Err(err) => {
                        let err = SyncError::from(err);
                        warn!(record_id = %item_id, error = %err, "item rejected");
                        aggregator.push(UpdateDetail::failed(
                            item_id,
                            &record_type,
                            &self.options.operation,
                            err.to_string(),
                        ));
                    }
                }
            }
            let seen = candidates
                .iter()
                .map(|c| c.id().to_string())
                .collect::<BTreeSet<_>>();

            match self.process_candidates(candidates, raw_data_id, &run.write, cancel).await {
                Ok(details) => aggregator.extend(details),
                Err(err) => {
                    error!(error = %err, "batch aborted");
                    aggregator.batch_error(err.to_string());
                    return BatchOutcome::from_aggregator(&aggregator);
                }
            }

            if let Some(policy) = run.removal {
                if cancel.is_cancelled() {
                    warn!("cancelled, skipping removal pass");
                } else if item_count == 0 {
                    warn!("feed returned no items, skipping removal pass");
                } else {
                    match self.store.ids_by_source(&source, &record_type).await {
                        Ok(stored) => {
                            let missing = stored
                                .into_iter()
                                .filter(|id| !seen.contains(id))
                                .collect::<Vec<_>>();
                            info!(count = missing.len(), ?policy, "retiring records missing from feed");
                            aggregator.extend(self.remove_ids(&record_type, missing, policy, &run.write, cancel).await);
                        }
                        Err(err) => aggregator.batch_error(SyncError::from(err).to_string()),
                    }
                }
            }

            if cancel.is_cancelled() {
                aggregator = aggregator.with_otherinfo("cancelled");
            }
            BatchOutcome::from_aggregator(&aggregator)
        }
        .instrument(span)
        .await
    }

    async fn archive(&self, payload: &RawPayload) -> Option<RawDataId> {
        let raw_store = self.raw_store.as_ref()?;
        match raw_store.store(payload).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "raw payload not archived");
                None
            }
        }
    }

    /// Batch-level reads happen once here; any failure aborts the batch.
    async fn process_candidates(
        &self,
        mut candidates: Vec<CandidateRecord>,
        raw_data_id: Option<RawDataId>,
        write: &WriteRules,
        cancel: &CancelFlag,
    ) -> Result<Vec<UpdateDetail>, SyncError> {
        for candidate in &mut candidates {
            candidate.record.normalize_id(self.options.id_style);
            if raw_data_id.is_some() {
                candidate.record.raw_data_id = raw_data_id.clone();
            }
        }
        let ids = candidates
            .iter()
            .map(|c| c.id().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let epoch = self.locks.epoch();
        let priors = self
            .store
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<BTreeMap<_, _>>();
        let snapshot = self
            .reconciler
            .snapshot(candidates.iter())
            .await
            .map_err(SyncError::Catalogue)?;
        let prefetch = Prefetch { priors, epoch };

        let details = stream::iter(candidates)
            .map(|candidate| self.process_record(candidate, &prefetch, &snapshot, write, cancel))
            .buffered(self.options.record_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        Ok(details.into_iter().flatten().collect())
    }

    /// `None` when cancellation was requested before the record started.
    async fn process_record(
        &self,
        mut candidate: CandidateRecord,
        prefetch: &Prefetch,
        snapshot: &CatalogueSnapshot,
        write: &WriteRules,
        cancel: &CancelFlag,
    ) -> Option<UpdateDetail> {
        if cancel.is_cancelled() {
            return None;
        }
        let id = candidate.id().to_string();
        let record_type = candidate.record.record_type().to_string();
        let span = info_span!("record", record_id = %id, record_type = %record_type);
        let detail = async {
            let mut guard = self.locks.lock(&id).await;
            // rows written since the prefetch (this batch or a concurrent one) are read again
            let prior = if KeyedLocks::written_since(&guard, prefetch.epoch) {
                match self.store.get(&id).await {
                    Ok(prior) => prior,
                    Err(err) => return self.failed(&id, &record_type, SyncError::from(err)),
                }
            } else {
                prefetch.priors.get(&id).cloned()
            };

            if let Err(err) = self.validate(&mut candidate) {
                return self.failed(&id, &record_type, err);
            }
            self.reconciler.apply(snapshot, &mut candidate, prior.as_ref());
            let change = match self.detector.detect(prior.as_ref(), &candidate.record) {
                Ok(change) => change,
                Err(err) => return self.failed(&id, &record_type, SyncError::from(err)),
            };
            let ctx = self.write_context(write);
            let outcome = self
                .upsert
                .upsert(candidate.record, prior.as_ref(), &change, &ctx)
                .await;
            self.locks.mark_written(&mut guard);
            self.announce(outcome).await
        }
        .instrument(span)
        .await;
        Some(detail)
    }

    async fn remove_ids(
        &self,
        record_type: &str,
        ids: Vec<String>,
        policy: DeletePolicy,
        write: &WriteRules,
        cancel: &CancelFlag,
    ) -> Vec<UpdateDetail> {
        stream::iter(ids)
            .map(|id| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let span = info_span!("remove", record_id = %id, ?policy);
                let detail = async {
                    let mut guard = self.locks.lock(&id).await;
                    let ctx = WriteContext {
                        operation: "delete",
                        ..self.write_context(write)
                    };
                    let outcome = self.upsert.delete(&id, record_type, policy, &ctx).await;
                    self.locks.mark_written(&mut guard);
                    self.announce(outcome).await
                }
                .instrument(span)
                .await;
                Some(detail)
            })
            .buffered(self.options.record_concurrency.max(1))
            .filter_map(|detail| async move { detail })
            .collect()
            .await
    }

    fn write_context<'a>(&'a self, write: &'a WriteRules) -> WriteContext<'a> {
        WriteContext {
            operation: &self.options.operation,
            rules: write,
            edit: &self.options.edit,
        }
    }

    fn validate(&self, candidate: &mut CandidateRecord) -> Result<(), SyncError> {
        let invalid = |message: String| SyncError::Validation {
            id: candidate.record.id.clone(),
            message,
        };
        if candidate.record.id.trim().is_empty() {
            return Err(invalid("record id is empty".into()));
        }
        if candidate.record.source.trim().is_empty() {
            return Err(invalid("record source is empty".into()));
        }
        if candidate.record.record_type().trim().is_empty() {
            return Err(invalid("record type is empty".into()));
        }
        let decoded = self
            .codecs
            .decode_all(&candidate.raw_additional_properties)
            .map_err(|err| invalid(err.to_string()))?;
        candidate.record.additional_properties.extend(decoded);
        Ok(())
    }

    /// Dispatch never changes the persistence outcome; failures go to the
    /// retry queue.
    async fn announce(&self, outcome: UpsertOutcome) -> UpdateDetail {
        let UpsertOutcome { mut detail, dispatch } = outcome;
        let Some(request) = dispatch else {
            return detail;
        };
        let pushed = self.dispatcher.dispatch(&request).await;
        let failures = pushed
            .values()
            .filter(|response| !response.success)
            .map(|response| RetryFailure::from_response(self.dispatcher.origin(), &request, response))
            .collect::<Vec<_>>();
        if let Err(err) = self.retry.enqueue(failures).await {
            error!(record_id = %request.record_id, error = %err, "failed deliveries could not be queued");
        }
        detail.pushed = pushed;
        detail
    }

    fn failed(&self, id: &str, record_type: &str, err: SyncError) -> UpdateDetail {
        warn!(record_id = %id, error = %err, "record failed");
        UpdateDetail::failed(id, record_type, &self.options.operation, err.to_string())
    }
}
