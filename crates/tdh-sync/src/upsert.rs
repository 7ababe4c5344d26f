//! Create / update / soft-disable / hard-delete, applied once per record per pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tdh_core::{CanonicalRecord, EditInfo, UpdateDetail, UpdateInfo};
use tdh_storage::DocumentStore;
use tracing::{debug, warn};

use crate::compare::ChangeOutcome;
use crate::notify::DispatchRequest;
use crate::publish::PublishedOnRules;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    HardDelete,
    SoftDisable,
}

impl DeletePolicy {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hard_delete" | "hard" | "delete" => Some(DeletePolicy::HardDelete),
            "soft_disable" | "soft" | "disable" => Some(DeletePolicy::SoftDisable),
            _ => None,
        }
    }
}

/// Open-data feeds may drop records outright; closed feeds keep them disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    #[default]
    Open,
    Closed,
}

impl FeedKind {
    pub fn default_delete_policy(self) -> DeletePolicy {
        match self {
            FeedKind::Open => DeletePolicy::HardDelete,
            FeedKind::Closed => DeletePolicy::SoftDisable,
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "open" => Some(FeedKind::Open),
            "closed" => Some(FeedKind::Closed),
            _ => None,
        }
    }
}

/// Which of create/update a write may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Upsert,
    /// Existing rows are rejected.
    CreateOnly,
    /// Unknown ids are rejected.
    UpdateOnly,
}

/// Matches records by source and type; empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrudCondition {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub record_types: Vec<String>,
}

impl CrudCondition {
    pub fn allows(&self, record: &CanonicalRecord) -> bool {
        (self.sources.is_empty() || self.sources.iter().any(|s| s.eq_ignore_ascii_case(&record.source)))
            && (self.record_types.is_empty() || self.record_types.iter().any(|t| t == record.record_type()))
    }
}

/// Per-operation conditions a record must meet; `None` allows all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrudConstraints {
    #[serde(default)]
    pub create: Option<CrudCondition>,
    #[serde(default)]
    pub update: Option<CrudCondition>,
    #[serde(default)]
    pub delete: Option<CrudCondition>,
}

fn permitted(condition: &Option<CrudCondition>, record: &CanonicalRecord) -> bool {
    condition.as_ref().map_or(true, |c| c.allows(record))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRules {
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub constraints: CrudConstraints,
}

/// Everything a single write needs besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct WriteContext<'a> {
    pub operation: &'a str,
    pub rules: &'a WriteRules,
    pub edit: &'a EditInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub detail: UpdateDetail,
    /// Present when channels must be informed of the mutation.
    pub dispatch: Option<DispatchRequest>,
}

impl UpsertOutcome {
    fn without_dispatch(detail: UpdateDetail) -> Self {
        Self { detail, dispatch: None }
    }
}

pub struct UpsertEngine {
    store: Arc<dyn DocumentStore>,
    rules: Arc<PublishedOnRules>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn DocumentStore>, rules: Arc<PublishedOnRules>) -> Self {
        Self { store, rules }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Writes a tag-reconciled candidate if the detector asks for it. Store
    /// failures and rejected writes end up in the returned detail, never as
    /// an `Err`.
    pub async fn upsert(
        &self,
        mut record: CanonicalRecord,
        prior: Option<&CanonicalRecord>,
        change: &ChangeOutcome,
        ctx: &WriteContext<'_>,
    ) -> UpsertOutcome {
        let mut detail = UpdateDetail::for_record(&record.id, record.record_type(), ctx.operation);
        let constraints = &ctx.rules.constraints;
        let rejection = match prior {
            None if !permitted(&constraints.create, &record) => Some("not allowed"),
            Some(_) if !permitted(&constraints.update, &record) => Some("not allowed"),
            None if ctx.rules.mode == WriteMode::UpdateOnly => Some("data to update not found"),
            Some(_) if ctx.rules.mode == WriteMode::CreateOnly => Some("data exists already"),
            _ => None,
        };
        if let Some(reason) = rejection {
            return UpsertOutcome::without_dispatch(rejected(detail, reason));
        }
        change.apply_to(&mut detail);

        if !change.requires_write() {
            debug!(record_id = %record.id, "unchanged, skipping write");
            return UpsertOutcome::without_dispatch(detail);
        }

        let now = Utc::now();
        match prior {
            None => {
                record.first_import = record.first_import.or(Some(now));
                record.last_change = Some(now);
            }
            Some(old) => {
                record.first_import = old.first_import.or(Some(now));
                record.last_change = if change.changed {
                    Some(now)
                } else {
                    old.last_change.or(Some(now))
                };
            }
        }
        self.rules.apply(&mut record);
        record.meta.update_info = Some(UpdateInfo::stamp(ctx.edit, prior.map(|old| &old.meta)));
        record.meta.last_update = Some(now);

        if let Err(err) = self.store.upsert(&record).await {
            return UpsertOutcome::without_dispatch(persistence_failure(detail, SyncError::from(err)));
        }

        if prior.is_some() {
            detail.updated = 1;
        } else {
            detail.created = 1;
        }

        let dispatch = change.changed.then(|| {
            let channels = record
                .published_on
                .iter()
                .chain(prior.iter().flat_map(|old| old.published_on.iter()))
                .cloned()
                .collect::<BTreeSet<_>>();
            detail.pushchannels = channels.clone();
            DispatchRequest {
                record_id: record.id.clone(),
                record_type: record.record_type().to_string(),
                channels,
                image_changed: change.image_changed,
                is_delete: false,
            }
        });
        UpsertOutcome { detail, dispatch }
    }

    /// Source-signaled removal of `id` under `policy`.
    pub async fn delete(
        &self,
        id: &str,
        record_type: &str,
        policy: DeletePolicy,
        ctx: &WriteContext<'_>,
    ) -> UpsertOutcome {
        let detail = UpdateDetail::for_record(id, record_type, ctx.operation);
        let prior = match self.store.get(id).await {
            Ok(prior) => prior,
            Err(err) => return UpsertOutcome::without_dispatch(persistence_failure(detail, SyncError::from(err))),
        };
        let Some(old) = prior else {
            debug!(record_id = %id, "nothing to remove");
            return UpsertOutcome::without_dispatch(detail);
        };
        if !permitted(&ctx.rules.constraints.delete, &old) {
            return UpsertOutcome::without_dispatch(rejected(detail, "not allowed"));
        }
        match policy {
            DeletePolicy::HardDelete => self.hard_delete(old, detail).await,
            DeletePolicy::SoftDisable => self.soft_disable(old, detail, ctx.edit).await,
        }
    }

    async fn hard_delete(&self, old: CanonicalRecord, mut detail: UpdateDetail) -> UpsertOutcome {
        match self.store.delete(&old.id).await {
            Ok(true) => {
                detail.deleted = 1;
                Self::removal(old.published_on.iter().cloned().collect(), &old, detail)
            }
            Ok(false) => UpsertOutcome::without_dispatch(detail),
            Err(err) => UpsertOutcome::without_dispatch(persistence_failure(detail, SyncError::from(err))),
        }
    }

    async fn soft_disable(&self, old: CanonicalRecord, mut detail: UpdateDetail, edit: &EditInfo) -> UpsertOutcome {
        if !old.active && old.published_on.is_empty() {
            debug!(record_id = %old.id, "already disabled");
            return UpsertOutcome::without_dispatch(detail);
        }
        let now = Utc::now();
        let mut record = old.clone();
        record.active = false;
        record.published_on.clear();
        record.last_change = Some(now);
        record.meta.update_info = Some(UpdateInfo::stamp(edit, Some(&old.meta)));
        record.meta.last_update = Some(now);

        if let Err(err) = self.store.upsert(&record).await {
            return UpsertOutcome::without_dispatch(persistence_failure(detail, SyncError::from(err)));
        }
        detail.updated = 1;
        detail.objectchanged = 1;
        Self::removal(old.published_on.iter().cloned().collect(), &old, detail)
    }

    fn removal(channels: BTreeSet<String>, old: &CanonicalRecord, mut detail: UpdateDetail) -> UpsertOutcome {
        detail.pushchannels = channels.clone();
        let dispatch = DispatchRequest {
            record_id: old.id.clone(),
            record_type: old.record_type().to_string(),
            channels,
            image_changed: false,
            is_delete: true,
        };
        UpsertOutcome {
            detail,
            dispatch: Some(dispatch),
        }
    }
}

fn rejected(detail: UpdateDetail, reason: &'static str) -> UpdateDetail {
    let err = SyncError::WriteRejected {
        id: detail.id.clone(),
        reason,
    };
    warn!(record_id = %detail.id, error = %err, "write rejected");
    UpdateDetail {
        error: 1,
        exception: Some(err.to_string()),
        ..detail
    }
}

fn persistence_failure(mut detail: UpdateDetail, err: SyncError) -> UpdateDetail {
    warn!(record_id = %detail.id, error = %err, "write failed");
    detail.error = 1;
    detail.objectchanged = 0;
    detail.objectimagechanged = 0;
    detail.changes = None;
    detail.exception = Some(err.to_string());
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::ChangeDetector;
    use crate::publish::PublishRule;
    use async_trait::async_trait;
    use tdh_storage::{InMemoryDocumentStore, StoreError};

    fn rules() -> Arc<PublishedOnRules> {
        Arc::new(PublishedOnRules::new(vec![PublishRule {
            channel: "idm-marketplace".into(),
            record_types: vec![],
            sources: vec![],
            require_active: true,
            require_tags_any: vec![],
            exclude_tags: vec!["hidden".into()],
            exclude_reduced: false,
        }]))
    }

    fn record() -> CanonicalRecord {
        CanonicalRecord::new("A1", "lts", "odhactivitypoi")
    }

    fn ctx<'a>(operation: &'a str, rules: &'a WriteRules, edit: &'a EditInfo) -> WriteContext<'a> {
        WriteContext { operation, rules, edit }
    }

    #[tokio::test]
    async fn create_update_and_noop_paths() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engine = UpsertEngine::new(store.clone(), rules());
        let detector = ChangeDetector::default();
        let (write, edit) = (WriteRules::default(), EditInfo::default());
        let import = ctx("import", &write, &edit);

        let candidate = record();
        let change = detector.detect(None, &candidate).expect("detect");
        let created = engine.upsert(candidate.clone(), None, &change, &import).await;
        assert_eq!(created.detail.created, 1);
        let dispatch = created.dispatch.expect("new records are announced");
        assert!(dispatch.channels.contains("idm-marketplace"));

        let stored = store.get("A1").await.expect("get").expect("row");
        assert_eq!(stored.published_on, vec!["idm-marketplace"]);
        assert!(stored.first_import.is_some());

        let change = detector.detect(Some(&stored), &candidate).expect("detect");
        let unchanged = engine.upsert(candidate.clone(), Some(&stored), &change, &import).await;
        assert_eq!((unchanged.detail.updated, unchanged.detail.objectcompared), (0, 1));
        assert!(unchanged.dispatch.is_none());

        let mut hidden = candidate.clone();
        hidden.tag_ids.insert("hidden".into());
        let change = detector.detect(Some(&stored), &hidden).expect("detect");
        let updated = engine.upsert(hidden, Some(&stored), &change, &import).await;
        assert_eq!(updated.detail.updated, 1);
        let dispatch = updated.dispatch.expect("changed records are announced");
        // the channel that lost the record is still informed
        assert!(dispatch.channels.contains("idm-marketplace"));

        let after = store.get("A1").await.expect("get").expect("row");
        assert!(after.published_on.is_empty());
        assert_eq!(after.first_import, stored.first_import);
    }

    #[tokio::test]
    async fn soft_disable_clears_publication_and_is_idempotent() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut existing = record();
        existing.published_on = vec!["idm-marketplace".into()];
        store.upsert(&existing).await.expect("seed");
        let engine = UpsertEngine::new(store.clone(), rules());
        let (write, edit) = (WriteRules::default(), EditInfo::default());
        let delete = ctx("delete", &write, &edit);

        let first = engine.delete("A1", "odhactivitypoi", DeletePolicy::SoftDisable, &delete).await;
        assert_eq!(first.detail.updated, 1);
        let dispatch = first.dispatch.expect("removal is announced");
        assert!(dispatch.is_delete);
        assert_eq!(dispatch.channels, BTreeSet::from(["idm-marketplace".to_string()]));

        let stored = store.get("A1").await.expect("get").expect("row kept");
        assert!(!stored.active);
        assert!(stored.published_on.is_empty());

        let second = engine.delete("A1", "odhactivitypoi", DeletePolicy::SoftDisable, &delete).await;
        assert_eq!(second.detail, UpdateDetail::for_record("A1", "odhactivitypoi", "delete"));
        assert!(second.dispatch.is_none());
    }

    #[tokio::test]
    async fn hard_delete_of_missing_row_is_a_noop() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.upsert(&record()).await.expect("seed");
        let engine = UpsertEngine::new(store.clone(), rules());
        let (write, edit) = (WriteRules::default(), EditInfo::default());
        let delete = ctx("delete", &write, &edit);

        let removed = engine.delete("A1", "odhactivitypoi", DeletePolicy::HardDelete, &delete).await;
        assert_eq!(removed.detail.deleted, 1);
        assert!(store.is_empty().await);

        let again = engine.delete("A1", "odhactivitypoi", DeletePolicy::HardDelete, &delete).await;
        assert_eq!((again.detail.deleted, again.detail.error), (0, 0));
    }

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn get(&self, _id: &str) -> Result<Option<CanonicalRecord>, StoreError> {
            Ok(None)
        }
        async fn get_many(&self, _ids: &[String]) -> Result<Vec<CanonicalRecord>, StoreError> {
            Ok(Vec::new())
        }
        async fn upsert(&self, _record: &CanonicalRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
        async fn delete(&self, _id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn ids_by_source(&self, _source: &str, _record_type: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn write_failures_become_record_errors() {
        let engine = UpsertEngine::new(Arc::new(BrokenStore), rules());
        let change = ChangeDetector::default().detect(None, &record()).expect("detect");
        let (write, edit) = (WriteRules::default(), EditInfo::default());
        let outcome = engine.upsert(record(), None, &change, &ctx("import", &write, &edit)).await;
        assert_eq!((outcome.detail.error, outcome.detail.created), (1, 0));
        assert!(outcome.detail.exception.unwrap_or_default().contains("disk full"));
        assert!(outcome.dispatch.is_none());
    }

    #[test]
    fn feed_kinds_pick_their_delete_policy() {
        assert_eq!(FeedKind::Open.default_delete_policy(), DeletePolicy::HardDelete);
        assert_eq!(FeedKind::Closed.default_delete_policy(), DeletePolicy::SoftDisable);
        assert_eq!(DeletePolicy::parse("soft-disable"), Some(DeletePolicy::SoftDisable));
        assert_eq!(FeedKind::parse("CLOSED"), Some(FeedKind::Closed));
    }

    #[tokio::test]
    async fn write_modes_reject_the_wrong_side_of_an_upsert() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engine = UpsertEngine::new(store.clone(), rules());
        let detector = ChangeDetector::default();
        let edit = EditInfo::default();

        let update_only = WriteRules {
            mode: WriteMode::UpdateOnly,
            ..WriteRules::default()
        };
        let change = detector.detect(None, &record()).expect("detect");
        let missing = engine
            .upsert(record(), None, &change, &ctx("import", &update_only, &edit))
            .await;
        assert_eq!((missing.detail.error, missing.detail.created), (1, 0));
        assert!(missing.detail.exception.unwrap_or_default().contains("data to update not found"));
        assert!(store.is_empty().await);

        let create_only = WriteRules {
            mode: WriteMode::CreateOnly,
            ..WriteRules::default()
        };
        let created = engine
            .upsert(record(), None, &change, &ctx("import", &create_only, &edit))
            .await;
        assert_eq!(created.detail.created, 1);

        let stored = store.get("A1").await.expect("get").expect("row");
        let mut changed = record();
        changed.active = false;
        let change = detector.detect(Some(&stored), &changed).expect("detect");
        let exists = engine
            .upsert(changed, Some(&stored), &change, &ctx("import", &create_only, &edit))
            .await;
        assert_eq!((exists.detail.error, exists.detail.updated), (1, 0));
        assert!(exists.detail.exception.unwrap_or_default().contains("data exists already"));
        assert!(exists.dispatch.is_none());
        assert_eq!(store.get("A1").await.expect("get").expect("row"), stored);
    }

    #[tokio::test]
    async fn crud_constraints_guard_each_operation() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engine = UpsertEngine::new(store.clone(), rules());
        let edit = EditInfo::default();
        let only_other_source = Some(CrudCondition {
            sources: vec!["siag".into()],
            record_types: vec![],
        });
        let guarded = WriteRules {
            mode: WriteMode::Upsert,
            constraints: CrudConstraints {
                create: only_other_source.clone(),
                update: None,
                delete: only_other_source,
            },
        };

        let change = ChangeDetector::default().detect(None, &record()).expect("detect");
        let denied = engine.upsert(record(), None, &change, &ctx("import", &guarded, &edit)).await;
        assert_eq!(denied.detail.error, 1);
        assert!(denied.detail.exception.unwrap_or_default().contains("not allowed"));

        store.upsert(&record()).await.expect("seed");
        let kept = engine
            .delete("A1", "odhactivitypoi", DeletePolicy::HardDelete, &ctx("delete", &guarded, &edit))
            .await;
        assert_eq!((kept.detail.error, kept.detail.deleted), (1, 0));
        assert!(store.get("A1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn writes_stamp_the_editor_and_keep_history() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engine = UpsertEngine::new(store.clone(), rules());
        let detector = ChangeDetector::default();
        let write = WriteRules::default();
        let importer = EditInfo::default();
        let operator = EditInfo {
            editor: "ops".into(),
            source: "api".into(),
        };

        let change = detector.detect(None, &record()).expect("detect");
        engine.upsert(record(), None, &change, &ctx("import", &write, &importer)).await;
        let first = store.get("A1").await.expect("get").expect("row");
        let info = first.meta.update_info.clone().expect("stamped");
        assert_eq!((info.updated_by.as_str(), info.update_source.as_str()), ("import", "importer"));

        let outcome = engine
            .delete("A1", "odhactivitypoi", DeletePolicy::SoftDisable, &ctx("delete", &write, &operator))
            .await;
        assert_eq!(outcome.detail.updated, 1);
        let second = store.get("A1").await.expect("get").expect("row");
        let info = second.meta.update_info.expect("stamped");
        assert_eq!(info.updated_by, "ops");
        assert_eq!(info.update_history.len(), 1);
        assert_eq!(info.update_history[0].updated_by, "import");
        assert_eq!(info.update_history[0].update_date, first.meta.last_update);
    }
}
