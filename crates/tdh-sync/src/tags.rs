//! Tag resolution against the catalogue with curated entry preservation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tdh_core::{CandidateRecord, CanonicalRecord, CatalogueTag, Tag, TagEntry, TagEntryDirective};
use tdh_storage::{StoreError, TagCatalogue};
use tracing::debug;

pub const DEFAULT_PREFERRED_TYPE: &str = "ltscategory";

/// Catalogue tags loaded for one batch, addressable by id and `source.id`.
#[derive(Debug, Clone, Default)]
pub struct CatalogueSnapshot {
    by_id: BTreeMap<String, CatalogueTag>,
    by_alias: BTreeMap<String, String>,
}

impl CatalogueSnapshot {
    pub fn new(tags: impl IntoIterator<Item = CatalogueTag>) -> Self {
        let mut snapshot = Self::default();
        for tag in tags {
            snapshot.by_alias.insert(tag.alias(), tag.id.clone());
            snapshot.by_id.insert(tag.id.clone(), tag);
        }
        snapshot
    }

    pub fn resolve(&self, requested: &str) -> Option<&CatalogueTag> {
        self.by_id.get(requested).or_else(|| {
            self.by_alias
                .get(requested)
                .and_then(|id| self.by_id.get(id))
        })
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

pub struct TagReconciler {
    catalogue: Arc<dyn TagCatalogue>,
    preferred_type: String,
}

impl TagReconciler {
    pub fn new(catalogue: Arc<dyn TagCatalogue>) -> Self {
        Self {
            catalogue,
            preferred_type: DEFAULT_PREFERRED_TYPE.to_string(),
        }
    }

    pub fn with_preferred_type(mut self, preferred_type: impl Into<String>) -> Self {
        self.preferred_type = preferred_type.into();
        self
    }

    /// One catalogue round-trip for every id referenced by `candidates`.
    pub async fn snapshot<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a CandidateRecord>,
    ) -> Result<CatalogueSnapshot, StoreError> {
        let ids = candidates
            .into_iter()
            .flat_map(|c| c.record.tag_ids.iter().cloned())
            .collect::<BTreeSet<_>>();
        let tags = self.catalogue.load(&ids).await?;
        Ok(CatalogueSnapshot::new(tags))
    }

    pub async fn reconcile(
        &self,
        candidate: &mut CandidateRecord,
        prior: Option<&CanonicalRecord>,
    ) -> Result<(), StoreError> {
        let snapshot = self.snapshot(std::iter::once(&*candidate)).await?;
        self.apply(&snapshot, candidate, prior);
        Ok(())
    }

    /// Batch variant; `priors` is keyed by record id.
    pub async fn reconcile_batch(
        &self,
        candidates: &mut [CandidateRecord],
        priors: &BTreeMap<String, CanonicalRecord>,
    ) -> Result<CatalogueSnapshot, StoreError> {
        let snapshot = self.snapshot(candidates.iter()).await?;
        for candidate in candidates.iter_mut() {
            let prior = priors.get(candidate.id());
            self.apply(&snapshot, candidate, prior);
        }
        Ok(snapshot)
    }

    /// Rebuilds `record.tags`. Directives beat preserved entries, which beat
    /// catalogue defaults; unresolved ids are dropped.
    pub fn apply(&self, snapshot: &CatalogueSnapshot, candidate: &mut CandidateRecord, prior: Option<&CanonicalRecord>) {
        let preserved: BTreeMap<&str, &TagEntry> = prior
            .map(|p| {
                p.tags
                    .iter()
                    .filter_map(|t| t.tag_entry.as_ref().map(|e| (t.id.as_str(), e)))
                    .collect()
            })
            .unwrap_or_default();

        let mut seen = BTreeSet::new();
        let mut tags = Vec::with_capacity(candidate.record.tag_ids.len());
        for requested in &candidate.record.tag_ids {
            let Some(found) = snapshot.resolve(requested) else {
                debug!(record_id = %candidate.record.id, tag_id = %requested, "dropping unresolved tag");
                continue;
            };
            if !seen.insert(found.id.clone()) {
                continue;
            }
            let directive = candidate
                .tag_entries
                .get(&found.id)
                .or_else(|| candidate.tag_entries.get(requested));
            let tag_entry = match directive {
                Some(TagEntryDirective::Set(entry)) => Some(entry.clone()),
                Some(TagEntryDirective::Clear) => None,
                None => preserved
                    .get(found.id.as_str())
                    .map(|e| (*e).clone())
                    .or_else(|| found.tag_entry.clone()),
            };
            tags.push(Tag {
                id: found.id.clone(),
                source: found.source.clone(),
                tag_type: found.display_type(&self.preferred_type),
                name: found.display_name(),
                tag_entry,
            });
        }
        candidate.record.tags = tags;
    }
}
