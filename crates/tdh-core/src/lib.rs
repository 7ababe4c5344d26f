//! Canonical record model and batch result contracts for TDH.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod properties;
pub mod results;

pub use properties::{
    ActivityLtsDataProperties, AdditionalProperty, AdditionalPropertyCodec, CodecError,
    CodecRegistry, GastronomyLtsDataProperties, PoiAgeDataProperties, PoiLtsDataProperties,
    SerdeCodec,
};
pub use results::{NotifierResponse, RetryQueueEntry, RetryStatus, UpdateDetail, UpdateResult};

pub const CRATE_NAME: &str = "tdh-core";

/// Suffix carried by the id of a reduced (licensing-limited) record variant.
pub const REDUCED_SUFFIX: &str = "_REDUCED";

/// Curated key/value metadata attached to a tag assignment.
pub type TagEntry = BTreeMap<String, String>;

/// Provider-specific raw fields, keyed by provider then field name.
pub type Mapping = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStyle {
    #[default]
    Uppercase,
    Lowercase,
    Preserve,
}

impl IdStyle {
    pub fn apply(self, id: &str) -> String {
        let id = id.trim();
        match self {
            IdStyle::Uppercase => id.to_uppercase(),
            IdStyle::Lowercase => id.to_lowercase(),
            IdStyle::Preserve => id.to_string(),
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "uppercase" | "upper" => Some(IdStyle::Uppercase),
            "lowercase" | "lower" => Some(IdStyle::Lowercase),
            "preserve" | "none" => Some(IdStyle::Preserve),
            _ => None,
        }
    }
}

/// Identifier handed out by the raw store for an archived payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawDataId(pub String);

impl fmt::Display for RawDataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unmodified as-fetched provider data, retained for audit/replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    pub datasource: String,
    pub source_id: String,
    pub content_type: String,
    pub payload: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub id: String,
    pub source: String,
    #[serde(rename = "Type")]
    pub tag_type: Option<String>,
    pub name: Option<String>,
    pub tag_entry: Option<TagEntry>,
}

/// Tag definition as held by the tag catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogueTag {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub tag_name: BTreeMap<String, String>,
    #[serde(default)]
    pub tag_entry: Option<TagEntry>,
}

impl CatalogueTag {
    /// `source.id` form under which importers may reference this tag.
    pub fn alias(&self) -> String {
        format!("{}.{}", self.source, self.id)
    }

    pub fn display_type(&self, preferred: &str) -> Option<String> {
        match self.types.len() {
            0 => None,
            1 => self.types.first().cloned(),
            _ if self.types.iter().any(|t| t == preferred) => Some(preferred.to_string()),
            _ => self.types.first().cloned(),
        }
    }

    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.tag_name.get("en") {
            return Some(name.clone());
        }
        self.tag_name.values().find(|v| !v.trim().is_empty()).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageGalleryItem {
    pub image_url: String,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub copyright: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub list_position: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LicenseInfo {
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub license_holder: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub closed_data: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    pub id: String,
    #[serde(rename = "Type")]
    pub record_type: String,
    pub source: String,
    #[serde(default)]
    pub reduced: bool,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_info: Option<UpdateInfo>,
}

/// Who performs a write, stamped into `_Meta.UpdateInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditInfo {
    pub editor: String,
    pub source: String,
}

impl Default for EditInfo {
    fn default() -> Self {
        Self {
            editor: "import".to_string(),
            source: "importer".to_string(),
        }
    }
}

/// Keeps at most this many previous editors per record.
pub const UPDATE_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateInfo {
    pub updated_by: String,
    pub update_source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_history: Vec<UpdateHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateHistoryEntry {
    pub updated_by: String,
    pub update_source: String,
    #[serde(default)]
    pub update_date: Option<DateTime<Utc>>,
}

impl UpdateInfo {
    /// Provenance for a new write: the previous editor moves into the
    /// history, oldest entries fall off past [`UPDATE_HISTORY_LIMIT`].
    pub fn stamp(edit: &EditInfo, previous: Option<&Metadata>) -> Self {
        let mut update_history = Vec::new();
        if let Some(previous) = previous {
            if let Some(info) = &previous.update_info {
                update_history.extend(info.update_history.iter().cloned());
                update_history.push(UpdateHistoryEntry {
                    updated_by: info.updated_by.clone(),
                    update_source: info.update_source.clone(),
                    update_date: previous.last_update,
                });
            }
        }
        if update_history.len() > UPDATE_HISTORY_LIMIT {
            update_history.drain(..update_history.len() - UPDATE_HISTORY_LIMIT);
        }
        Self {
            updated_by: edit.editor.clone(),
            update_source: edit.source.clone(),
            update_history,
        }
    }
}

/// Unified entity shape all provider data is normalized into.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CanonicalRecord {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub tag_ids: BTreeSet<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub mapping: Mapping,
    #[serde(default)]
    pub published_on: Vec<String>,
    #[serde(default)]
    pub license_info: LicenseInfo,
    #[serde(rename = "_Meta", default)]
    pub meta: Metadata,
    #[serde(default)]
    pub raw_data_id: Option<RawDataId>,
    #[serde(default)]
    pub image_gallery: Vec<ImageGalleryItem>,
    #[serde(default)]
    pub additional_properties: BTreeMap<String, AdditionalProperty>,
    #[serde(default)]
    pub detail: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub first_import: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_change: Option<DateTime<Utc>>,
}

impl CanonicalRecord {
    pub fn new(id: impl Into<String>, source: impl Into<String>, record_type: impl Into<String>) -> Self {
        let id = id.into();
        let source = source.into();
        Self {
            meta: Metadata {
                id: id.clone(),
                record_type: record_type.into(),
                source: source.clone(),
                reduced: false,
                last_update: None,
                update_info: None,
            },
            id,
            source,
            active: true,
            ..Default::default()
        }
    }

    pub fn record_type(&self) -> &str {
        &self.meta.record_type
    }

    pub fn has_images(&self) -> bool {
        !self.image_gallery.is_empty()
    }

    pub fn is_reduced(&self) -> bool {
        self.meta.reduced
    }

    /// Normalizes the id according to `style`, appends the reduced suffix when
    /// needed and mirrors id/source into the metadata block.
    pub fn normalize_id(&mut self, style: IdStyle) {
        let mut id = style.apply(&self.id);
        if self.meta.reduced && !id.to_ascii_uppercase().ends_with(REDUCED_SUFFIX) {
            let suffix = match style {
                IdStyle::Lowercase => REDUCED_SUFFIX.to_lowercase(),
                _ => REDUCED_SUFFIX.to_string(),
            };
            id.push_str(&suffix);
        }
        self.id = id;
        self.meta.id = self.id.clone();
        if self.meta.source.is_empty() {
            self.meta.source = self.source.clone();
        }
    }

    pub fn tag(&self, tag_id: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == tag_id)
    }
}

/// Editorial instruction for a tag entry carried by a candidate.
///
/// Omitting a tag id from [`CandidateRecord::tag_entries`] keeps whatever entry
/// the stored record already has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "entry", rename_all = "lowercase")]
pub enum TagEntryDirective {
    Set(TagEntry),
    Clear,
}

/// Ephemeral handoff contract from source adapters into the sync pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub record: CanonicalRecord,
    #[serde(default)]
    pub raw_additional_properties: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub tag_entries: BTreeMap<String, TagEntryDirective>,
}

impl CandidateRecord {
    pub fn new(record: CanonicalRecord) -> Self {
        Self {
            record,
            raw_additional_properties: BTreeMap::new(),
            tag_entries: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_records_get_suffixed_ids() {
        let mut record = CanonicalRecord::new("abc-1", "lts", "poi");
        record.meta.reduced = true;
        record.normalize_id(IdStyle::Uppercase);
        assert_eq!(record.id, "ABC-1_REDUCED");
        assert_eq!(record.meta.id, record.id);

        record.normalize_id(IdStyle::Uppercase);
        assert_eq!(record.id, "ABC-1_REDUCED");
    }

    #[test]
    fn catalogue_tag_prefers_configured_type_and_english_name() {
        let tag = CatalogueTag {
            id: "hiking".into(),
            source: "lts".into(),
            types: vec!["odhcategory".into(), "ltscategory".into()],
            tag_name: BTreeMap::from([
                ("de".to_string(), "Wandern".to_string()),
                ("en".to_string(), "Hiking".to_string()),
            ]),
            tag_entry: None,
        };
        assert_eq!(tag.display_type("ltscategory").as_deref(), Some("ltscategory"));
        assert_eq!(tag.display_type("other").as_deref(), Some("odhcategory"));
        assert_eq!(tag.display_name().as_deref(), Some("Hiking"));
        assert_eq!(tag.alias(), "lts.hiking");
    }

    #[test]
    fn canonical_record_uses_pascal_case_document_shape() {
        let record = CanonicalRecord::new("X1", "lts", "event");
        let value = serde_json::to_value(&record).expect("serialize");
        assert!(value.get("PublishedOn").is_some());
        assert_eq!(value["_Meta"]["Type"], "event");
        let back: CanonicalRecord = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn tag_entry_directive_serializes_clear_sentinel() {
        let clear = serde_json::to_value(TagEntryDirective::Clear).expect("serialize");
        assert_eq!(clear, serde_json::json!({ "action": "clear" }));
    }

    #[test]
    fn update_info_moves_the_previous_editor_into_history() {
        let editor = EditInfo {
            editor: "alice".into(),
            source: "api".into(),
        };
        let first = UpdateInfo::stamp(&EditInfo::default(), None);
        assert_eq!(first.updated_by, "import");
        assert!(first.update_history.is_empty());

        let mut previous = CanonicalRecord::new("X1", "lts", "event").meta;
        previous.update_info = Some(first);
        let second = UpdateInfo::stamp(&editor, Some(&previous));
        assert_eq!((second.updated_by.as_str(), second.update_source.as_str()), ("alice", "api"));
        assert_eq!(second.update_history.len(), 1);
        assert_eq!(second.update_history[0].update_source, "importer");

        let mut info = second;
        for _ in 0..UPDATE_HISTORY_LIMIT + 5 {
            previous.update_info = Some(info);
            info = UpdateInfo::stamp(&editor, Some(&previous));
        }
        assert_eq!(info.update_history.len(), UPDATE_HISTORY_LIMIT);
    }
}
