//! Material change detection between a stored record and its candidate.
//!
//! Both sides are serialized into `serde_json::Value` trees (objects are
//! key-ordered), derived fields are stripped and the remainder is walked to
//! produce an RFC 6902 style patch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tdh_core::{CanonicalRecord, UpdateDetail};

/// Pointers that are recomputed on every write and never count as change.
pub const DERIVED_FIELDS: &[&str] = &[
    "/_Meta/LastUpdate",
    "/_Meta/UpdateInfo",
    "/PublishedOn",
    "/FirstImport",
    "/LastChange",
    "/RawDataId",
];

const IMAGE_GALLERY: &str = "ImageGallery";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareConfig {
    pub compare_full: bool,
    pub compare_images: bool,
    /// Extra fields excluded from the diff, as top-level names or JSON pointers.
    #[serde(default)]
    pub fields_to_ignore: Vec<String>,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            compare_full: true,
            compare_images: true,
            fields_to_ignore: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeOutcome {
    pub is_new: bool,
    pub compared: bool,
    pub changed: bool,
    pub image_changed: bool,
    /// Set when full comparison is disabled: the record is written without audit.
    pub force_write: bool,
    pub patch: Option<JsonValue>,
}

impl ChangeOutcome {
    pub fn apply_to(&self, detail: &mut UpdateDetail) {
        detail.objectcompared = u32::from(self.compared);
        detail.objectchanged = u32::from(self.changed);
        detail.objectimagechanged = u32::from(self.image_changed);
        detail.changes = self.patch.clone();
    }

    pub fn requires_write(&self) -> bool {
        self.is_new || self.changed || self.force_write
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    config: CompareConfig,
}

impl ChangeDetector {
    pub fn new(config: CompareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompareConfig {
        &self.config
    }

    pub fn detect(
        &self,
        old: Option<&CanonicalRecord>,
        candidate: &CanonicalRecord,
    ) -> Result<ChangeOutcome, serde_json::Error> {
        let Some(old) = old else {
            return Ok(ChangeOutcome {
                is_new: true,
                changed: true,
                image_changed: candidate.has_images(),
                ..Default::default()
            });
        };

        let image_changed = self.config.compare_images && images_differ(old, candidate)?;

        if !self.config.compare_full {
            return Ok(ChangeOutcome {
                compared: true,
                image_changed,
                force_write: true,
                ..Default::default()
            });
        }

        let mut before = serde_json::to_value(old)?;
        let mut after = serde_json::to_value(candidate)?;
        for pointer in DERIVED_FIELDS
            .iter()
            .map(|p| p.to_string())
            .chain(self.config.fields_to_ignore.iter().map(|f| as_pointer(f)))
        {
            remove_pointer(&mut before, &pointer);
            remove_pointer(&mut after, &pointer);
        }

        let mut ops = Vec::new();
        diff_values("", &before, &after, &mut ops);
        let changed = !ops.is_empty();
        Ok(ChangeOutcome {
            compared: true,
            changed,
            image_changed,
            patch: changed.then(|| JsonValue::Array(ops)),
            ..Default::default()
        })
    }
}

fn images_differ(old: &CanonicalRecord, candidate: &CanonicalRecord) -> Result<bool, serde_json::Error> {
    let before = serde_json::to_value(&old.image_gallery)?;
    let after = serde_json::to_value(&candidate.image_gallery)?;
    Ok(before != after)
}

fn as_pointer(field: &str) -> String {
    if field.starts_with('/') {
        field.to_string()
    } else {
        format!("/{}", escape_token(field))
    }
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn remove_pointer(value: &mut JsonValue, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    if let Some(JsonValue::Object(map)) = value.pointer_mut(parent) {
        map.remove(&unescape_token(last));
    }
}

fn diff_values(path: &str, before: &JsonValue, after: &JsonValue, ops: &mut Vec<JsonValue>) {
    if before == after {
        return;
    }
    match (before, after) {
        (JsonValue::Object(old), JsonValue::Object(new)) => {
            for (key, old_value) in old {
                let child = format!("{path}/{}", escape_token(key));
                match new.get(key) {
                    Some(new_value) => diff_values(&child, old_value, new_value, ops),
                    None => ops.push(json!({ "op": "remove", "path": child })),
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    let child = format!("{path}/{}", escape_token(key));
                    ops.push(json!({ "op": "add", "path": child, "value": new_value }));
                }
            }
        }
        (JsonValue::Array(old), JsonValue::Array(new)) if old.len() == new.len() => {
            for (index, (old_value, new_value)) in old.iter().zip(new).enumerate() {
                diff_values(&format!("{path}/{index}"), old_value, new_value, ops);
            }
        }
        _ => ops.push(json!({ "op": "replace", "path": path, "value": after })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tdh_core::ImageGalleryItem;

    fn record() -> CanonicalRecord {
        let mut record = CanonicalRecord::new("A1", "lts", "odhactivitypoi");
        record.tag_ids.insert("hiking".into());
        record.image_gallery.push(ImageGalleryItem {
            image_url: "https://img.example/a.jpg".into(),
            ..Default::default()
        });
        record
    }

    #[test]
    fn new_records_count_as_changed_without_a_patch() {
        let outcome = ChangeDetector::default().detect(None, &record()).expect("detect");
        assert!(outcome.is_new && outcome.changed && outcome.image_changed);
        assert!(!outcome.compared);
        assert!(outcome.patch.is_none());

        let mut detail = UpdateDetail::default();
        outcome.apply_to(&mut detail);
        assert_eq!((detail.objectchanged, detail.objectimagechanged, detail.objectcompared), (1, 1, 0));
    }

    #[test]
    fn derived_field_changes_are_not_material() {
        let old = record();
        let mut candidate = old.clone();
        candidate.published_on = vec!["idm-marketplace".into()];
        candidate.meta.last_update = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single();
        candidate.last_change = candidate.meta.last_update;

        let outcome = ChangeDetector::default().detect(Some(&old), &candidate).expect("detect");
        assert!(outcome.compared);
        assert!(!outcome.changed);
        assert!(!outcome.image_changed);
        assert!(!outcome.requires_write());
    }

    #[test]
    fn image_url_change_flags_both_counters_and_emits_patch() {
        let old = record();
        let mut candidate = old.clone();
        candidate.image_gallery[0].image_url = "https://img.example/b.jpg".into();

        let outcome = ChangeDetector::default().detect(Some(&old), &candidate).expect("detect");
        assert!(outcome.changed && outcome.image_changed);
        assert_eq!(
            outcome.patch,
            Some(json!([{
                "op": "replace",
                "path": "/ImageGallery/0/ImageUrl",
                "value": "https://img.example/b.jpg"
            }]))
        );
    }

    #[test]
    fn disabled_full_compare_forces_a_write_but_still_reports_images() {
        let detector = ChangeDetector::new(CompareConfig {
            compare_full: false,
            ..Default::default()
        });
        let old = record();
        let mut candidate = old.clone();
        candidate.image_gallery.clear();
        candidate.active = false;

        let outcome = detector.detect(Some(&old), &candidate).expect("detect");
        assert!(outcome.compared && outcome.force_write);
        assert!(!outcome.changed);
        assert!(outcome.image_changed);
        assert!(outcome.patch.is_none());
    }

    #[test]
    fn ignored_fields_and_image_compare_toggle() {
        let detector = ChangeDetector::new(CompareConfig {
            compare_images: false,
            fields_to_ignore: vec![IMAGE_GALLERY.into(), "/_Meta/Reduced".into()],
            ..Default::default()
        });
        let old = record();
        let mut candidate = old.clone();
        candidate.image_gallery.clear();
        candidate.meta.reduced = true;

        let outcome = detector.detect(Some(&old), &candidate).expect("detect");
        assert!(!outcome.changed);
        assert!(!outcome.image_changed);
    }

    #[test]
    fn patch_lists_added_and_removed_keys_in_key_order() {
        let old = record();
        let mut candidate = old.clone();
        candidate.detail.insert("en".into(), json!({ "Title": "Castle" }));
        candidate.tag_ids.insert("biking".into());

        let patch = ChangeDetector::default()
            .detect(Some(&old), &candidate)
            .expect("detect")
            .patch
            .expect("patch");
        let paths = patch
            .as_array()
            .expect("array")
            .iter()
            .map(|op| op["path"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["/Detail/en", "/TagIds"]);
    }
}
