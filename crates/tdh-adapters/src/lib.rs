//! Source adapter contract and the generic JSON feed adapter.
//!
//! Provider-specific decoding lives outside this workspace; every adapter only
//! has to hand the sync pipeline [`CandidateRecord`]s in the canonical shape.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tdh_core::{CandidateRecord, CanonicalRecord, RawPayload, TagEntryDirective};
use tdh_storage::HttpClient;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tdh-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed for {source_id}: {message}")]
    Fetch { source_id: String, message: String },
    #[error("payload of {source_id} is not valid: {message}")]
    Parse { source_id: String, message: String },
    #[error("item rejected: {0}")]
    InvalidItem(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The minimal contract every provider importer implements.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn record_type(&self) -> &str;

    async fn fetch(&self, ctx: &AdapterContext) -> Result<RawPayload, AdapterError>;

    fn parse(&self, payload: &RawPayload) -> Result<Vec<JsonValue>, AdapterError>;

    fn to_canonical(&self, item: JsonValue) -> Result<CandidateRecord, AdapterError>;
}

/// Where a JSON feed is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FeedLocation {
    Fixture { path: PathBuf },
    Http { url: String },
}

/// On-disk fixture: a captured feed plus its capture metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<JsonValue>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> anyhow::Result<FixtureBundle> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Adapter for feeds that already deliver items in the canonical JSON shape,
/// with `AdditionalProperties` keyed by discriminator and optional
/// `TagEntries` editorial directives.
pub struct JsonFeedAdapter {
    source_id: String,
    record_type: String,
    location: FeedLocation,
    http: Option<Arc<HttpClient>>,
}

impl JsonFeedAdapter {
    pub fn new(source_id: impl Into<String>, record_type: impl Into<String>, location: FeedLocation) -> Self {
        Self {
            source_id: source_id.into(),
            record_type: record_type.into(),
            location,
            http: None,
        }
    }

    pub fn with_http(mut self, http: Arc<HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    fn parse_error(&self, message: impl Into<String>) -> AdapterError {
        AdapterError::Parse {
            source_id: self.source_id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn record_type(&self) -> &str {
        &self.record_type
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<RawPayload, AdapterError> {
        match &self.location {
            FeedLocation::Fixture { path } => {
                let payload = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading fixture {}", path.display()))?;
                let captured_at = serde_json::from_str::<FixtureBundle>(&payload)
                    .map(|b| b.fetched_at)
                    .unwrap_or(ctx.started_at);
                Ok(RawPayload {
                    datasource: self.source_id.clone(),
                    source_id: path.display().to_string(),
                    content_type: "application/json".into(),
                    payload,
                    captured_at,
                })
            }
            FeedLocation::Http { url } => {
                let http = self.http.as_ref().ok_or_else(|| AdapterError::Fetch {
                    source_id: self.source_id.clone(),
                    message: "no http client configured".into(),
                })?;
                let resp = http
                    .fetch_bytes(&self.source_id, url)
                    .await
                    .map_err(|e| AdapterError::Fetch {
                        source_id: self.source_id.clone(),
                        message: e.to_string(),
                    })?;
                Ok(RawPayload {
                    datasource: self.source_id.clone(),
                    source_id: resp.final_url,
                    content_type: resp.content_type.unwrap_or_else(|| "application/json".into()),
                    payload: String::from_utf8_lossy(&resp.body).into_owned(),
                    captured_at: Utc::now(),
                })
            }
        }
    }

    fn parse(&self, payload: &RawPayload) -> Result<Vec<JsonValue>, AdapterError> {
        let document: JsonValue =
            serde_json::from_str(&payload.payload).map_err(|e| self.parse_error(e.to_string()))?;
        match document {
            JsonValue::Array(items) => Ok(items),
            JsonValue::Object(mut obj) => match obj.remove("items") {
                Some(JsonValue::Array(items)) => Ok(items),
                _ => Err(self.parse_error("expected an array or an object with an `items` array")),
            },
            _ => Err(self.parse_error("expected an array or an object with an `items` array")),
        }
    }

    fn to_canonical(&self, item: JsonValue) -> Result<CandidateRecord, AdapterError> {
        let JsonValue::Object(mut obj) = item else {
            return Err(AdapterError::InvalidItem("item is not a JSON object".into()));
        };

        let raw_additional_properties = take_object(&mut obj, "AdditionalProperties")?;
        let tag_entries: BTreeMap<String, TagEntryDirective> = match obj.remove("TagEntries") {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| AdapterError::InvalidItem(format!("TagEntries: {e}")))?,
            None => BTreeMap::new(),
        };
        // derived on import, never taken from the feed
        obj.remove("PublishedOn");
        obj.remove("Tags");
        obj.entry("Active").or_insert(JsonValue::Bool(true));
        obj.entry("Source")
            .or_insert_with(|| JsonValue::String(self.source_id.clone()));

        let provider_id = match obj.get("Id") {
            Some(JsonValue::String(id)) if !id.trim().is_empty() => id.clone(),
            _ => return Err(AdapterError::InvalidItem("missing `Id`".into())),
        };

        let mut record: CanonicalRecord = serde_json::from_value(JsonValue::Object(obj))
            .map_err(|e| AdapterError::InvalidItem(format!("{provider_id}: {e}")))?;

        if record.source.is_empty() {
            record.source = self.source_id.clone();
        }
        if record.meta.source.is_empty() {
            record.meta.source = record.source.clone();
        }
        if record.meta.record_type.is_empty() {
            record.meta.record_type = self.record_type.clone();
        }
        record
            .mapping
            .entry(self.source_id.clone())
            .or_default()
            .insert("id".into(), provider_id);

        Ok(CandidateRecord {
            record,
            raw_additional_properties,
            tag_entries,
        })
    }
}

fn take_object(
    obj: &mut JsonMap<String, JsonValue>,
    key: &str,
) -> Result<BTreeMap<String, JsonValue>, AdapterError> {
    match obj.remove(key) {
        None | Some(JsonValue::Null) => Ok(BTreeMap::new()),
        Some(JsonValue::Object(map)) => Ok(map.into_iter().collect()),
        Some(_) => Err(AdapterError::InvalidItem(format!("`{key}` must be an object"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn adapter() -> JsonFeedAdapter {
        JsonFeedAdapter::new(
            "suedtirolwein",
            "odhactivitypoi",
            FeedLocation::Fixture {
                path: PathBuf::from("unused.json"),
            },
        )
    }

    #[test]
    fn to_canonical_splits_properties_and_directives() {
        let candidate = adapter()
            .to_canonical(json!({
                "Id": "w-17",
                "TagIds": ["winery", "lts.hiking"],
                "PublishedOn": ["should-be-dropped"],
                "AdditionalProperties": { "PoiAgeDataProperties": { "AgeFrom": 18 } },
                "TagEntries": { "winery": { "action": "clear" } }
            }))
            .expect("candidate");

        let record = &candidate.record;
        assert_eq!(record.source, "suedtirolwein");
        assert_eq!(record.record_type(), "odhactivitypoi");
        assert!(record.active);
        assert!(record.published_on.is_empty());
        assert_eq!(record.mapping["suedtirolwein"]["id"], "w-17");
        assert!(candidate.raw_additional_properties.contains_key("PoiAgeDataProperties"));
        assert_eq!(candidate.tag_entries["winery"], TagEntryDirective::Clear);
    }

    #[test]
    fn items_without_id_are_rejected() {
        let err = adapter().to_canonical(json!({ "Source": "x" })).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidItem(_)));
    }

    #[tokio::test]
    async fn fixture_feed_fetches_and_parses_items() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            "{}",
            json!({
                "fixture_id": "wine-sample",
                "captured_from_url": "https://example.org/wine",
                "fetched_at": "2026-02-24T12:00:00Z",
                "items": [{ "Id": "a" }, { "Id": "b" }]
            })
        )
        .expect("write fixture");

        let adapter = JsonFeedAdapter::new(
            "suedtirolwein",
            "odhactivitypoi",
            FeedLocation::Fixture {
                path: file.path().to_path_buf(),
            },
        );
        let payload = adapter.fetch(&AdapterContext::new()).await.expect("fetch");
        assert_eq!(payload.captured_at.to_rfc3339(), "2026-02-24T12:00:00+00:00");
        let items = adapter.parse(&payload).expect("parse");
        assert_eq!(items.len(), 2);
    }
}
