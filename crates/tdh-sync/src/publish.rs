//! PublishedOn recomputation from `rules/publish.yaml`.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tdh_core::CanonicalRecord;

fn default_true() -> bool {
    true
}

/// One channel and the conditions a record must meet to be published on it.
/// Empty lists match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRule {
    pub channel: String,
    #[serde(default)]
    pub record_types: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_true")]
    pub require_active: bool,
    #[serde(default)]
    pub require_tags_any: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub exclude_reduced: bool,
}

impl PublishRule {
    pub fn matches(&self, record: &CanonicalRecord) -> bool {
        if self.require_active && !record.active {
            return false;
        }
        if self.exclude_reduced && record.is_reduced() {
            return false;
        }
        if !self.record_types.is_empty() && !self.record_types.iter().any(|t| t == record.record_type()) {
            return false;
        }
        let source = if record.meta.source.is_empty() {
            &record.source
        } else {
            &record.meta.source
        };
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s.eq_ignore_ascii_case(source)) {
            return false;
        }
        let has_tag = |tag: &String| record.tag_ids.contains(tag) || record.tag(tag).is_some();
        if self.exclude_tags.iter().any(has_tag) {
            return false;
        }
        self.require_tags_any.is_empty() || self.require_tags_any.iter().any(has_tag)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PublishRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<PublishRule>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishedOnRules {
    rules: Vec<PublishRule>,
}

impl PublishedOnRules {
    pub fn new(rules: Vec<PublishRule>) -> Self {
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: PublishRulesFile = serde_yaml::from_str(text).context("parsing publish rules")?;
        Ok(Self::new(file.rules))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("publish.yaml");
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn rules(&self) -> &[PublishRule] {
        &self.rules
    }

    /// Sorted, deduplicated channel list the record qualifies for.
    pub fn compute(&self, record: &CanonicalRecord) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(record))
            .map(|rule| rule.channel.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn apply(&self, record: &mut CanonicalRecord) {
        record.published_on = self.compute(record);
    }
}
