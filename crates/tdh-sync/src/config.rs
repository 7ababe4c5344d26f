//! Environment configuration and the YAML registries under the workspace root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tdh_adapters::FeedLocation;
use tdh_core::{EditInfo, IdStyle};
use tokio::fs;
use tracing::warn;

use crate::compare::CompareConfig;
use crate::retry::RetryPolicy;
use crate::tags::DEFAULT_PREFERRED_TYPE;
use crate::upsert::{DeletePolicy, FeedKind, WriteRules};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub record_type: String,
    pub location: FeedLocation,
    #[serde(default)]
    pub feed_kind: Option<FeedKind>,
    #[serde(default)]
    pub delete_policy: Option<DeletePolicy>,
    /// Remove stored records of this source that the feed no longer lists.
    #[serde(default)]
    pub remove_missing: bool,
    /// Write mode and CRUD conditions applied to this source's records.
    #[serde(default)]
    pub write: WriteRules,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    /// Source override, then source feed kind, then the global setting.
    pub fn delete_policy(&self, config: &SyncConfig) -> DeletePolicy {
        self.delete_policy
            .or_else(|| self.feed_kind.map(FeedKind::default_delete_policy))
            .unwrap_or(config.delete_policy)
    }

    /// Fixture paths are relative to the workspace root.
    pub fn resolved_location(&self, workspace_root: &Path) -> FeedLocation {
        match &self.location {
            FeedLocation::Fixture { path } if path.is_relative() => FeedLocation::Fixture {
                path: workspace_root.join(path),
            },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelRegistryFile {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// In-memory stores are used when unset.
    pub database_url: Option<String>,
    pub document_table: String,
    pub tag_table: String,
    pub raw_store_dir: PathBuf,
    pub retry_queue_path: Option<PathBuf>,
    pub compare: CompareConfig,
    pub preferred_tag_type: String,
    pub edit: EditInfo,
    pub feed_kind: FeedKind,
    pub delete_policy: DeletePolicy,
    pub id_style: IdStyle,
    pub push_timeout: Duration,
    pub push_origin: String,
    pub record_concurrency: usize,
    pub retry: RetryPolicy,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub retry_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let feed_kind = FeedKind::default();
        Self {
            database_url: None,
            document_table: "records".to_string(),
            tag_table: "tags".to_string(),
            raw_store_dir: PathBuf::from("./raw"),
            retry_queue_path: Some(PathBuf::from("./state/retry_queue.json")),
            compare: CompareConfig::default(),
            preferred_tag_type: DEFAULT_PREFERRED_TYPE.to_string(),
            edit: EditInfo::default(),
            feed_kind,
            delete_policy: feed_kind.default_delete_policy(),
            id_style: IdStyle::default(),
            push_timeout: Duration::from_secs(10),
            push_origin: "tdh.import".to_string(),
            record_concurrency: 8,
            retry: RetryPolicy::default(),
            scheduler_enabled: false,
            sync_cron: "0 0 5 * * *".to_string(),
            retry_cron: "0 */5 * * * *".to_string(),
            user_agent: "tdh-sync/0.1".to_string(),
            http_timeout_secs: 20,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "ignoring unparsable value");
            default
        }),
        Err(_) => default,
    }
}

/// Comma-separated list; blank entries are dropped.
fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn env_with<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(var = name, value = %raw, "ignoring unparsable value");
    }
    parsed
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace_root = std::env::var("TDH_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        let feed_kind = env_with("TDH_FEED_KIND", FeedKind::parse).unwrap_or(defaults.feed_kind);
        let delete_policy =
            env_with("TDH_DELETE_POLICY", DeletePolicy::parse).unwrap_or_else(|| feed_kind.default_delete_policy());
        let retry_queue_path = match std::env::var("TDH_RETRY_QUEUE_PATH") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => defaults.retry_queue_path,
        };

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            document_table: std::env::var("TDH_DOCUMENT_TABLE").unwrap_or(defaults.document_table),
            tag_table: std::env::var("TDH_TAG_TABLE").unwrap_or(defaults.tag_table),
            raw_store_dir: std::env::var("TDH_RAW_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.raw_store_dir),
            retry_queue_path,
            compare: CompareConfig {
                compare_full: env_flag("TDH_COMPARE_FULL", defaults.compare.compare_full),
                compare_images: env_flag("TDH_COMPARE_IMAGES", defaults.compare.compare_images),
                fields_to_ignore: env_list("TDH_COMPARE_IGNORE").unwrap_or(defaults.compare.fields_to_ignore),
            },
            preferred_tag_type: std::env::var("TDH_PREFERRED_TAG_TYPE").unwrap_or(defaults.preferred_tag_type),
            edit: EditInfo {
                editor: std::env::var("TDH_EDITOR").unwrap_or(defaults.edit.editor),
                source: std::env::var("TDH_EDIT_SOURCE").unwrap_or(defaults.edit.source),
            },
            feed_kind,
            delete_policy,
            id_style: env_with("TDH_ID_STYLE", IdStyle::parse).unwrap_or(defaults.id_style),
            push_timeout: Duration::from_millis(env_parse(
                "TDH_PUSH_TIMEOUT_MS",
                defaults.push_timeout.as_millis() as u64,
            )),
            push_origin: std::env::var("TDH_PUSH_ORIGIN").unwrap_or(defaults.push_origin),
            record_concurrency: env_parse("TDH_RECORD_CONCURRENCY", defaults.record_concurrency).max(1),
            retry: RetryPolicy {
                max_attempts: env_parse("TDH_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts).max(1),
                base_delay: Duration::from_secs(env_parse(
                    "TDH_RETRY_BASE_SECS",
                    defaults.retry.base_delay.as_secs(),
                )),
                max_delay: Duration::from_secs(env_parse("TDH_RETRY_MAX_SECS", defaults.retry.max_delay.as_secs())),
            },
            scheduler_enabled: env_flag("TDH_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            retry_cron: std::env::var("RETRY_CRON").unwrap_or(defaults.retry_cron),
            user_agent: std::env::var("TDH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("TDH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            workspace_root,
        }
    }

    /// Relative store paths are anchored at the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.workspace_root.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// A missing `channels.yaml` means no push channels.
pub async fn load_channel_registry(workspace_root: &Path) -> Result<Vec<ChannelConfig>> {
    let path = workspace_root.join("channels.yaml");
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no channel registry, pushes disabled");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let file: ChannelRegistryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES: &str = r#"
sources:
  - source_id: suedtirolwein
    display_name: Suedtirol Wein
    enabled: true
    record_type: odhactivitypoi
    feed_kind: closed
    remove_missing: true
    location:
      mode: fixture
      path: fixtures/suedtirolwein/sample.json
  - source_id: lts
    display_name: LTS
    enabled: false
    record_type: event
    delete_policy: soft_disable
    write:
      mode: update_only
      constraints:
        delete:
          sources: [lts]
    location:
      mode: http
      url: https://lts.example/events
"#;

    #[tokio::test]
    async fn registries_load_from_workspace_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("sources.yaml"), SOURCES).expect("write sources");
        std::fs::write(
            dir.path().join("channels.yaml"),
            "channels:\n  - name: idm-marketplace\n    url: http://push.example/mp\n  - name: off\n    url: http://x\n    enabled: false\n",
        )
        .expect("write channels");

        let registry = load_source_registry(dir.path()).await.expect("sources");
        assert_eq!(registry.enabled().count(), 1);
        let wine = registry.get("suedtirolwein").expect("wine");
        let config = SyncConfig::default();
        assert_eq!(wine.delete_policy(&config), DeletePolicy::SoftDisable);
        assert_eq!(
            wine.resolved_location(dir.path()),
            FeedLocation::Fixture {
                path: dir.path().join("fixtures/suedtirolwein/sample.json")
            }
        );
        let lts = registry.get("lts").expect("lts");
        assert_eq!(lts.delete_policy(&config), DeletePolicy::SoftDisable);
        assert_eq!(lts.write.mode, crate::upsert::WriteMode::UpdateOnly);
        assert!(lts.write.constraints.create.is_none());
        assert_eq!(
            lts.write.constraints.delete.as_ref().map(|c| c.sources.clone()),
            Some(vec!["lts".to_string()])
        );
        assert_eq!(wine.write, WriteRules::default());

        let channels = load_channel_registry(dir.path()).await.expect("channels");
        assert_eq!(channels.len(), 2);
        assert!(channels[0].enabled && !channels[1].enabled);
    }

    #[tokio::test]
    async fn missing_channel_file_means_no_channels() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_channel_registry(dir.path()).await.expect("channels").is_empty());
    }

    #[test]
    fn defaults_follow_the_open_feed_policy() {
        let config = SyncConfig::default();
        assert_eq!(config.delete_policy, DeletePolicy::HardDelete);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.compare.compare_full);
        assert_eq!(config.resolve(Path::new("raw")), PathBuf::from("./raw"));
        assert_eq!(config.preferred_tag_type, "ltscategory");
        assert_eq!(config.edit, EditInfo::default());
    }

    #[test]
    fn list_variables_split_on_commas() {
        std::env::set_var("TDH_TEST_IGNORE_LIST", " ImageGallery, ,/_Meta/Reduced ");
        assert_eq!(
            env_list("TDH_TEST_IGNORE_LIST"),
            Some(vec!["ImageGallery".to_string(), "/_Meta/Reduced".to_string()])
        );
        assert_eq!(env_list("TDH_TEST_UNSET_LIST"), None);
    }
}
