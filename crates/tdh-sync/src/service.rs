//! Wires stores, channels, the retry worker and the pipeline from
//! [`SyncConfig`] and the workspace registries.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tdh_adapters::JsonFeedAdapter;
use tdh_core::{CatalogueTag, RetryQueueEntry};
use tdh_storage::{
    DocumentStore, FileRawStore, HttpClient, HttpClientConfig, InMemoryDocumentStore, InMemoryTagCatalogue,
    PgDocumentStore, PgTagCatalogue, TagCatalogue,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{load_channel_registry, load_source_registry, SourceConfig, SourceRegistry, SyncConfig};
use crate::notify::{ChannelRegistry, NotificationDispatcher};
use crate::pipeline::{BatchOutcome, CancelFlag, PipelineOptions, RunOptions, SyncPipeline};
use crate::publish::PublishedOnRules;
use crate::report::write_run_reports;
use crate::retry::{RetryPassSummary, RetryWorker};

#[derive(Debug, Clone, Serialize)]
pub struct SourceRun {
    pub source_id: String,
    pub record_type: String,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRun>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl SyncRunSummary {
    pub fn success(&self) -> bool {
        self.sources.iter().all(|s| s.outcome.result.success)
    }
}

pub struct SyncService {
    config: SyncConfig,
    sources: SourceRegistry,
    pipeline: SyncPipeline,
    http: Arc<HttpClient>,
    _retry_task: JoinHandle<()>,
}

impl SyncService {
    /// Postgres stores when `DATABASE_URL` is set, in-memory stores otherwise.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let sources = load_source_registry(&config.workspace_root).await?;
        let rules = PublishedOnRules::from_workspace_root(&config.workspace_root)?;
        let http = Arc::new(build_http(&config)?);
        let channels = ChannelRegistry::from_configs(&load_channel_registry(&config.workspace_root).await?, http.clone());

        let (store, catalogue): (Arc<dyn DocumentStore>, Arc<dyn TagCatalogue>) = match &config.database_url {
            Some(url) => {
                let store = PgDocumentStore::connect(url, config.document_table.clone())
                    .await
                    .context("connecting document store")?;
                store.ensure_table().await.context("preparing document table")?;
                let catalogue = PgTagCatalogue::new(store.pool().clone(), config.tag_table.clone())?;
                (Arc::new(store), Arc::new(catalogue))
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory stores");
                let seed = load_catalogue_seed(&config.workspace_root).await?;
                (
                    Arc::new(InMemoryDocumentStore::new()),
                    Arc::new(InMemoryTagCatalogue::new(seed)),
                )
            }
        };

        Self::with_parts(config, sources, store, catalogue, channels, rules, http).await
    }

    pub async fn with_parts(
        config: SyncConfig,
        sources: SourceRegistry,
        store: Arc<dyn DocumentStore>,
        catalogue: Arc<dyn TagCatalogue>,
        channels: ChannelRegistry,
        rules: PublishedOnRules,
        http: Arc<HttpClient>,
    ) -> Result<Self> {
        info!(channels = channels.len(), sources = sources.sources.len(), "starting sync service");
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(channels),
            config.push_origin.clone(),
            config.push_timeout,
        ));
        let queue_path = config.retry_queue_path.as_deref().map(|p| config.resolve(p));
        let (retry, retry_task) = RetryWorker::spawn_from_path(queue_path, config.retry, dispatcher.clone()).await?;
        let raw_store = Arc::new(FileRawStore::new(config.resolve(&config.raw_store_dir)));

        let pipeline = SyncPipeline::new(
            store,
            catalogue,
            dispatcher,
            retry,
            PipelineOptions {
                id_style: config.id_style,
                record_concurrency: config.record_concurrency,
                operation: "import".to_string(),
                edit: config.edit.clone(),
            },
        )
        .with_rules(rules)
        .with_compare(config.compare.clone())
        .with_preferred_tag_type(config.preferred_tag_type.clone())
        .with_raw_store(raw_store);

        Ok(Self {
            config,
            sources,
            pipeline,
            http,
            _retry_task: retry_task,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    pub fn http(&self) -> &Arc<HttpClient> {
        &self.http
    }

    fn adapter_for(&self, source: &SourceConfig) -> JsonFeedAdapter {
        JsonFeedAdapter::new(
            source.source_id.clone(),
            source.record_type.clone(),
            source.resolved_location(&self.config.workspace_root),
        )
        .with_http(self.http.clone())
    }

    pub async fn sync_source(&self, source_id: &str, cancel: &CancelFlag) -> Result<SourceRun> {
        let Some(source) = self.sources.get(source_id) else {
            bail!("unknown source `{source_id}`");
        };
        if !source.enabled {
            bail!("source `{source_id}` is disabled");
        }
        let adapter = self.adapter_for(source);
        let run = RunOptions {
            removal: source
                .remove_missing
                .then(|| source.delete_policy(&self.config)),
            write: source.write.clone(),
        };
        let outcome = self.pipeline.run_adapter(&adapter, &run, cancel).await;
        Ok(SourceRun {
            source_id: source.source_id.clone(),
            record_type: source.record_type.clone(),
            outcome,
        })
    }

    /// Every enabled source in registry order, followed by the run reports.
    pub async fn run_once(&self, cancel: &CancelFlag) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut runs = Vec::new();
        for source in self.sources.enabled() {
            if cancel.is_cancelled() {
                warn!(source = %source.source_id, "cancelled before source started");
                break;
            }
            runs.push(self.sync_source(&source.source_id, cancel).await?);
        }
        let finished_at = Utc::now();
        let (reports_dir, manifest) =
            write_run_reports(&self.config.workspace_root, run_id, started_at, finished_at, &runs).await?;
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            sources: runs,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest.display().to_string(),
        })
    }

    pub async fn retry_pass(&self) -> Result<RetryPassSummary> {
        Ok(self.pipeline.retry().run_pass().await?)
    }

    pub async fn retry_queue(&self) -> Result<Vec<RetryQueueEntry>> {
        Ok(self.pipeline.retry().snapshot().await?)
    }
}

fn build_http(config: &SyncConfig) -> Result<HttpClient> {
    HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

/// Optional `catalogue/tags.json` used to seed the in-memory catalogue.
async fn load_catalogue_seed(workspace_root: &Path) -> Result<Vec<CatalogueTag>> {
    let path = workspace_root.join("catalogue").join("tags.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Builds an [`HttpClient`] from the configuration, for callers assembling
/// a service through [`SyncService::with_parts`].
pub fn http_client(config: &SyncConfig) -> Result<Arc<HttpClient>> {
    Ok(Arc::new(build_http(config)?))
}
