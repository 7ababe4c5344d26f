//! Cron-driven sync runs and retry passes.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::CancelFlag;
use crate::service::SyncService;

/// `None` unless the scheduler is enabled. Crons use six fields, seconds first.
pub async fn maybe_build_scheduler(service: Arc<SyncService>) -> Result<Option<JobScheduler>> {
    if !service.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_cron = service.config().sync_cron.clone();
    let sync_service = service.clone();
    let sync_job = Job::new_async(sync_cron.as_str(), move |_uuid, _l| {
        let service = sync_service.clone();
        Box::pin(async move {
            match service.run_once(&CancelFlag::new()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    sources = summary.sources.len(),
                    success = summary.success(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {sync_cron}"))?;
    sched.add(sync_job).await.context("adding sync job")?;

    let retry_cron = service.config().retry_cron.clone();
    let retry_service = service.clone();
    let retry_job = Job::new_async(retry_cron.as_str(), move |_uuid, _l| {
        let service = retry_service.clone();
        Box::pin(async move {
            match service.retry_pass().await {
                Ok(summary) => info!(
                    attempted = summary.attempted,
                    resolved = summary.resolved,
                    remaining = summary.remaining,
                    "scheduled retry pass finished"
                ),
                Err(err) => error!(error = %err, "scheduled retry pass failed"),
            }
        })
    })
    .with_context(|| format!("creating retry job for cron {retry_cron}"))?;
    sched.add(retry_job).await.context("adding retry job")?;

    info!(sync_cron = %sync_cron, retry_cron = %retry_cron, "scheduler configured");
    Ok(Some(sched))
}
