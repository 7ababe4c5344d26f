//! Durable queue of failed channel deliveries and its single-writer worker.
//!
//! The pipeline only ever holds a [`RetryQueueHandle`]; every mutation goes
//! through the worker task, which persists the queue after each change.
//! An enqueue is acknowledged only once the queue is on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tdh_core::{NotifierResponse, RetryQueueEntry, RetryStatus};
use tdh_storage::BackoffPolicy;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::notify::{DispatchRequest, NotificationDispatcher};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempt`-th failed delivery: `base * 2^(attempt-1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        BackoffPolicy {
            max_retries: self.max_attempts as usize,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
        .delay_for_attempt(attempt.saturating_sub(1) as usize)
    }

    pub fn is_due(&self, entry: &RetryQueueEntry, now: DateTime<Utc>) -> bool {
        if entry.status != RetryStatus::Pending {
            return false;
        }
        chrono::Duration::from_std(self.delay_after(entry.attempt))
            .ok()
            .and_then(|delay| entry.last_attempt_time.checked_add_signed(delay))
            .map(|due| now >= due)
            .unwrap_or(false)
    }
}

/// A failed delivery as reported by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryFailure {
    pub channel: String,
    pub record_id: String,
    pub record_type: String,
    pub origin: String,
    pub reason: String,
    pub image_changed: bool,
    pub is_delete: bool,
}

impl RetryFailure {
    pub fn from_response(origin: &str, request: &DispatchRequest, response: &NotifierResponse) -> Self {
        Self {
            channel: response.service.clone(),
            record_id: request.record_id.clone(),
            record_type: request.record_type.clone(),
            origin: origin.to_string(),
            reason: response
                .error
                .clone()
                .unwrap_or_else(|| format!("status {}", response.status)),
            image_changed: request.image_changed,
            is_delete: request.is_delete,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueue {
    entries: Vec<RetryQueueEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RetryQueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == RetryStatus::Pending)
            .count()
    }

    fn position(&self, channel: &str, record_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.channel == channel && e.record_id == record_id)
    }

    /// New failures start at attempt 1; a pending entry for the same
    /// (channel, record) absorbs the failure, an exhausted one is re-armed.
    pub fn enqueue(&mut self, failure: RetryFailure, now: DateTime<Utc>) {
        match self.position(&failure.channel, &failure.record_id) {
            Some(index) => {
                let entry = &mut self.entries[index];
                if entry.status != RetryStatus::Pending {
                    entry.attempt = 1;
                    entry.status = RetryStatus::Pending;
                    entry.created_at = now;
                    entry.image_changed = false;
                }
                entry.reason = failure.reason;
                entry.record_type = failure.record_type;
                entry.origin = failure.origin;
                entry.last_attempt_time = now;
                entry.image_changed |= failure.image_changed;
                entry.is_delete = failure.is_delete;
            }
            None => self.entries.push(RetryQueueEntry {
                channel: failure.channel,
                record_id: failure.record_id,
                record_type: failure.record_type,
                origin: failure.origin,
                reason: failure.reason,
                attempt: 1,
                last_attempt_time: now,
                created_at: now,
                status: RetryStatus::Pending,
                image_changed: failure.image_changed,
                is_delete: failure.is_delete,
            }),
        }
    }

    pub fn due(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> Vec<RetryQueueEntry> {
        self.entries
            .iter()
            .filter(|e| policy.is_due(e, now))
            .cloned()
            .collect()
    }

    /// Removes the entry and returns it marked resolved.
    pub fn resolve(&mut self, channel: &str, record_id: &str) -> Option<RetryQueueEntry> {
        let index = self.position(channel, record_id)?;
        let mut entry = self.entries.remove(index);
        entry.status = RetryStatus::Resolved;
        Some(entry)
    }

    pub fn record_failure(
        &mut self,
        channel: &str,
        record_id: &str,
        reason: String,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Option<RetryQueueEntry> {
        let index = self.position(channel, record_id)?;
        let entry = &mut self.entries[index];
        entry.attempt = entry.attempt.saturating_add(1);
        entry.last_attempt_time = now;
        entry.reason = reason;
        if entry.attempt >= policy.max_attempts {
            entry.status = RetryStatus::Exhausted;
        }
        Some(entry.clone())
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Temp file + rename so a crash never leaves a truncated queue.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serializing retry queue")?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPassSummary {
    pub attempted: usize,
    pub resolved: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub remaining: usize,
    /// Every entry touched by the pass, with its post-pass status.
    pub entries: Vec<RetryQueueEntry>,
}

enum RetryCommand {
    Enqueue(Vec<RetryFailure>, oneshot::Sender<Result<(), String>>),
    RunPass(oneshot::Sender<RetryPassSummary>),
    Snapshot(oneshot::Sender<Vec<RetryQueueEntry>>),
}

/// Cloneable front of the retry worker. Commands are handled in order, so an
/// enqueue may wait behind a running pass.
#[derive(Debug, Clone)]
pub struct RetryQueueHandle {
    tx: mpsc::UnboundedSender<RetryCommand>,
}

impl std::fmt::Debug for RetryCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryCommand::Enqueue(failures, _) => f.debug_tuple("Enqueue").field(&failures.len()).finish(),
            RetryCommand::RunPass(_) => f.write_str("RunPass"),
            RetryCommand::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

impl RetryQueueHandle {
    /// Resolves after the failures are merged and the queue is persisted.
    pub async fn enqueue(&self, failures: Vec<RetryFailure>) -> Result<(), SyncError> {
        if failures.is_empty() {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RetryCommand::Enqueue(failures, reply))
            .map_err(|_| SyncError::RetryWorkerStopped)?;
        rx.await
            .map_err(|_| SyncError::RetryWorkerStopped)?
            .map_err(SyncError::RetryPersist)
    }

    pub async fn run_pass(&self) -> Result<RetryPassSummary, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RetryCommand::RunPass(reply))
            .map_err(|_| SyncError::RetryWorkerStopped)?;
        rx.await.map_err(|_| SyncError::RetryWorkerStopped)
    }

    pub async fn snapshot(&self) -> Result<Vec<RetryQueueEntry>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RetryCommand::Snapshot(reply))
            .map_err(|_| SyncError::RetryWorkerStopped)?;
        rx.await.map_err(|_| SyncError::RetryWorkerStopped)
    }
}

pub struct RetryWorker {
    queue: RetryQueue,
    policy: RetryPolicy,
    path: Option<PathBuf>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl RetryWorker {
    pub fn new(
        queue: RetryQueue,
        policy: RetryPolicy,
        path: Option<PathBuf>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            queue,
            policy,
            path,
            dispatcher,
        }
    }

    /// Reloads a persisted queue (if any) before starting the worker.
    pub async fn spawn_from_path(
        path: Option<PathBuf>,
        policy: RetryPolicy,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> anyhow::Result<(RetryQueueHandle, JoinHandle<()>)> {
        let queue = match &path {
            Some(path) => RetryQueue::load(path).await?,
            None => RetryQueue::new(),
        };
        info!(entries = queue.len(), "retry queue loaded");
        Ok(Self::new(queue, policy, path, dispatcher).spawn())
    }

    pub fn spawn(self) -> (RetryQueueHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (RetryQueueHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RetryCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                RetryCommand::Enqueue(failures, reply) => {
                    let now = Utc::now();
                    for failure in failures {
                        warn!(
                            channel = %failure.channel,
                            record_id = %failure.record_id,
                            reason = %failure.reason,
                            "queued for retry"
                        );
                        self.queue.enqueue(failure, now);
                    }
                    let saved = self.persist().await.map_err(|err| format!("{err:#}"));
                    let _ = reply.send(saved);
                }
                RetryCommand::RunPass(reply) => {
                    let summary = self.run_pass().await;
                    let _ = reply.send(summary);
                }
                RetryCommand::Snapshot(reply) => {
                    let _ = reply.send(self.queue.entries().to_vec());
                }
            }
        }
    }

    async fn run_pass(&mut self) -> RetryPassSummary {
        let due = self.queue.due(&self.policy, Utc::now());
        let mut summary = RetryPassSummary {
            attempted: due.len(),
            ..Default::default()
        };
        for entry in due {
            let message = self.dispatcher.message_for(
                &entry.record_id,
                &entry.record_type,
                entry.image_changed,
                entry.is_delete,
            );
            let response = self.dispatcher.push_one(&entry.channel, &message).await;
            let touched = if response.success {
                summary.resolved += 1;
                self.queue.resolve(&entry.channel, &entry.record_id)
            } else {
                let reason = response
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("status {}", response.status));
                let updated =
                    self.queue
                        .record_failure(&entry.channel, &entry.record_id, reason, &self.policy, Utc::now());
                match updated.as_ref().map(|e| e.status) {
                    Some(RetryStatus::Exhausted) => {
                        warn!(channel = %entry.channel, record_id = %entry.record_id, "retry attempts exhausted");
                        summary.exhausted += 1;
                    }
                    _ => summary.failed += 1,
                }
                updated
            };
            summary.entries.extend(touched);
        }
        summary.remaining = self.queue.pending();
        if summary.attempted > 0 {
            if let Err(err) = self.persist().await {
                warn!(error = %format!("{err:#}"), "failed to persist retry queue after pass");
            }
        }
        info!(
            attempted = summary.attempted,
            resolved = summary.resolved,
            exhausted = summary.exhausted,
            remaining = summary.remaining,
            "retry pass finished"
        );
        summary
    }

    async fn persist(&self) -> anyhow::Result<()> {
        match &self.path {
            Some(path) => self.queue.save(path).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{Behaviour, ScriptedChannel};
    use crate::notify::ChannelRegistry;

    fn failure(channel: &str, record_id: &str, image_changed: bool) -> RetryFailure {
        RetryFailure {
            channel: channel.into(),
            record_id: record_id.into(),
            record_type: "odhactivitypoi".into(),
            origin: "lts.push".into(),
            reason: "status 500".into(),
            image_changed,
            is_delete: false,
        }
    }

    fn immediate() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles_from_the_first_attempt_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(30));
        assert_eq!(policy.delay_after(2), Duration::from_secs(60));
        assert_eq!(policy.delay_after(20), Duration::from_secs(30 * 60));

        let now = Utc::now();
        let mut queue = RetryQueue::new();
        queue.enqueue(failure("B", "A1", false), now);
        assert!(queue.due(&policy, now).is_empty());
        assert_eq!(queue.due(&policy, now + chrono::Duration::seconds(31)).len(), 1);
    }

    #[test]
    fn repeated_failures_merge_into_one_entry() {
        let now = Utc::now();
        let mut queue = RetryQueue::new();
        queue.enqueue(failure("B", "A1", true), now);
        queue.enqueue(failure("B", "A1", false), now);
        queue.enqueue(failure("C", "A1", false), now);
        assert_eq!(queue.len(), 2);
        assert!(queue.entries()[0].image_changed);
        assert_eq!(queue.entries()[0].attempt, 1);
    }

    #[test]
    fn failures_past_max_attempts_exhaust_the_entry() {
        let policy = immediate();
        let now = Utc::now();
        let mut queue = RetryQueue::new();
        queue.enqueue(failure("B", "A1", false), now);
        queue.record_failure("B", "A1", "again".into(), &policy, now);
        let last = queue
            .record_failure("B", "A1", "still".into(), &policy, now)
            .expect("entry");
        assert_eq!(last.status, RetryStatus::Exhausted);
        assert!(queue.due(&policy, now).is_empty());
        assert_eq!(queue.len(), 1);

        queue.enqueue(failure("B", "A1", false), now);
        assert_eq!(queue.entries()[0].status, RetryStatus::Pending);
        assert_eq!(queue.entries()[0].attempt, 1);
    }

    #[tokio::test]
    async fn worker_resolves_on_success_and_persists_the_queue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("retry.json");
        let channel = ScriptedChannel::new("B", Behaviour::Reject(503));
        let mut registry = ChannelRegistry::new();
        registry.register(channel.clone());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(registry),
            "lts.push",
            Duration::from_millis(200),
        ));

        let (handle, _task) = RetryWorker::spawn_from_path(Some(path.clone()), immediate(), dispatcher.clone())
            .await
            .expect("spawn");
        handle.enqueue(vec![failure("B", "A1", true)]).await.expect("enqueue");
        // acknowledged only once the queue is on disk
        assert_eq!(RetryQueue::load(&path).await.expect("load").len(), 1);

        let first = handle.run_pass().await.expect("pass");
        assert_eq!((first.attempted, first.failed, first.remaining), (1, 1, 1));
        assert_eq!(first.entries[0].attempt, 2);

        channel.set_behaviour(Behaviour::Accept);
        let second = handle.run_pass().await.expect("pass");
        assert_eq!(second.resolved, 1);
        assert_eq!(second.entries[0].status, RetryStatus::Resolved);
        assert!(handle.snapshot().await.expect("snapshot").is_empty());
        assert!(channel.received().iter().all(|m| m.imageschanged));

        let persisted = RetryQueue::load(&path).await.expect("load");
        assert!(persisted.is_empty());
    }

    #[tokio::test]
    async fn persisted_queue_is_reloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("retry.json");
        let mut queue = RetryQueue::new();
        queue.enqueue(failure("B", "A1", false), Utc::now());
        queue.save(&path).await.expect("save");

        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(ChannelRegistry::new()),
            "lts.push",
            Duration::from_millis(50),
        ));
        let (handle, _task) = RetryWorker::spawn_from_path(Some(path), RetryPolicy::default(), dispatcher)
            .await
            .expect("spawn");
        let entries = handle.snapshot().await.expect("snapshot");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record_id, "A1");
    }
}
