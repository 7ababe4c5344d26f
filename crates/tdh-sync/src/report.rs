//! Run reports: JSON results, a markdown summary and parquet snapshots with
//! a checksummed manifest, all under `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tdh_core::UpdateDetail;
use tokio::fs;
use uuid::Uuid;

use crate::service::SourceRun;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Returns the run directory and the manifest path.
pub async fn write_run_reports(
    workspace_root: &Path,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    runs: &[SourceRun],
) -> Result<(PathBuf, PathBuf)> {
    let reports_dir = workspace_root.join("reports").join(run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let results = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": run_id,
        "started_at": started_at,
        "finished_at": finished_at,
        "results": runs.iter().map(|r| &r.outcome.result).collect::<Vec<_>>(),
    }))
    .context("serializing update results")?;
    fs::write(reports_dir.join("update_result.json"), results)
        .await
        .context("writing update_result.json")?;

    fs::write(
        reports_dir.join("summary.md"),
        summary_markdown(run_id, started_at, finished_at, runs),
    )
    .await
    .context("writing summary.md")?;

    let manifest_path = export_parquet_snapshots(&reports_dir, runs).await?;
    Ok((reports_dir, manifest_path))
}

fn summary_markdown(run_id: Uuid, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, runs: &[SourceRun]) -> String {
    let rows = runs
        .iter()
        .map(|run| {
            let r = &run.outcome.result;
            format!(
                "- {}: {} created, {} updated, {} deleted, {} errors{}",
                run.source_id,
                r.created,
                r.updated,
                r.deleted,
                r.error,
                if r.success { "" } else { " (failed)" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Sync Run\n\n- Run ID: `{run_id}`\n- Started: {started_at}\n- Finished: {finished_at}\n- Sources: {}\n\n## Results\n{rows}\n",
        runs.len()
    )
}

async fn export_parquet_snapshots(reports_dir: &Path, runs: &[SourceRun]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let outcomes_path = snapshot_dir.join("record_outcomes.parquet");
    let sources_path = snapshot_dir.join("source_results.parquet");
    write_record_outcomes_parquet(&outcomes_path, runs)?;
    write_source_results_parquet(&sources_path, runs)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("record_outcomes", reports_dir, &outcomes_path)?,
            manifest_entry("source_results", reports_dir, &sources_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Markdown digest of the most recent `runs` report directories.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Sync Report".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let results_path = dir.path().join("update_result.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&results_path).with_context(|| format!("reading {}", results_path.display()))?,
        )
        .with_context(|| format!("parsing {}", results_path.display()))?;
        let results = value
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        lines.push(format!("## Run `{run_id}`"));
        for result in &results {
            let count = |key: &str| result.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
            lines.push(format!(
                "- {}: {} created, {} updated, {} deleted, {} errors",
                result.get("source").and_then(|v| v.as_str()).unwrap_or("unknown"),
                count("created"),
                count("updated"),
                count("deleted"),
                count("error"),
            ));
        }
        lines.push(format!("- results: `{}`", results_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_record_outcomes_parquet(path: &Path, runs: &[SourceRun]) -> Result<()> {
    let rows = runs
        .iter()
        .flat_map(|run| run.outcome.details.iter().map(move |d| (run.source_id.as_str(), d)))
        .collect::<Vec<_>>();
    let counter = |f: fn(&UpdateDetail) -> u32| UInt32Array::from(rows.iter().map(|(_, d)| f(d)).collect::<Vec<_>>());

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("record_type", DataType::Utf8, false),
        ArrowField::new("operation", DataType::Utf8, false),
        ArrowField::new("created", DataType::UInt32, false),
        ArrowField::new("updated", DataType::UInt32, false),
        ArrowField::new("deleted", DataType::UInt32, false),
        ArrowField::new("error", DataType::UInt32, false),
        ArrowField::new("objectchanged", DataType::UInt32, false),
        ArrowField::new("objectimagechanged", DataType::UInt32, false),
        ArrowField::new("push_failures", DataType::UInt32, false),
        ArrowField::new("exception", DataType::Utf8, true),
    ]));

    let source_ids = StringArray::from(rows.iter().map(|(s, _)| Some(*s)).collect::<Vec<_>>());
    let record_ids = StringArray::from(rows.iter().map(|(_, d)| Some(d.id.as_str())).collect::<Vec<_>>());
    let record_types = StringArray::from(rows.iter().map(|(_, d)| Some(d.record_type.as_str())).collect::<Vec<_>>());
    let operations = StringArray::from(rows.iter().map(|(_, d)| Some(d.operation.as_str())).collect::<Vec<_>>());
    let push_failures = counter(|d| d.pushed.values().filter(|r| !r.success).count() as u32);
    let exceptions = StringArray::from(rows.iter().map(|(_, d)| d.exception.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(record_ids),
            Arc::new(record_types),
            Arc::new(operations),
            Arc::new(counter(|d| d.created)),
            Arc::new(counter(|d| d.updated)),
            Arc::new(counter(|d| d.deleted)),
            Arc::new(counter(|d| d.error)),
            Arc::new(counter(|d| d.objectchanged)),
            Arc::new(counter(|d| d.objectimagechanged)),
            Arc::new(push_failures),
            Arc::new(exceptions),
        ],
    )
    .context("building record_outcomes record batch")?;
    write_parquet(path, batch)
}

fn write_source_results_parquet(path: &Path, runs: &[SourceRun]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("record_type", DataType::Utf8, false),
        ArrowField::new("recordsmodified", DataType::UInt32, false),
        ArrowField::new("error", DataType::UInt32, false),
        ArrowField::new("success", DataType::Boolean, false),
        ArrowField::new("exception", DataType::Utf8, true),
    ]));

    let source_ids = StringArray::from(runs.iter().map(|r| Some(r.source_id.as_str())).collect::<Vec<_>>());
    let record_types = StringArray::from(runs.iter().map(|r| Some(r.record_type.as_str())).collect::<Vec<_>>());
    let modified = UInt32Array::from(runs.iter().map(|r| r.outcome.result.recordsmodified).collect::<Vec<_>>());
    let errors = UInt32Array::from(runs.iter().map(|r| r.outcome.result.error).collect::<Vec<_>>());
    let success = BooleanArray::from(runs.iter().map(|r| r.outcome.result.success).collect::<Vec<_>>());
    let exceptions = StringArray::from(
        runs.iter()
            .map(|r| Some(r.outcome.result.exception.as_str()).filter(|e| !e.is_empty()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(record_types),
            Arc::new(modified),
            Arc::new(errors),
            Arc::new(success),
            Arc::new(exceptions),
        ],
    )
    .context("building source_results record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(reports_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
