//! Bulk applicant export.
//!
//! Fetches applicant rows, writes them to a CSV file under the export
//! directory and reports progress along the way so the requester can poll
//! the job while a large export runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use admissions_cache::clock;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Job, JobProgress};
use crate::worker::{JobContext, JobHandler};

/// One applicant as a flat column -> value map.
pub type ApplicantRow = Map<String, Value>;

/// Read side of the applicant database.
#[async_trait]
pub trait ApplicantSource: Send + Sync {
    /// All applicants, or only those referred by `mobilizer_id`.
    async fn fetch_applicants(&self, mobilizer_id: Option<&str>)
    -> anyhow::Result<Vec<ApplicantRow>>;
}

/// Payload of an export job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(default)]
    pub mobilizer_id: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub requested_at: Option<String>,
}

impl ExportRequest {
    /// Queue priority; full exports are served before mobilizer-scoped ones.
    pub fn priority(&self) -> u32 {
        if self.mobilizer_id.is_some() { 5 } else { 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportResult {
    download_link: Option<String>,
    file_name: Option<String>,
    message: String,
    record_count: usize,
}

pub struct ExportHandler {
    source: Arc<dyn ApplicantSource>,
    output_dir: PathBuf,
    /// URL prefix the output directory is served under
    download_base: String,
}

impl ExportHandler {
    pub fn new(source: Arc<dyn ApplicantSource>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            output_dir: output_dir.into(),
            download_base: "/exports".to_string(),
        }
    }

    pub fn with_download_base(mut self, base: impl Into<String>) -> Self {
        self.download_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn file_name(request: &ExportRequest) -> String {
        let timestamp = clock::now_millis();
        if request.mobilizer_id.is_some() {
            format!("mobilizer_applicants_export_{timestamp}.csv")
        } else {
            format!("applicant_data_export_{timestamp}.csv")
        }
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> anyhow::Result<Value> {
        let request: ExportRequest =
            serde_json::from_value(job.payload.clone()).context("invalid export request")?;
        tracing::info!(
            job_id = %job.id,
            mobilizer_id = ?request.mobilizer_id,
            requested_by = ?request.requested_by,
            "Processing export job"
        );

        ctx.report_progress(&JobProgress::new(
            "connecting",
            5,
            &["Connecting to database..."],
        ))
        .await;
        ctx.report_progress(&JobProgress::new(
            "querying",
            10,
            &["Connected to database", "Fetching applicant data..."],
        ))
        .await;

        let rows = self
            .source
            .fetch_applicants(request.mobilizer_id.as_deref())
            .await
            .context("failed to fetch applicants")?;

        let fetched = format!("Data fetched: {} records", rows.len());
        ctx.report_progress(&JobProgress::new(
            "processing",
            30,
            &[fetched.as_str(), "Creating export file..."],
        ))
        .await;

        if rows.is_empty() {
            return Ok(serde_json::to_value(ExportResult {
                download_link: None,
                file_name: None,
                message: "No data found".to_string(),
                record_count: 0,
            })?);
        }

        let record_count = rows.len();
        let file_name = Self::file_name(&request);
        let path = self.output_dir.join(&file_name);
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;

        ctx.report_progress(&JobProgress::new(
            "processing",
            50,
            &["Rows prepared", "Writing columns..."],
        ))
        .await;
        ctx.report_progress(&JobProgress::new(
            "saving",
            80,
            &["Export file created", "Saving to disk..."],
        ))
        .await;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_csv(&target, &rows))
            .await
            .context("export writer panicked")??;

        ctx.report_progress(&JobProgress::new(
            "completed",
            100,
            &["Export completed successfully!"],
        ))
        .await;
        tracing::info!(job_id = %job.id, path = %path.display(), record_count, "Export written");

        Ok(serde_json::to_value(ExportResult {
            download_link: Some(format!("{}/{file_name}", self.download_base)),
            file_name: Some(file_name),
            message: "Export completed successfully".to_string(),
            record_count,
        })?)
    }
}

/// Columns in first-seen order across all rows.
fn columns(rows: &[ApplicantRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write to a sibling temp file, then rename so readers never see a partial export.
fn write_csv(path: &Path, rows: &[ApplicantRow]) -> anyhow::Result<()> {
    let partial = path.with_extension("csv.part");
    let columns = columns(rows);
    let mut writer = csv::Writer::from_path(&partial)
        .with_context(|| format!("failed to create {}", partial.display()))?;
    writer.write_record(&columns)?;
    for row in rows {
        writer.write_record(columns.iter().map(|column| cell(row.get(column))))?;
    }
    writer.flush()?;
    drop(writer);
    std::fs::rename(&partial, path)
        .with_context(|| format!("failed to move export into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::Queue;
    use crate::store::{JobStore, MemoryJobStore};
    use crate::types::JobOptions;
    use serde_json::json;

    struct Rows(Vec<Value>);

    #[async_trait]
    impl ApplicantSource for Rows {
        async fn fetch_applicants(
            &self,
            mobilizer_id: Option<&str>,
        ) -> anyhow::Result<Vec<ApplicantRow>> {
            Ok(self
                .0
                .iter()
                .filter_map(|row| row.as_object().cloned())
                .filter(|row| {
                    mobilizer_id.is_none_or(|id| row.get("mobilizer").and_then(Value::as_str) == Some(id))
                })
                .collect())
        }
    }

    async fn run_export(source: Rows, payload: Value, dir: &Path) -> (Value, Job) {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::new(QueueConfig::export(), store.clone());
        let enqueued = queue.add("export", payload, JobOptions::default()).await.unwrap();
        let ctx = JobContext::new(store.clone(), &enqueued.job);
        let handler = ExportHandler::new(Arc::new(source), dir);
        let result = handler.handle(&enqueued.job, &ctx).await.unwrap();
        let job = store.get(queue.name(), &enqueued.job.id).await.unwrap().unwrap();
        (result, job)
    }

    #[tokio::test]
    async fn test_export_writes_csv_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source = Rows(vec![
            json!({"email": "ada@example.com", "firstName": "Ada", "mobilizer": "m1"}),
            json!({"email": "bo@example.com", "firstName": null, "cohort": 4, "mobilizer": "m2"}),
        ]);

        let (result, job) = run_export(source, json!({"requestedBy": "admin"}), dir.path()).await;

        assert_eq!(result["recordCount"], 2);
        assert_eq!(result["message"], "Export completed successfully");
        let file_name = result["fileName"].as_str().unwrap();
        assert!(file_name.starts_with("applicant_data_export_"));
        assert_eq!(result["downloadLink"], format!("/exports/{file_name}"));

        let progress = job.progress.unwrap();
        assert_eq!(progress["stage"], "completed");
        assert_eq!(progress["percent"], 100);

        let written = std::fs::read_to_string(dir.path().join(file_name)).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "email,firstName,mobilizer,cohort");
        assert_eq!(lines[2], "bo@example.com,,m2,4");
    }

    #[tokio::test]
    async fn test_mobilizer_export_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let source = Rows(vec![json!({"email": "ada@example.com", "mobilizer": "m1"})]);

        let (result, _) = run_export(source, json!({"mobilizerId": "m1"}), dir.path()).await;
        assert_eq!(result["recordCount"], 1);
        assert!(
            result["fileName"]
                .as_str()
                .unwrap()
                .starts_with("mobilizer_applicants_export_")
        );
    }

    #[tokio::test]
    async fn test_empty_export() {
        let dir = tempfile::tempdir().unwrap();
        let (result, job) = run_export(Rows(vec![]), json!({}), dir.path()).await;
        assert_eq!(
            result,
            json!({"downloadLink": null, "fileName": null, "message": "No data found", "recordCount": 0})
        );
        assert_eq!(job.progress.unwrap()["percent"], 30);
    }

    #[test]
    fn test_priority() {
        let scoped = ExportRequest {
            mobilizer_id: Some("m1".into()),
            ..Default::default()
        };
        assert_eq!(scoped.priority(), 5);
        assert_eq!(ExportRequest::default().priority(), 3);
    }
}
