use crate::archive::{self, ExtractionHandle};
use crate::config::ImportConfig;
use crate::matcher::ImageIndex;
use crate::models::{Category, ImportMode};
use crate::reconcile::{ReconcileError, Reconciler, RowContext, RowDisposition, RowReport};
use crate::spreadsheet::{self, SpreadsheetError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

/// The single mutable job record. Only the supervisor and the reporter it hands
/// to the running job touch it.
#[derive(Debug, Default)]
struct ImportJobStatus {
    run_id: Option<Uuid>,
    phase: JobPhase,
    in_progress: bool,
    total: u64,
    processed: u64,
    imported: u64,
    skipped: u64,
    errors: u64,
    category: Option<Category>,
    mode: ImportMode,
    batch_id: Option<Uuid>,
    source_file: Option<String>,
    logs: Vec<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl ImportJobStatus {
    fn begin(&mut self, run_id: Uuid, batch_id: Uuid, category: Category, mode: ImportMode, source_file: &str) {
        *self = Self {
            run_id: Some(run_id),
            phase: JobPhase::Running,
            in_progress: true,
            category: Some(category),
            mode,
            batch_id: Some(batch_id),
            source_file: Some(source_file.to_string()),
            start_time: Some(Utc::now()),
            ..Self::default()
        };
    }

    fn push_log(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!(target = "catalog.import", run_id = ?self.run_id, "{line}");
        self.logs
            .push(format!("[{}] {line}", Utc::now().format("%H:%M:%S")));
    }

    fn snapshot(&self, tail: usize) -> StatusSnapshot {
        let elapsed_ms = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            (Some(start), None) => (Utc::now() - start).num_milliseconds(),
            _ => 0,
        }
        .max(0) as u64;
        let percentage = if self.total == 0 {
            0
        } else {
            (self.processed.min(self.total) * 100 / self.total) as u32
        };
        let skip = self.logs.len().saturating_sub(tail);
        StatusSnapshot {
            in_progress: self.in_progress,
            phase: self.phase,
            total: self.total,
            processed: self.processed,
            imported: self.imported,
            skipped: self.skipped,
            errors: self.errors,
            category: self.category,
            mode: self.mode,
            batch_id: self.batch_id,
            source_file: self.source_file.clone(),
            logs: self.logs[skip..].to_vec(),
            log_count: self.logs.len(),
            start_time: self.start_time,
            end_time: self.end_time,
            elapsed_ms,
            percentage,
        }
    }
}

/// Read-only copy of the job status handed to pollers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub in_progress: bool,
    pub phase: JobPhase,
    pub total: u64,
    pub processed: u64,
    pub imported: u64,
    pub skipped: u64,
    pub errors: u64,
    pub category: Option<Category>,
    pub mode: ImportMode,
    pub batch_id: Option<Uuid>,
    pub source_file: Option<String>,
    /// Most recent lines only.
    pub logs: Vec<String>,
    pub log_count: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub percentage: u32,
}

/// Files a caller hands over when starting an import. Once admitted, the run
/// owns them and deletes them when it ends.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub spreadsheet: PathBuf,
    /// Name the spreadsheet was uploaded under, used for `sourceFile` and
    /// category inference.
    pub original_name: String,
    pub archive: Option<PathBuf>,
    pub category: Option<String>,
    pub mode: ImportMode,
}

impl ImportRequest {
    /// Removes the uploaded files of a request that was not admitted.
    pub async fn discard(&self) {
        remove_path(&self.spreadsheet, false).await.ok();
        if let Some(archive) = &self.archive {
            remove_path(archive, false).await.ok();
        }
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("an import is already in progress")]
    Busy,
    #[error("{0}")]
    BadRequest(String),
}

#[derive(Debug, Error)]
enum RunError {
    #[error("spreadsheet could not be read: {0}")]
    Spreadsheet(#[from] SpreadsheetError),
    #[error("{0}")]
    Task(String),
}

/// Explicit category wins; otherwise (absent or invalid) the file name decides.
pub fn resolve_category(
    requested: Option<&str>,
    file_name: &str,
) -> Result<Category, AdmissionError> {
    let requested = requested.map(str::trim).filter(|value| !value.is_empty());
    if let Some(category) = requested.and_then(Category::parse) {
        return Ok(category);
    }
    match (Category::infer_from_file_name(file_name), requested) {
        (Some(category), _) => Ok(category),
        (None, Some(given)) => Err(AdmissionError::BadRequest(format!(
            "category `{given}` is not one of Eyeglasses, Sunglasses, Contact Lenses \
             and none could be inferred from `{file_name}`"
        ))),
        (None, None) => Err(AdmissionError::BadRequest(format!(
            "no category given and none could be inferred from `{file_name}`"
        ))),
    }
}

/// Owns the job status and admits at most one import run at a time.
#[derive(Clone)]
pub struct ImportSupervisor {
    status: Arc<Mutex<ImportJobStatus>>,
    reconciler: Arc<Reconciler>,
    config: Arc<ImportConfig>,
}

impl ImportSupervisor {
    pub fn new(reconciler: Arc<Reconciler>, config: ImportConfig) -> Self {
        Self {
            status: Arc::new(Mutex::new(ImportJobStatus::default())),
            reconciler,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Admits a run and returns right away; the rows are processed by a detached
    /// task. The busy check, the reset and the spawn happen under one lock.
    pub async fn start(&self, request: ImportRequest) -> Result<StatusSnapshot, AdmissionError> {
        let mut status = self.status.lock().await;
        if status.in_progress {
            return Err(AdmissionError::Busy);
        }
        let category = resolve_category(request.category.as_deref(), &request.original_name)?;

        let run = ImportRun {
            run_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            category,
            mode: request.mode,
            source_file: request.original_name.clone(),
            spreadsheet: request.spreadsheet,
            archive: request.archive,
            image_dir: archive::scratch_dir(&self.config.temp_dir),
            extraction: ExtractionHandle::default(),
        };
        status.begin(run.run_id, run.batch_id, category, run.mode, &run.source_file);
        status.push_log(format!(
            "Import started: {} ({}, {:?} mode, batch {})",
            run.source_file,
            category.label(),
            run.mode,
            run.batch_id
        ));
        if let Some(given) = request.category.as_deref().map(str::trim)
            && !given.is_empty()
            && Category::parse(given).is_none()
        {
            status.push_log(format!(
                "Category `{given}` not recognised; using {} inferred from file name",
                category.label()
            ));
        }
        let snapshot = status.snapshot(self.config.log_tail);

        info!(
            target = "catalog.import",
            run_id = %run.run_id,
            batch_id = %run.batch_id,
            category = category.label(),
            file = %run.source_file,
            "import_admitted"
        );
        let reporter = JobReporter {
            status: self.status.clone(),
            run_id: run.run_id,
        };
        tokio::spawn(supervise(
            run,
            reporter,
            self.reconciler.clone(),
            self.config.job_timeout,
        ));
        Ok(snapshot)
    }

    pub async fn poll(&self) -> StatusSnapshot {
        self.status.lock().await.snapshot(self.config.log_tail)
    }
}

#[derive(Debug, Clone)]
struct ImportRun {
    run_id: Uuid,
    batch_id: Uuid,
    category: Category,
    mode: ImportMode,
    source_file: String,
    spreadsheet: PathBuf,
    archive: Option<PathBuf>,
    /// Reserved up front so cleanup knows it even if the run dies mid-extract.
    image_dir: PathBuf,
    extraction: ExtractionHandle,
}

/// Write access to the status for one run. Writes from a run that is no longer
/// current are dropped.
#[derive(Clone)]
struct JobReporter {
    status: Arc<Mutex<ImportJobStatus>>,
    run_id: Uuid,
}

impl JobReporter {
    async fn update(&self, apply: impl FnOnce(&mut ImportJobStatus)) {
        let mut guard = self.status.lock().await;
        if guard.run_id == Some(self.run_id) {
            apply(&mut guard);
        }
    }

    async fn log(&self, line: impl Into<String>) {
        let line = line.into();
        self.update(|status| status.push_log(line)).await;
    }

    async fn add_total(&self, rows: usize) {
        self.update(|status| status.total += rows as u64).await;
    }

    async fn record_row(&self, outcome: Result<RowReport, ReconcileError>) {
        self.update(|status| {
            match outcome {
                Ok(report) => {
                    for note in report.notes {
                        status.push_log(note);
                    }
                    match report.disposition {
                        RowDisposition::Imported => {
                            status.imported += 1;
                            status.push_log(format!("Imported {}", report.sku));
                        }
                        RowDisposition::Skipped => {
                            status.skipped += 1;
                            status.push_log(format!("Skipped duplicate {}", report.sku));
                        }
                    }
                }
                Err(err) => {
                    status.errors += 1;
                    status.push_log(format!("Row error: {err}"));
                }
            }
            status.processed += 1;
        })
        .await;
    }

    async fn finish(&self, outcome: Result<(), String>) {
        self.update(|status| {
            match outcome {
                Ok(()) => {
                    status.phase = JobPhase::Completed;
                    let line = format!(
                        "Import completed: {} imported, {} skipped, {} errors of {} rows",
                        status.imported, status.skipped, status.errors, status.total
                    );
                    status.push_log(line);
                }
                Err(message) => {
                    status.phase = JobPhase::Failed;
                    status.errors += 1;
                    status.push_log(format!("Import failed: {message}"));
                }
            }
            status.in_progress = false;
            status.end_time = Some(Utc::now());
        })
        .await;
    }
}

async fn supervise(
    run: ImportRun,
    reporter: JobReporter,
    reconciler: Arc<Reconciler>,
    timeout: Duration,
) {
    let started = Instant::now();
    let mut worker = tokio::spawn(execute(run.clone(), reporter.clone(), reconciler.clone()));
    let outcome = match tokio::time::timeout(timeout, &mut worker).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(err.to_string()),
        Ok(Err(err)) => Err(format!("import task stopped unexpectedly: {err}")),
        Err(_) => {
            worker.abort();
            let _ = worker.await;
            Err(format!("import timed out after {}s", timeout.as_secs()))
        }
    };
    // an aborted run can leave its blocking unzip behind
    run.extraction.cancel_and_wait().await;

    if let Err(err) = reconciler.catalog().flush().await {
        warn!(target = "catalog.import", run_id = %run.run_id, error = %err, "catalog_flush_failed");
        reporter.log(format!("Catalog flush failed: {err}")).await;
    }
    purge(&run, &reporter).await;

    let label = if outcome.is_ok() { "completed" } else { "failed" };
    match &outcome {
        Ok(()) => info!(target = "catalog.import", run_id = %run.run_id, "import_completed"),
        Err(message) => warn!(target = "catalog.import", run_id = %run.run_id, error = %message, "import_failed"),
    }
    reporter.finish(outcome).await;
    crate::metrics::run_finished(label, started.elapsed().as_millis());
}

async fn execute(
    run: ImportRun,
    reporter: JobReporter,
    reconciler: Arc<Reconciler>,
) -> Result<(), RunError> {
    let index = match &run.archive {
        Some(zip) if archive::extract_into(zip, &run.image_dir, &run.extraction).await => {
            let dir = run.image_dir.clone();
            let index = tokio::task::spawn_blocking(move || ImageIndex::scan(&dir))
                .await
                .map_err(|err| RunError::Task(err.to_string()))?;
            if index.is_empty() {
                reporter
                    .log("Image archive holds no images; placeholder images will be used")
                    .await;
                None
            } else {
                reporter
                    .log(format!("Extracted image archive: {} file(s)", index.len()))
                    .await;
                Some(index)
            }
        }
        Some(_) => {
            reporter
                .log("Image archive could not be extracted; continuing without images")
                .await;
            None
        }
        None => {
            reporter
                .log("No image archive supplied; placeholder images will be used")
                .await;
            None
        }
    };

    let sheets = spreadsheet::read_workbook(&run.spreadsheet).await?;
    for sheet in &sheets {
        reporter.add_total(sheet.rows.len()).await;
        reporter
            .log(format!("Sheet '{}': {} row(s)", sheet.name, sheet.rows.len()))
            .await;
    }

    let ctx = RowContext {
        category: run.category,
        mode: run.mode,
        batch_id: run.batch_id,
        source_file: &run.source_file,
        images: index.as_ref(),
    };
    for sheet in &sheets {
        for row in &sheet.rows {
            let started = Instant::now();
            let outcome = reconciler.process_row(row, &ctx).await;
            let label = match &outcome {
                Ok(report) if report.disposition == RowDisposition::Imported => "imported",
                Ok(_) => "skipped",
                Err(_) => "error",
            };
            crate::metrics::row_processed(label, started.elapsed().as_millis());
            reporter.record_row(outcome).await;
        }
    }
    Ok(())
}

// Runs on every exit path; failures are logged and never change the outcome.
async fn purge(run: &ImportRun, reporter: &JobReporter) {
    let mut targets = vec![(run.image_dir.as_path(), true), (run.spreadsheet.as_path(), false)];
    if let Some(archive) = &run.archive {
        targets.push((archive.as_path(), false));
    }
    let mut removed = 0;
    for (path, is_dir) in targets {
        match remove_path(path, is_dir).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(err) => {
                warn!(target = "catalog.import", path = %path.display(), error = %err, "cleanup_failed");
                reporter
                    .log(format!("Cleanup of {} failed: {err}", path.display()))
                    .await;
            }
        }
    }
    reporter
        .log(format!("Temporary files removed ({removed})"))
        .await;
}

/// `Ok(false)` when there was nothing to remove.
async fn remove_path(path: &Path, is_dir: bool) -> io::Result<bool> {
    let result = if is_dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
