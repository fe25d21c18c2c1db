//! The two catsweep pipelines: wave-bounded concurrent fetch+stage, and
//! sequential batched ingestion into the document store.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use catsweep_client::{CatalogFetch, IdentityRotator};
use catsweep_core::{CatalogId, FetchOutcome, FetchRunReport, IdRange, Record, RunStats};
use catsweep_storage::{load_records, StagingWriter};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "catsweep-pipeline";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
    #[error("wave size must be at least 1")]
    ZeroWaveSize,
}

/// One sweep over a half-open id range: at most `concurrency` units in
/// flight, committed in waves of `wave_size`.
#[derive(Debug, Clone, Copy)]
pub struct FetchPlan {
    pub range: IdRange,
    pub concurrency: usize,
    pub wave_size: usize,
}

impl FetchPlan {
    fn validate(&self) -> Result<(), PlanError> {
        if self.concurrency == 0 {
            return Err(PlanError::ZeroConcurrency);
        }
        if self.wave_size == 0 {
            return Err(PlanError::ZeroWaveSize);
        }
        Ok(())
    }
}

/// Drives concurrent fetch+stage units across an id range.
///
/// Each unit is an independent spawned task; `buffer_unordered` caps how
/// many run at once, and the per-wave collect is a full barrier: no id of
/// wave N+1 starts before every id of wave N has completed. A failed unit
/// is counted and logged, never aborting the wave or the run. There is no
/// persisted checkpoint; a crash re-enumerates from the start of the range.
pub struct FetchScheduler {
    catalog: Arc<dyn CatalogFetch>,
    identities: Arc<IdentityRotator>,
    writer: Arc<StagingWriter>,
}

impl FetchScheduler {
    pub fn new(
        catalog: Arc<dyn CatalogFetch>,
        identities: Arc<IdentityRotator>,
        writer: Arc<StagingWriter>,
    ) -> Self {
        Self {
            catalog,
            identities,
            writer,
        }
    }

    pub async fn run(&self, plan: FetchPlan) -> Result<FetchRunReport, PlanError> {
        plan.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stats = Arc::new(RunStats::default());
        info!(
            %run_id,
            range = %plan.range,
            concurrency = plan.concurrency,
            wave_size = plan.wave_size,
            "fetch run starting"
        );

        let mut waves = 0u64;
        let mut wave_start = plan.range.start;
        while wave_start < plan.range.end {
            let wave_end = wave_start
                .saturating_add(plan.wave_size as u64)
                .min(plan.range.end);
            let results: Vec<_> = stream::iter(wave_start..wave_end)
                .map(|id| {
                    let catalog = Arc::clone(&self.catalog);
                    let identities = Arc::clone(&self.identities);
                    let writer = Arc::clone(&self.writer);
                    let stats = Arc::clone(&stats);
                    // Spawned so units run in parallel; buffer_unordered only
                    // pulls (and spawns) a new unit when one is in flight
                    // below the concurrency cap.
                    tokio::spawn(async move {
                        fetch_and_stage(
                            catalog.as_ref(),
                            &identities,
                            &writer,
                            &stats,
                            CatalogId(id),
                        )
                        .await;
                    })
                })
                .buffer_unordered(plan.concurrency)
                .collect()
                .await;

            for result in results {
                if let Err(join_err) = result {
                    warn!(error = %join_err, "fetch unit panicked");
                    stats.record_io_failure();
                }
            }

            waves += 1;
            info!(
                wave = waves,
                processed = stats.processed(),
                staged = stats.staged(),
                "wave complete"
            );
            wave_start = wave_end;
        }

        let report = stats.report(run_id, plan.range, waves, started_at, Utc::now());
        info!(
            %run_id,
            staged = report.staged,
            absent = report.absent,
            transient_failures = report.transient_failures,
            io_failures = report.io_failures,
            "fetch run finished"
        );
        Ok(report)
    }
}

async fn fetch_and_stage(
    catalog: &dyn CatalogFetch,
    identities: &IdentityRotator,
    writer: &StagingWriter,
    stats: &RunStats,
    id: CatalogId,
) {
    let identity = identities.next();
    match catalog.fetch(id, &identity).await {
        FetchOutcome::Found(record) => match writer.stage(id, &record).await {
            Ok(staged) => {
                debug!(
                    %id,
                    path = %staged.path.display(),
                    unchanged = staged.unchanged,
                    "record staged"
                );
                stats.record_staged();
            }
            Err(err) => {
                warn!(%id, error = %err, "staging write failed");
                stats.record_io_failure();
            }
        },
        // The client already logged the remote message / transient cause.
        FetchOutcome::NotFound { .. } => stats.record_absent(),
        FetchOutcome::Transient { .. } => stats.record_transient_failure(),
    }
}

const TIMESTAMP_LAYOUTS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Best-effort timestamp parse: RFC 3339, RFC 2822, then common naive
/// layouts taken as UTC. `None` means the caller keeps the original value.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for layout in TIMESTAMP_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

/// Rewrite a string timestamp field to canonical RFC 3339 UTC. Unparsable
/// or non-string values are left untouched; normalization never fails a
/// record or a batch. Returns whether the field was rewritten.
pub fn normalize_record_timestamp(record: &mut Record, field: &str) -> bool {
    let Some(Value::String(raw)) = record.get(field) else {
        return false;
    };
    match parse_timestamp(raw) {
        Some(ts) => {
            record.insert(
                field.to_string(),
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            );
            true
        }
        None => false,
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid store table name {0:?}")]
    InvalidTable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Append-only bulk-insert sink the ingestor writes to. A batch either
/// succeeds whole or fails whole: partial acceptance is not distinguished
/// from failure, so callers never delete sources on an error.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Insert records in order; returns the count durably accepted.
    async fn insert_many(&self, records: &[Value]) -> Result<u64, SinkError>;

    /// Destructively clear the target.
    async fn clear(&self) -> Result<(), SinkError>;
}

/// Postgres implementation: one JSONB document column, bulk inserts via a
/// single array-unnest statement.
pub struct PgDocumentSink {
    pool: PgPool,
    table: String,
}

impl PgDocumentSink {
    /// Eager connect + table bootstrap; store unavailability is fatal for
    /// an ingestion run before any file is touched.
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, SinkError> {
        if !is_safe_identifier(table) {
            return Err(SinkError::InvalidTable(table.to_string()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)"
        ))
        .execute(&pool)
        .await?;
        info!(table, "connected to document store");
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl DocumentSink for PgDocumentSink {
    async fn insert_many(&self, records: &[Value]) -> Result<u64, SinkError> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (doc) SELECT unnest($1::jsonb[])",
            self.table
        ))
        .bind(records.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<(), SinkError> {
        sqlx::query(&format!("TRUNCATE TABLE {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// Table names are interpolated into statements and cannot be bound.
fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub drop_target_first: bool,
    pub normalize_timestamps: bool,
    pub timestamp_field: String,
    pub delete_on_success: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            drop_target_first: false,
            normalize_timestamps: false,
            timestamp_field: "timestamp".to_string(),
            delete_on_success: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("clearing the target store")]
    Clear(#[source] SinkError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files_total: u64,
    pub files_loaded: u64,
    pub files_skipped: u64,
    pub files_deleted: u64,
    pub delete_failures: u64,
    pub records_read: u64,
    pub records_inserted: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
}

/// Streams staged files into fixed-size batches and bulk-inserts each one,
/// retiring staged files only after every batch they contributed to was
/// confirmed inserted.
///
/// Strictly sequential by design: deletion ordering relative to inserts is
/// safety-critical, so batches never flush concurrently.
pub struct BatchIngestor {
    sink: Arc<dyn DocumentSink>,
    options: IngestOptions,
}

impl BatchIngestor {
    pub fn new(sink: Arc<dyn DocumentSink>, options: IngestOptions) -> Self {
        Self { sink, options }
    }

    pub async fn run(&self, paths: &[PathBuf]) -> Result<IngestReport, IngestError> {
        if self.options.batch_size == 0 {
            return Err(IngestError::ZeroBatchSize);
        }
        if self.options.drop_target_first {
            warn!("clearing target store before ingest");
            self.sink.clear().await.map_err(IngestError::Clear)?;
        }

        let mut report = IngestReport {
            files_total: paths.len() as u64,
            ..Default::default()
        };
        let mut batch: Vec<Value> = Vec::with_capacity(self.options.batch_size);
        let mut batch_paths: BTreeSet<PathBuf> = BTreeSet::new();
        // Files with records in an open or flushed batch; the flag drops to
        // false the moment one of their batches fails.
        let mut clean: HashMap<PathBuf, bool> = HashMap::new();

        for path in paths {
            let records = match load_records(path).await {
                Ok(records) if records.is_empty() => {
                    debug!(path = %path.display(), "staged file holds no records");
                    report.files_skipped += 1;
                    continue;
                }
                Ok(records) => records,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable staged file");
                    report.files_skipped += 1;
                    continue;
                }
            };
            report.files_loaded += 1;
            clean.insert(path.clone(), true);

            for mut record in records {
                report.records_read += 1;
                if self.options.normalize_timestamps {
                    normalize_record_timestamp(&mut record, &self.options.timestamp_field);
                }
                batch.push(Value::Object(record));
                batch_paths.insert(path.clone());
                if batch.len() == self.options.batch_size {
                    self.flush(
                        &mut batch,
                        &mut batch_paths,
                        &mut clean,
                        Some(path.as_path()),
                        &mut report,
                    )
                    .await;
                }
            }

            // Every record of this file was already flushed inside the loop.
            if !batch_paths.contains(path.as_path()) {
                if let Some(ok) = clean.remove(path.as_path()) {
                    self.retire(path, ok, &mut report).await;
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, &mut batch_paths, &mut clean, None, &mut report)
                .await;
        }
        debug_assert!(clean.is_empty());
        Ok(report)
    }

    async fn flush(
        &self,
        batch: &mut Vec<Value>,
        batch_paths: &mut BTreeSet<PathBuf>,
        clean: &mut HashMap<PathBuf, bool>,
        current: Option<&Path>,
        report: &mut IngestReport,
    ) {
        let size = batch.len() as u64;
        match self.sink.insert_many(batch.as_slice()).await {
            Ok(accepted) => {
                report.batches_flushed += 1;
                report.records_inserted += accepted;
                info!(records = size, accepted, "batch inserted");
            }
            Err(err) => {
                // No deletions for a failed batch; every record stays
                // recoverable from its still-present file.
                warn!(records = size, error = %err, "bulk insert failed");
                report.batches_failed += 1;
                for path in batch_paths.iter() {
                    if let Some(ok) = clean.get_mut(path) {
                        *ok = false;
                    }
                }
            }
        }

        batch.clear();
        for path in std::mem::take(batch_paths) {
            if Some(path.as_path()) == current {
                // Still contributing records; its fate settles with the
                // batch holding its last record.
                continue;
            }
            if let Some(ok) = clean.remove(&path) {
                self.retire(&path, ok, report).await;
            }
        }
    }

    /// A file is deleted iff every record it contributed was part of a
    /// batch whose insert succeeded.
    async fn retire(&self, path: &Path, all_batches_ok: bool, report: &mut IngestReport) {
        if !all_batches_ok || !self.options.delete_on_success {
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "retired staged file");
                report.files_deleted += 1;
            }
            Err(err) => {
                // Not a batch failure: the file stays re-ingestible.
                warn!(path = %path.display(), error = %err, "could not delete staged file");
                report.delete_failures += 1;
            }
        }
    }
}
