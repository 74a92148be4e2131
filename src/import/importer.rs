//! Bulk importer — loads task records into a batch in fixed-size chunks.
//!
//! A chunk is validated in full before anything from it is written. A
//! record that is not an object, or lacks a field the task type requires,
//! aborts the import. Decode and IO failures abort only the current file
//! when loading several files; the next file is still loaded.
//!
//! The batch is created (or checked) before the first chunk is written, and
//! each chunk's rows land together with their share of `tasks_count`, so
//! live completions can run against a batch while it is still loading.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::ImportError;
use crate::import::reader::{RecordStream, open_records};
use crate::task_types::TaskTypeHandle;
use crate::tasks::TaskAllocator;
use crate::tasks::model::Payload;

/// Default records per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Outcome of an import call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Tasks written.
    pub imported: u64,
    /// Chunks written.
    pub chunks: u64,
    /// Sources abandoned after a decode or IO failure, with the reason.
    pub failed_sources: Vec<(PathBuf, String)>,
}

/// Per-call state shared across chunks and files.
struct Session<'a> {
    handle: &'a TaskTypeHandle,
    batch_id: &'a str,
    /// The batch exists and holds this session's type.
    batch_ready: bool,
    report: ImportReport,
}

/// Streams records into storage through the allocator's creation path.
pub struct Importer {
    allocator: Arc<TaskAllocator>,
    default_batch: String,
    chunk_size: usize,
}

impl Importer {
    pub fn new(allocator: Arc<TaskAllocator>, default_batch: impl Into<String>) -> Self {
        Self {
            allocator,
            default_batch: default_batch.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Builder: set records per chunk.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Import one record stream into `batch_id`.
    ///
    /// Any error aborts the call. Chunks written before the error stay.
    pub async fn import(
        &self,
        handle: &TaskTypeHandle,
        records: RecordStream,
        batch_id: &str,
    ) -> Result<ImportReport, ImportError> {
        let batch_id = self
            .allocator
            .ledger()
            .validate_exists(batch_id, &self.default_batch)
            .await?;
        let mut session = Session {
            handle,
            batch_id: &batch_id,
            batch_ready: false,
            report: ImportReport::default(),
        };

        self.import_stream(&mut session, records, "stream").await?;
        info!(batch_id = %batch_id, imported = session.report.imported, "Finished loading tasks");
        Ok(session.report)
    }

    /// Import several files, in order, into `batch_id`.
    pub async fn import_files(
        &self,
        handle: &TaskTypeHandle,
        paths: &[PathBuf],
        batch_id: &str,
    ) -> Result<ImportReport, ImportError> {
        let batch_id = self
            .allocator
            .ledger()
            .validate_exists(batch_id, &self.default_batch)
            .await?;
        let mut session = Session {
            handle,
            batch_id: &batch_id,
            batch_ready: false,
            report: ImportReport::default(),
        };

        let total = paths.len();
        for (i, path) in paths.iter().enumerate() {
            info!("Loading file {} from {}...", i + 1, total);
            match self.import_file(&mut session, path).await {
                Ok(()) => {}
                Err(e) if e.is_per_source() => {
                    warn!(path = %path.display(), error = %e, "Abandoning file");
                    session
                        .report
                        .failed_sources
                        .push((path.clone(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            batch_id = %batch_id,
            imported = session.report.imported,
            failed = session.report.failed_sources.len(),
            "Finished loading {} tasks",
            session.report.imported
        );
        Ok(session.report)
    }

    async fn import_file(&self, session: &mut Session<'_>, path: &Path) -> Result<(), ImportError> {
        let records = open_records(path)?;
        let source_name = path.display().to_string();
        self.import_stream(session, records, &source_name).await
    }

    async fn import_stream(
        &self,
        session: &mut Session<'_>,
        mut records: RecordStream,
        source_name: &str,
    ) -> Result<(), ImportError> {
        let mut offset = 0usize;
        loop {
            let (rest, chunk) = next_chunk(records, self.chunk_size).await?;
            records = rest;
            if chunk.is_empty() {
                return Ok(());
            }

            let raw_len = chunk.len();
            let payloads = self.validate_chunk(session.handle, chunk, source_name, offset)?;
            offset += raw_len;
            self.write_chunk(session, payloads).await?;
            info!("{} tasks processed", session.report.imported);
        }
    }

    fn validate_chunk(
        &self,
        handle: &TaskTypeHandle,
        chunk: Vec<Result<Value, ImportError>>,
        source_name: &str,
        offset: usize,
    ) -> Result<Vec<Payload>, ImportError> {
        let mut payloads = Vec::with_capacity(chunk.len());
        for (i, record) in chunk.into_iter().enumerate() {
            let unit = format!("record {}", offset + i + 1);
            let payload = match record? {
                Value::Object(map) => map,
                other => {
                    return Err(ImportError::Format {
                        source_name: source_name.to_string(),
                        unit,
                        reason: format!("expected an object, got {}", json_kind(&other)),
                    });
                }
            };
            handle
                .validate_task_data(&payload)
                .map_err(|reason| ImportError::Format {
                    source_name: source_name.to_string(),
                    unit,
                    reason,
                })?;
            payloads.push(payload);
        }
        Ok(payloads)
    }

    async fn write_chunk(
        &self,
        session: &mut Session<'_>,
        payloads: Vec<Payload>,
    ) -> Result<(), ImportError> {
        if !session.batch_ready {
            self.allocator
                .ledger()
                .create_or_extend(
                    session.batch_id,
                    0,
                    session.handle.type_name(),
                    &self.default_batch,
                )
                .await?;
            session.batch_ready = true;
        }

        let count = payloads.len() as u64;
        self.allocator
            .create_tasks(session.handle, Some(session.batch_id), payloads)
            .await?;

        session.report.imported += count;
        session.report.chunks += 1;
        Ok(())
    }
}

/// Pull up to `size` records off the stream without blocking the runtime.
async fn next_chunk(
    records: RecordStream,
    size: usize,
) -> Result<(RecordStream, Vec<Result<Value, ImportError>>), ImportError> {
    tokio::task::spawn_blocking(move || {
        let mut records = records;
        let chunk: Vec<_> = records.by_ref().take(size).collect();
        (records, chunk)
    })
    .await
    .map_err(|e| ImportError::Worker(e.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
