use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobboard_adapters::{JobSource, RawJobRecord, SourceError};
use jobboard_core::{DisplayJob, NormalizedJob};
use jobboard_storage::{JobStore, StoreError, UpsertOutcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::normalize::{display_id, normalize, NormalizeError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("boardToken is required")]
    MissingBoard,
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Why a single record was skipped. Counted and logged, never returned to callers.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub board: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub synced: usize,
    pub inserted: usize,
    pub updated: usize,
    pub errors: usize,
    pub deactivated: u64,
    pub failed_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardPreview {
    pub jobs: Vec<DisplayJob>,
    pub total: usize,
}

#[derive(Debug)]
pub struct BoardRun {
    pub board: String,
    pub result: Result<SyncSummary, SyncError>,
}

/// Persists one normalized job so that exactly one record exists per `(source, externalId)`.
pub async fn resolve_upsert(
    store: &dyn JobStore,
    job: &NormalizedJob,
) -> Result<UpsertOutcome, StoreError> {
    let outcome = store.upsert_synced(job).await?;
    debug!(
        external_id = %job.origin.external_id,
        id = %outcome.job().id,
        inserted = outcome.was_inserted(),
        "upserted synced job"
    );
    Ok(outcome)
}

fn record_label(record: &RawJobRecord, index: usize) -> String {
    record.external_id().unwrap_or_else(|| format!("#{index}"))
}

fn board_token(board: &str) -> Result<&str, SyncError> {
    let board = board.trim();
    if board.is_empty() {
        Err(SyncError::MissingBoard)
    } else {
        Ok(board)
    }
}

/// Fetch, normalize and upsert for one board at a time. Records are processed
/// sequentially and a failing record never aborts the rest of the batch.
pub struct SyncPipeline {
    source: Arc<dyn JobSource>,
    store: Arc<dyn JobStore>,
    deactivate_missing: bool,
}

impl SyncPipeline {
    pub fn new(source: Arc<dyn JobSource>, store: Arc<dyn JobStore>) -> Self {
        Self {
            source,
            store,
            deactivate_missing: true,
        }
    }

    pub fn with_deactivate_missing(mut self, enabled: bool) -> Self {
        self.deactivate_missing = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn sync_board(&self, board: &str) -> Result<SyncSummary, SyncError> {
        let board = board_token(board)?;
        let span = info_span!("sync_board", board, source = self.source.source_id());
        self.run_sync(board).instrument(span).await
    }

    async fn run_sync(&self, board: &str) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let records = self.source.fetch_jobs(board).await?;

        let mut summary = SyncSummary {
            run_id,
            board: board.to_string(),
            started_at,
            finished_at: started_at,
            total: records.len(),
            synced: 0,
            inserted: 0,
            updated: 0,
            errors: 0,
            deactivated: 0,
            failed_ids: Vec::new(),
        };
        let mut seen = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            if let Some(id) = record.external_id() {
                seen.push(id);
            }
            match self.sync_record(record, board).await {
                Ok(UpsertOutcome::Inserted(_)) => {
                    summary.synced += 1;
                    summary.inserted += 1;
                }
                Ok(UpsertOutcome::Updated(_)) => {
                    summary.synced += 1;
                    summary.updated += 1;
                }
                Err(err) => {
                    let label = record_label(record, index);
                    warn!(board, external_id = %label, error = %err, "failed to sync record");
                    summary.errors += 1;
                    summary.failed_ids.push(label);
                }
            }
        }

        if self.deactivate_missing {
            match self
                .store
                .deactivate_missing(self.source.source_id(), board, &seen)
                .await
            {
                Ok(count) => summary.deactivated = count,
                Err(err) => warn!(board, error = %err, "failed to deactivate missing jobs"),
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            board,
            total = summary.total,
            synced = summary.synced,
            inserted = summary.inserted,
            updated = summary.updated,
            errors = summary.errors,
            deactivated = summary.deactivated,
            "board sync finished"
        );
        Ok(summary)
    }

    fn prepare_record(
        &self,
        record: &RawJobRecord,
        board: &str,
        now: DateTime<Utc>,
    ) -> Result<NormalizedJob, RecordError> {
        let record = record.decode()?;
        Ok(normalize(&record, self.source.source_id(), board, now)?)
    }

    async fn sync_record(
        &self,
        record: &RawJobRecord,
        board: &str,
    ) -> Result<UpsertOutcome, RecordError> {
        let job = self.prepare_record(record, board, Utc::now())?;
        Ok(resolve_upsert(self.store.as_ref(), &job).await?)
    }

    /// Same fetch and normalization as `sync_board`, with no writes.
    pub async fn preview_board(&self, board: &str) -> Result<BoardPreview, SyncError> {
        let board = board_token(board)?;
        let records = self.source.fetch_jobs(board).await?;
        let now = Utc::now();
        let prefix = self.source.display_prefix();

        let jobs: Vec<DisplayJob> = records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                match self.prepare_record(record, board, now) {
                    Ok(job) => Some(DisplayJob {
                        id: display_id(prefix, &job.origin.external_id),
                        job,
                        applicants: Vec::new(),
                    }),
                    Err(err) => {
                        warn!(
                            board,
                            external_id = %record_label(record, index),
                            error = %err,
                            "skipping record in preview"
                        );
                        None
                    }
                }
            })
            .collect();

        Ok(BoardPreview {
            total: jobs.len(),
            jobs,
        })
    }

    /// Syncs each board in turn; one board failing does not stop the others.
    pub async fn sync_boards(&self, boards: &[String]) -> Vec<BoardRun> {
        let mut runs = Vec::with_capacity(boards.len());
        for board in boards {
            let result = self.sync_board(board).await;
            if let Err(err) = &result {
                warn!(board = %board, error = %err, "board sync failed");
            }
            runs.push(BoardRun {
                board: board.clone(),
                result,
            });
        }
        runs
    }
}
