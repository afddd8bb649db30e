use std::collections::HashMap;

use async_trait::async_trait;
use jobboard_core::{DomainError, Job, JobPage, JobPatch, JobPosting, JobSearchQuery, NormalizedJob};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("corrupt row {id}: {reason}")]
    CorruptRow { id: Uuid, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted(Job),
    Updated(Job),
}

impl UpsertOutcome {
    pub fn job(&self) -> &Job {
        match self {
            UpsertOutcome::Inserted(job) | UpsertOutcome::Updated(job) => job,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// The jobs collection. Constructed by the process entry point and shared as `Arc<dyn JobStore>`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, posting: JobPosting) -> Result<Job, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// All jobs, newest `postedDate` first.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    async fn update(&self, id: Uuid, patch: &JobPatch) -> Result<Option<Job>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn search(&self, query: &JobSearchQuery) -> Result<JobPage, StoreError> {
        Ok(query.apply(self.list().await?))
    }

    async fn find_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Job>, StoreError>;

    /// Insert-or-update keyed by `(source, externalId)`, as one atomic step.
    /// An update rewrites the derived posting fields and origin but never `id` or `applicants`.
    async fn upsert_synced(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError>;

    /// Set-union append of `user_id` to the job's applicants.
    async fn add_applicant(&self, id: Uuid, user_id: &str) -> Result<Option<Job>, StoreError>;

    /// Marks active jobs of `(source, board)` inactive unless their external id is in `seen`.
    async fn deactivate_missing(
        &self,
        source: &str,
        board: &str,
        seen: &[String],
    ) -> Result<u64, StoreError>;
}

pub(crate) fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.posting
            .posted_date
            .cmp(&a.posting.posted_date)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    by_external: HashMap<(String, String), Uuid>,
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, posting: JobPosting) -> Result<Job, StoreError> {
        posting.check_dates()?;
        let job = Job {
            id: Uuid::new_v4(),
            posting,
            origin: None,
            applicants: Vec::new(),
        };
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self
            .state
            .lock()
            .await
            .jobs
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sort_newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn update(&self, id: Uuid, patch: &JobPatch) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply_to(&mut job.posting)?;
        Ok(Some(job.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.remove(&id) else {
            return Ok(false);
        };
        if let Some(origin) = job.origin {
            state
                .by_external
                .remove(&(origin.source, origin.external_id));
        }
        Ok(true)
    }

    async fn find_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        let key = (source.to_string(), external_id.to_string());
        Ok(state
            .by_external
            .get(&key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn upsert_synced(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError> {
        job.posting.check_dates()?;
        let key = (job.origin.source.clone(), job.origin.external_id.clone());
        let mut state = self.state.lock().await;

        if let Some(id) = state.by_external.get(&key).copied() {
            if let Some(existing) = state.jobs.get_mut(&id) {
                let company_id = existing.posting.company_id.take();
                existing.posting = job.posting.clone();
                existing.posting.company_id = company_id;
                existing.origin = Some(job.origin.clone());
                return Ok(UpsertOutcome::Updated(existing.clone()));
            }
        }

        let created = Job {
            id: Uuid::new_v4(),
            posting: job.posting.clone(),
            origin: Some(job.origin.clone()),
            applicants: Vec::new(),
        };
        state.by_external.insert(key, created.id);
        state.jobs.insert(created.id, created.clone());
        Ok(UpsertOutcome::Inserted(created))
    }

    async fn add_applicant(&self, id: Uuid, user_id: &str) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.applicants.iter().any(|a| a == user_id) {
            job.applicants.push(user_id.to_string());
        }
        Ok(Some(job.clone()))
    }

    async fn deactivate_missing(
        &self,
        source: &str,
        board: &str,
        seen: &[String],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut deactivated = 0u64;
        for job in state.jobs.values_mut() {
            let Some(origin) = &job.origin else {
                continue;
            };
            if origin.source == source
                && origin.board == board
                && job.posting.active
                && !seen.iter().any(|id| id == &origin.external_id)
            {
                job.posting.active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }
}
