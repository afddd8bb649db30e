use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobboard_core::{
    EmploymentType, ExperienceLevel, Job, JobOrigin, JobPage, JobPatch, JobPosting, JobSearchQuery,
    NormalizedJob, SourceMetadata,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use crate::jobs::{JobStore, StoreError, UpsertOutcome};

const JOB_COLUMNS: &str = "id, title, company, location, job_type, salary, description, \
     requirements, experience_level, skills, active, posted_date, expiry_date, company_id, \
     source, board, external_id, source_metadata, applicants";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    title: String,
    company: String,
    location: String,
    job_type: String,
    salary: String,
    description: String,
    requirements: String,
    experience_level: Option<String>,
    skills: Vec<String>,
    active: bool,
    posted_date: DateTime<Utc>,
    expiry_date: DateTime<Utc>,
    company_id: Option<String>,
    source: Option<String>,
    board: Option<String>,
    external_id: Option<String>,
    source_metadata: Option<serde_json::Value>,
    applicants: Vec<String>,
}

#[derive(Debug, FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    job: JobRow,
    inserted: bool,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::CorruptRow { id: row.id, reason };
        let employment_type = row
            .job_type
            .parse::<EmploymentType>()
            .map_err(|e| corrupt(format!("{e}")))?;
        let experience_level = row
            .experience_level
            .as_deref()
            .map(str::parse::<ExperienceLevel>)
            .transpose()
            .map_err(|e| corrupt(format!("{e}")))?;
        let origin = match (row.source, row.board, row.external_id) {
            (Some(source), Some(board), Some(external_id)) => {
                let source_metadata = match row.source_metadata {
                    Some(value) => serde_json::from_value::<SourceMetadata>(value)
                        .map_err(|e| corrupt(format!("source_metadata: {e}")))?,
                    None => SourceMetadata::default(),
                };
                Some(JobOrigin {
                    source,
                    board,
                    external_id,
                    source_metadata,
                })
            }
            _ => None,
        };

        Ok(Job {
            id: row.id,
            posting: JobPosting {
                title: row.title,
                company: row.company,
                location: row.location,
                employment_type,
                salary: row.salary,
                description: row.description,
                requirements: row.requirements,
                experience_level,
                skills: row.skills,
                active: row.active,
                posted_date: row.posted_date,
                expiry_date: row.expiry_date,
                company_id: row.company_id,
            },
            origin,
            applicants: row.applicants,
        })
    }
}

/// LIMIT and OFFSET binds; values past `i64::MAX` saturate.
fn limit_offset(page: usize, size: usize) -> (i64, i64) {
    let bind = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    (bind(size), bind(page.saturating_mul(size)))
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    out.push('%');
    for ch in input.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

fn push_search_filters<'a>(qb: &mut QueryBuilder<'a, Postgres>, query: &'a JobSearchQuery) {
    qb.push(" WHERE TRUE");
    if let Some(location) = query.location() {
        qb.push(" AND location ILIKE ").push_bind(escape_like(location));
    }
    if let Some(kind) = query.employment_type() {
        qb.push(" AND job_type = ").push_bind(kind);
    }
    if let Some(keyword) = query.keyword() {
        let pattern = escape_like(keyword);
        qb.push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR company ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// Postgres-backed jobs collection. Uniqueness of `(source, external_id)` is a table constraint.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, posting: JobPosting) -> Result<Job, StoreError> {
        posting.check_dates()?;
        let sql = format!(
            r#"
            INSERT INTO jobs (id, title, company, location, job_type, salary, description,
                              requirements, experience_level, skills, active, posted_date,
                              expiry_date, company_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&posting.title)
            .bind(&posting.company)
            .bind(&posting.location)
            .bind(posting.employment_type.as_str())
            .bind(&posting.salary)
            .bind(&posting.description)
            .bind(&posting.requirements)
            .bind(posting.experience_level.map(|l| l.as_str()))
            .bind(&posting.skills)
            .bind(posting.active)
            .bind(posting.posted_date)
            .bind(posting.expiry_date)
            .bind(&posting.company_id)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY posted_date DESC, id");
        sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn update(&self, id: Uuid, patch: &JobPatch) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let select = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        let Some(row) = sqlx::query_as::<_, JobRow>(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let mut job = Job::try_from(row)?;
        patch.apply_to(&mut job.posting)?;

        let p = &job.posting;
        sqlx::query(
            r#"
            UPDATE jobs
               SET title = $2, company = $3, location = $4, job_type = $5, salary = $6,
                   description = $7, requirements = $8, experience_level = $9, skills = $10,
                   active = $11, posted_date = $12, expiry_date = $13, company_id = $14,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&p.title)
        .bind(&p.company)
        .bind(&p.location)
        .bind(p.employment_type.as_str())
        .bind(&p.salary)
        .bind(&p.description)
        .bind(&p.requirements)
        .bind(p.experience_level.map(|l| l.as_str()))
        .bind(&p.skills)
        .bind(p.active)
        .bind(p.posted_date)
        .bind(p.expiry_date)
        .bind(&p.company_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, query: &JobSearchQuery) -> Result<JobPage, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM jobs");
        push_search_filters(&mut count, query);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let page = query.page();
        let size = query.size();
        let (limit, offset) = limit_offset(page, size);
        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs"));
        push_search_filters(&mut select, query);
        select
            .push(" ORDER BY posted_date DESC, id LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let jobs = select
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            jobs,
            total: total.max(0) as usize,
            page,
            size,
        })
    }

    async fn find_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE source = $1 AND external_id = $2");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(source)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn upsert_synced(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError> {
        job.posting.check_dates()?;
        let metadata = serde_json::to_value(&job.origin.source_metadata)
            .map_err(|e| StoreError::Unavailable(format!("encoding source metadata: {e}")))?;
        // xmax = 0 only for a freshly inserted tuple.
        let sql = format!(
            r#"
            INSERT INTO jobs (id, title, company, location, job_type, salary, description,
                              requirements, experience_level, skills, active, posted_date,
                              expiry_date, source, board, external_id, source_metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (source, external_id) DO UPDATE SET
                title = EXCLUDED.title,
                company = EXCLUDED.company,
                location = EXCLUDED.location,
                job_type = EXCLUDED.job_type,
                salary = EXCLUDED.salary,
                description = EXCLUDED.description,
                requirements = EXCLUDED.requirements,
                experience_level = EXCLUDED.experience_level,
                skills = EXCLUDED.skills,
                active = EXCLUDED.active,
                posted_date = EXCLUDED.posted_date,
                expiry_date = EXCLUDED.expiry_date,
                board = EXCLUDED.board,
                source_metadata = EXCLUDED.source_metadata,
                updated_at = NOW()
            RETURNING {JOB_COLUMNS}, (xmax = 0) AS inserted
            "#
        );
        let p = &job.posting;
        let row = sqlx::query_as::<_, UpsertRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&p.title)
            .bind(&p.company)
            .bind(&p.location)
            .bind(p.employment_type.as_str())
            .bind(&p.salary)
            .bind(&p.description)
            .bind(&p.requirements)
            .bind(p.experience_level.map(|l| l.as_str()))
            .bind(&p.skills)
            .bind(p.active)
            .bind(p.posted_date)
            .bind(p.expiry_date)
            .bind(&job.origin.source)
            .bind(&job.origin.board)
            .bind(&job.origin.external_id)
            .bind(metadata)
            .fetch_one(&self.pool)
            .await?;

        let inserted = row.inserted;
        let job = Job::try_from(row.job)?;
        Ok(if inserted {
            UpsertOutcome::Inserted(job)
        } else {
            UpsertOutcome::Updated(job)
        })
    }

    async fn add_applicant(&self, id: Uuid, user_id: &str) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
               SET applicants = CASE WHEN $2 = ANY(applicants) THEN applicants
                                     ELSE array_append(applicants, $2) END,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn deactivate_missing(
        &self,
        source: &str,
        board: &str,
        seen: &[String],
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET active = FALSE, updated_at = NOW()
             WHERE source = $1
               AND board = $2
               AND active
               AND NOT (external_id = ANY($3))
            "#,
        )
        .bind(source)
        .bind(board)
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_pages_saturate_instead_of_going_negative() {
        assert_eq!(limit_offset(2, 10), (10, 20));
        assert_eq!(limit_offset(usize::MAX, usize::MAX), (i64::MAX, i64::MAX));
        assert_eq!(limit_offset(3, usize::MAX / 2), (i64::MAX, i64::MAX));
        assert_eq!(limit_offset(0, 25), (25, 0));
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("50%_off"), "%50\\%\\_off%");
        assert_eq!(escape_like("rust"), "%rust%");
    }

    async fn store_from_env() -> Option<PgJobStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgJobStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn upsert_round_trip_against_postgres() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let now = Utc::now();
        let external_id = Uuid::new_v4().to_string();
        let job = NormalizedJob {
            origin: JobOrigin {
                source: "greenhouse".into(),
                board: "pg-test".into(),
                external_id: external_id.clone(),
                source_metadata: SourceMetadata {
                    url: Some("https://example.test/jobs/1".into()),
                    internal_job_id: Some(11),
                    metadata: None,
                },
            },
            posting: JobPosting {
                title: "Engineer".into(),
                company: "Acme".into(),
                location: "Remote".into(),
                employment_type: EmploymentType::Remote,
                salary: "Competitive".into(),
                description: "Rust".into(),
                requirements: "Rust".into(),
                experience_level: None,
                skills: vec!["Rust".into()],
                active: true,
                posted_date: now,
                expiry_date: JobPosting::default_expiry(now),
                company_id: None,
            },
        };

        let first = store.upsert_synced(&job).await.expect("insert");
        assert!(first.was_inserted());
        store
            .add_applicant(first.job().id, "u1")
            .await
            .expect("apply");

        let second = store.upsert_synced(&job).await.expect("update");
        assert!(!second.was_inserted());
        assert_eq!(second.job().id, first.job().id);
        assert_eq!(second.job().applicants, vec!["u1".to_string()]);

        assert!(store.delete(first.job().id).await.expect("delete"));
    }
}
