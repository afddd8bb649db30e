//! Core domain model for the job board and its external import pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobboard-core";

/// Postings stay open this long when the source gives no expiry.
pub const DEFAULT_VALIDITY_DAYS: i64 = 30;

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("expiryDate {expiry} is before postedDate {posted}")]
    ExpiryBeforePosted {
        posted: DateTime<Utc>,
        expiry: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmploymentType {
    #[default]
    FullTime,
    PartTime,
    Contract,
    Internship,
    Remote,
}

impl EmploymentType {
    pub const ALL: [EmploymentType; 5] = [
        EmploymentType::FullTime,
        EmploymentType::PartTime,
        EmploymentType::Contract,
        EmploymentType::Internship,
        EmploymentType::Remote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmploymentType::FullTime => "FULL_TIME",
            EmploymentType::PartTime => "PART_TIME",
            EmploymentType::Contract => "CONTRACT",
            EmploymentType::Internship => "INTERNSHIP",
            EmploymentType::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for EmploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmploymentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "employment type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperienceLevel {
    Entry,
    Mid,
    Senior,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceLevel::Entry => "ENTRY",
            ExperienceLevel::Mid => "MID",
            ExperienceLevel::Senior => "SENIOR",
        }
    }
}

impl fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperienceLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(ExperienceLevel::Entry),
            "MID" => Ok(ExperienceLevel::Mid),
            "SENIOR" => Ok(ExperienceLevel::Senior),
            other => Err(DomainError::UnknownVariant {
                kind: "experience level",
                value: other.to_string(),
            }),
        }
    }
}

/// Pass-through fields kept from the external record for traceability.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_job_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Where an imported job came from. `(source, external_id)` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOrigin {
    pub source: String,
    pub board: String,
    pub external_id: String,
    #[serde(default)]
    pub source_metadata: SourceMetadata,
}

/// The display and search fields shared by every job, however it was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPosting {
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(rename = "type")]
    pub employment_type: EmploymentType,
    pub salary: String,
    pub description: String,
    pub requirements: String,
    #[serde(default)]
    pub experience_level: Option<ExperienceLevel>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub active: bool,
    pub posted_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
}

impl JobPosting {
    pub fn default_expiry(posted: DateTime<Utc>) -> DateTime<Utc> {
        posted + Duration::days(DEFAULT_VALIDITY_DAYS)
    }

    pub fn check_dates(&self) -> Result<(), DomainError> {
        if self.expiry_date < self.posted_date {
            return Err(DomainError::ExpiryBeforePosted {
                posted: self.posted_date,
                expiry: self.expiry_date,
            });
        }
        Ok(())
    }
}

/// Output of normalization: a complete posting plus its origin, without a storage id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedJob {
    #[serde(flatten)]
    pub origin: JobOrigin,
    #[serde(flatten)]
    pub posting: JobPosting,
}

/// Persisted job. `applicants` is only ever appended to by the apply flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(flatten)]
    pub posting: JobPosting,
    #[serde(flatten)]
    pub origin: Option<JobOrigin>,
    #[serde(default)]
    pub applicants: Vec<String>,
}

impl Job {
    pub fn external_id(&self) -> Option<&str> {
        self.origin.as_ref().map(|o| o.external_id.as_str())
    }
}

/// Preview row: normalized but never persisted, addressed by a synthetic id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayJob {
    pub id: String,
    #[serde(flatten)]
    pub job: NormalizedJob,
    #[serde(default)]
    pub applicants: Vec<String>,
}

/// Merge update for the CRUD surface. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    #[serde(rename = "type")]
    pub employment_type: Option<EmploymentType>,
    pub salary: Option<String>,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub experience_level: Option<ExperienceLevel>,
    pub skills: Option<Vec<String>>,
    pub active: Option<bool>,
    pub posted_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub company_id: Option<String>,
}

impl JobPatch {
    /// Applies the patch, rejecting it (and leaving `posting` unchanged) if the
    /// result would expire before it was posted.
    pub fn apply_to(&self, posting: &mut JobPosting) -> Result<(), DomainError> {
        let mut next = posting.clone();
        if let Some(v) = &self.title {
            next.title = v.clone();
        }
        if let Some(v) = &self.company {
            next.company = v.clone();
        }
        if let Some(v) = &self.location {
            next.location = v.clone();
        }
        if let Some(v) = self.employment_type {
            next.employment_type = v;
        }
        if let Some(v) = &self.salary {
            next.salary = v.clone();
        }
        if let Some(v) = &self.description {
            next.description = v.clone();
        }
        if let Some(v) = &self.requirements {
            next.requirements = v.clone();
        }
        if let Some(v) = self.experience_level {
            next.experience_level = Some(v);
        }
        if let Some(v) = &self.skills {
            next.skills = v.clone();
        }
        if let Some(v) = self.active {
            next.active = v;
        }
        if let Some(v) = self.posted_date {
            next.posted_date = v;
        }
        if let Some(v) = self.expiry_date {
            next.expiry_date = v;
        }
        if let Some(v) = &self.company_id {
            next.company_id = Some(v.clone());
        }
        next.check_dates()?;
        *posting = next;
        Ok(())
    }
}

/// Keyword / location / type filter with 0-based pagination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobSearchQuery {
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, rename = "type")]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub size: Option<usize>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl JobSearchQuery {
    pub fn keyword(&self) -> Option<&str> {
        non_empty(&self.keyword)
    }

    pub fn location(&self) -> Option<&str> {
        non_empty(&self.location)
    }

    pub fn employment_type(&self) -> Option<&str> {
        non_empty(&self.employment_type)
    }

    pub fn page(&self) -> usize {
        self.page.unwrap_or(0)
    }

    pub fn size(&self) -> usize {
        match self.size {
            Some(0) | None => DEFAULT_PAGE_SIZE,
            Some(n) => n,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        let posting = &job.posting;
        if let Some(location) = self.location() {
            if !posting
                .location
                .to_lowercase()
                .contains(&location.to_lowercase())
            {
                return false;
            }
        }
        if let Some(kind) = self.employment_type() {
            if posting.employment_type.as_str() != kind {
                return false;
            }
        }
        if let Some(keyword) = self.keyword() {
            let keyword = keyword.to_lowercase();
            let hit = [&posting.title, &posting.description, &posting.company]
                .iter()
                .any(|field| field.to_lowercase().contains(&keyword));
            if !hit {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, jobs: Vec<Job>) -> JobPage {
        let filtered = jobs.into_iter().filter(|j| self.matches(j)).collect();
        JobPage::paginate(filtered, self.page(), self.size())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}

impl JobPage {
    pub fn paginate(all: Vec<Job>, page: usize, size: usize) -> Self {
        let total = all.len();
        let start = page.saturating_mul(size);
        let jobs = all.into_iter().skip(start).take(size).collect();
        Self {
            jobs,
            total,
            page,
            size,
        }
    }
}
