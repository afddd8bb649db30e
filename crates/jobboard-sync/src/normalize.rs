//! Field normalizer: one external board record in, one complete canonical job out.

use chrono::{DateTime, Utc};
use jobboard_adapters::ExternalJobRecord;
use jobboard_core::{
    EmploymentType, ExperienceLevel, JobOrigin, JobPosting, NormalizedJob, SourceMetadata,
};
use thiserror::Error;

pub const SALARY_PLACEHOLDER: &str = "Competitive";
pub const UNKNOWN: &str = "Unknown";

/// Recognized technology terms, in reporting order. Matching is a plain
/// case-insensitive substring test, so a term also hits inside longer words:
/// "Java" in "JavaScript", "Git" in "digital", "AWS" in "laws".
pub const SKILL_VOCABULARY: &[&str] = &[
    "JavaScript",
    "TypeScript",
    "React",
    "Angular",
    "Vue.js",
    "Node.js",
    "Python",
    "Java",
    "Ruby",
    "PHP",
    "C++",
    "C#",
    "Rust",
    "Kotlin",
    "Swift",
    "PostgreSQL",
    "MySQL",
    "MongoDB",
    "Redis",
    "AWS",
    "GCP",
    "Docker",
    "Kubernetes",
    "GraphQL",
    "HTML",
    "CSS",
    "Git",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable updated_at timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// First match wins; the location rule is checked before any title rule.
pub fn employment_type(title: &str, location: &str) -> EmploymentType {
    let title = title.to_lowercase();
    let location = location.to_lowercase();
    if location.contains("remote") {
        EmploymentType::Remote
    } else if title.contains("intern") {
        EmploymentType::Internship
    } else if title.contains("contract") || title.contains("consultant") {
        EmploymentType::Contract
    } else if title.contains("part-time") || title.contains("part time") {
        EmploymentType::PartTime
    } else {
        EmploymentType::FullTime
    }
}

pub fn experience_level(title: &str) -> ExperienceLevel {
    let title = title.to_lowercase();
    let any = |terms: &[&str]| terms.iter().any(|t| title.contains(t));
    if any(&["senior", "sr.", "lead", "principal", "staff"]) {
        ExperienceLevel::Senior
    } else if any(&["intern", "junior", "jr.", "entry", "graduate"]) {
        ExperienceLevel::Entry
    } else {
        ExperienceLevel::Mid
    }
}

/// Greenhouse exposes no structured pay data.
pub fn salary(_record: &ExternalJobRecord) -> String {
    SALARY_PLACEHOLDER.to_string()
}

pub fn extract_skills(description: &str) -> Vec<String> {
    let haystack = description.to_lowercase();
    SKILL_VOCABULARY
        .iter()
        .filter(|term| haystack.contains(&term.to_lowercase()))
        .map(|term| term.to_string())
        .collect()
}

pub fn parse_updated_at(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, NormalizeError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| NormalizeError::InvalidTimestamp(text.to_string())),
    }
}

pub fn display_id(prefix: &str, external_id: &str) -> String {
    format!("{prefix}_{external_id}")
}

/// Pure apart from `now`, which stands in for a missing `updated_at` and decides `active`.
pub fn normalize(
    record: &ExternalJobRecord,
    source: &str,
    board: &str,
    now: DateTime<Utc>,
) -> Result<NormalizedJob, NormalizeError> {
    let external_id = record
        .id
        .clone()
        .ok_or(NormalizeError::MissingField("id"))?;
    let title = record
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(NormalizeError::MissingField("title"))?
        .to_string();

    let company = record.first_department().unwrap_or(UNKNOWN).to_string();
    let location = record.location_name().unwrap_or(UNKNOWN).to_string();
    let description = record.content_text();
    let posted_date = parse_updated_at(record.updated_at.as_deref())?.unwrap_or(now);
    let expiry_date = JobPosting::default_expiry(posted_date);

    Ok(NormalizedJob {
        origin: JobOrigin {
            source: source.to_string(),
            board: board.to_string(),
            external_id,
            source_metadata: SourceMetadata {
                url: record.absolute_url.clone(),
                internal_job_id: record.internal_job_id,
                metadata: record.metadata.clone(),
            },
        },
        posting: JobPosting {
            employment_type: employment_type(&title, &location),
            experience_level: Some(experience_level(&title)),
            salary: salary(record),
            skills: extract_skills(&description),
            requirements: description.clone(),
            description,
            active: now < expiry_date,
            posted_date,
            expiry_date,
            company_id: None,
            title,
            company,
            location,
        },
    })
}
