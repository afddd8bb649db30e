use chrono::{DateTime, Utc};
use jobboard_core::{EmploymentType, ExperienceLevel, JobPosting};
use jobboard_sync::SyncSummary;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    #[validate(length(min = 1))]
    pub board_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub message: String,
    #[serde(flatten)]
    pub summary: SyncSummary,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    #[serde(default)]
    #[validate(length(min = 1))]
    pub user_id: String,
}

impl ApplyRequest {
    /// Strips surrounding whitespace so a blank id fails validation.
    pub fn trimmed(self) -> Self {
        Self {
            user_id: self.user_id.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// Body of `POST /jobs`. Only title and company are mandatory.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewJobPayload {
    #[serde(default)]
    #[validate(length(min = 1))]
    pub title: String,
    #[serde(default)]
    #[validate(length(min = 1))]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, rename = "type")]
    pub employment_type: EmploymentType,
    #[serde(default)]
    pub salary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub experience_level: Option<ExperienceLevel>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub posted_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub company_id: Option<String>,
}

impl NewJobPayload {
    pub fn into_posting(self, now: DateTime<Utc>) -> JobPosting {
        let posted_date = self.posted_date.unwrap_or(now);
        let expiry_date = self
            .expiry_date
            .unwrap_or_else(|| JobPosting::default_expiry(posted_date));
        JobPosting {
            title: self.title.trim().to_string(),
            company: self.company.trim().to_string(),
            location: self.location,
            employment_type: self.employment_type,
            salary: self.salary,
            description: self.description,
            requirements: self.requirements,
            experience_level: self.experience_level,
            skills: self.skills,
            active: self.active.unwrap_or(true),
            posted_date,
            expiry_date,
            company_id: self.company_id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub size: Option<usize>,
}
