//! Persistence, raw payload archiving and outbound HTTP for the job board.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod jobs;
mod postgres;

pub use jobs::{InMemoryJobStore, JobStore, StoreError, UpsertOutcome};
pub use postgres::PgJobStore;

pub const CRATE_NAME: &str = "jobboard-storage";

/// Where a fetched body ended up, relative to the archive root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPayload {
    pub path: PathBuf,
    pub content_hash: String,
    /// The same body was already archived for this label and day.
    pub reused: bool,
}

/// Content-addressed store for raw fetch bodies, laid out as
/// `<root>/<label>/<YYYY-MM-DD>/<sha256>.json`.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn store(
        &self,
        label: &str,
        fetched_at: DateTime<Utc>,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = hex::encode(Sha256::digest(body));
        let day_dir = PathBuf::from(label).join(fetched_at.format("%Y-%m-%d").to_string());
        let path = day_dir.join(format!("{content_hash}.json"));

        let dir = self.root.join(&day_dir);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        // Hard-linking a fully written staging file never replaces an existing payload.
        let staged = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&staged, body)
            .await
            .with_context(|| format!("writing {}", staged.display()))?;
        let target = self.root.join(&path);
        let linked = fs::hard_link(&staged, &target).await;
        if let Err(err) = fs::remove_file(&staged).await {
            debug!(path = %staged.display(), error = %err, "staging file left behind");
        }

        let reused = match linked {
            Ok(()) => false,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => true,
            Err(err) => {
                return Err(err).with_context(|| format!("linking {}", target.display()));
            }
        };

        Ok(ArchivedPayload {
            path,
            content_hash,
            reused,
        })
    }
}

/// Total attempts per request and the doubling pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            attempts: retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Pause after failed attempt `attempt` (1-based).
    pub fn pause_after(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
    /// Set when the fetcher has an archive and the write succeeded.
    pub archived: Option<ArchivedPayload>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Timeouts, refused connections, 5xx and 429 may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
        }
    }
}

/// GET client with a request timeout, retries on transient failures and an
/// optional archive that receives every successful body.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    archive: Option<PayloadArchive>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
            archive: None,
        })
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Fetches `url`; `label` names the span and the archive partition.
    /// Archive failures are logged and never fail the fetch.
    pub async fn fetch_bytes(&self, label: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", label, url);
        async {
            let mut response = self.get_with_retries(url).await?;
            if let Some(archive) = &self.archive {
                match archive.store(label, response.fetched_at, &response.body).await {
                    Ok(stored) => response.archived = Some(stored),
                    Err(err) => warn!(error = ?err, "payload archive write failed"),
                }
            }
            Ok::<_, FetchError>(response)
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<(String, Vec<u8>), FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok((final_url, resp.bytes().await?.to_vec()))
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 1;
        loop {
            match self.get_once(url).await {
                Ok((final_url, body)) => {
                    return Ok(FetchedResponse {
                        final_url,
                        fetched_at: Utc::now(),
                        body,
                        archived: None,
                    })
                }
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    let pause = self.retry.pause_after(attempt);
                    warn!(error = %err, attempt, pause_ms = pause.as_millis() as u64, "transient fetch failure");
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
