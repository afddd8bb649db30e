//! Greenhouse sync: normalization, idempotent upserts, batch orchestration and scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobboard_adapters::{GreenhouseSource, GREENHOUSE_API_BASE};
use jobboard_storage::{HttpClientConfig, HttpFetcher, PayloadArchive, RetryPolicy};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod normalize;
mod pipeline;

pub use normalize::{normalize, NormalizeError};
pub use pipeline::{
    resolve_upsert, BoardPreview, BoardRun, RecordError, SyncError, SyncPipeline, SyncSummary,
};

pub const CRATE_NAME: &str = "jobboard-sync";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<BoardConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BoardConfig {
    pub board_token: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing board registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_boards(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.board_token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub greenhouse_api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: u32,
    pub deactivate_missing: bool,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub artifacts_dir: Option<PathBuf>,
    pub web_port: u16,
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or malformed values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: var("DATABASE_URL"),
            greenhouse_api_base: var("GREENHOUSE_API_BASE")
                .unwrap_or_else(|| GREENHOUSE_API_BASE.to_string()),
            user_agent: var("JOBBOARD_USER_AGENT")
                .unwrap_or_else(|| "jobboard-sync/0.1".to_string()),
            http_timeout_secs: var("JOBBOARD_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            http_max_retries: var("JOBBOARD_HTTP_MAX_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(2),
            deactivate_missing: var("JOBBOARD_DEACTIVATE_MISSING")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(true),
            sources_file: var("JOBBOARD_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            scheduler_enabled: var("JOBBOARD_SCHEDULER_ENABLED")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(false),
            sync_cron: var("SYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            artifacts_dir: var("ARTIFACTS_DIR").map(PathBuf::from),
            web_port: var("JOBBOARD_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy::with_retries(self.http_max_retries),
        }
    }

    pub fn greenhouse_source(&self) -> Result<GreenhouseSource> {
        let mut http = HttpFetcher::new(self.http_client_config())?;
        if let Some(dir) = &self.artifacts_dir {
            http = http.with_archive(PayloadArchive::new(dir));
        }
        Ok(GreenhouseSource::new(http).with_api_base(self.greenhouse_api_base.clone()))
    }
}

/// Syncs every enabled board in the registry file, logging one line per board.
pub async fn sync_registry(pipeline: &SyncPipeline, sources_file: &Path) -> Result<Vec<BoardRun>> {
    let registry = SourceRegistry::load(sources_file).await?;
    let boards = registry.enabled_boards();
    if boards.is_empty() {
        warn!(path = %sources_file.display(), "no enabled boards in registry");
    }
    Ok(pipeline.sync_boards(&boards).await)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let sources_file = config.sources_file.clone();
    let job = Job::new_async(&config.sync_cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let sources_file = sources_file.clone();
        Box::pin(async move {
            match sync_registry(&pipeline, &sources_file).await {
                Ok(runs) => {
                    let failed = runs.iter().filter(|r| r.result.is_err()).count();
                    info!(boards = runs.len(), failed, "scheduled sync finished");
                }
                Err(err) => error!(error = %err, "scheduled sync could not start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use jobboard_adapters::FixtureSource;
    use jobboard_storage::InMemoryJobStore;

    #[test]
    fn config_defaults_when_env_is_empty() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, None);
        assert_eq!(config.greenhouse_api_base, GREENHOUSE_API_BASE);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.http_max_retries, 2);
        assert!(config.deactivate_missing);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.sync_cron, "0 0 */6 * * *");
        assert_eq!(config.sources_file, PathBuf::from("sources.yaml"));
        assert_eq!(config.artifacts_dir, None);
        assert_eq!(config.web_port, 8000);
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://jobs@localhost/jobs"),
            ("JOBBOARD_HTTP_TIMEOUT_SECS", "5"),
            ("JOBBOARD_HTTP_MAX_RETRIES", "many"),
            ("JOBBOARD_DEACTIVATE_MISSING", "false"),
            ("JOBBOARD_SCHEDULER_ENABLED", "1"),
            ("ARTIFACTS_DIR", "/tmp/payloads"),
            ("JOBBOARD_WEB_PORT", "9100"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://jobs@localhost/jobs")
        );
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.http_max_retries, 2);
        assert!(!config.deactivate_missing);
        assert!(config.scheduler_enabled);
        assert_eq!(config.artifacts_dir, Some(PathBuf::from("/tmp/payloads")));
        assert_eq!(config.web_port, 9100);
        assert_eq!(
            config.http_client_config().timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.http_client_config().retry.attempts, 3);
    }

    #[test]
    fn registry_lists_enabled_boards_only() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - board_token: acme
    display_name: Acme Corp
    enabled: true
  - board_token: globex
    enabled: false
  - board_token: initech
"#,
        )
        .unwrap();
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.enabled_boards(), vec!["acme", "initech"]);
    }

    #[tokio::test]
    async fn sync_registry_runs_enabled_boards_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - board_token: acme\n  - board_token: globex\n    enabled: false\n",
        )
        .unwrap();

        let store = Arc::new(InMemoryJobStore::new());
        let source = Arc::new(FixtureSource::new().with_board("acme", Vec::new()));
        let pipeline = SyncPipeline::new(source, store);

        let runs = sync_registry(&pipeline, &path).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].board, "acme");
        assert_eq!(runs[0].result.as_ref().unwrap().total, 0);

        assert!(sync_registry(&pipeline, &dir.path().join("missing.yaml"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let store = Arc::new(InMemoryJobStore::new());
        let pipeline = Arc::new(SyncPipeline::new(Arc::new(FixtureSource::new()), store));

        let disabled = SyncConfig::from_lookup(|_| None);
        assert!(maybe_build_scheduler(&disabled, pipeline.clone())
            .await
            .unwrap()
            .is_none());

        let enabled = SyncConfig::from_lookup(|key| {
            (key == "JOBBOARD_SCHEDULER_ENABLED").then(|| "true".to_string())
        });
        assert!(maybe_build_scheduler(&enabled, pipeline)
            .await
            .unwrap()
            .is_some());
    }
}
