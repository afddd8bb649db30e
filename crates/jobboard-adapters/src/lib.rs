//! External job source contracts and the Greenhouse job board client.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobboard_storage::{FetchError, HttpFetcher};
use scraper::node::Node;
use scraper::Html;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

pub const CRATE_NAME: &str = "jobboard-adapters";

pub const GREENHOUSE_SOURCE_ID: &str = "greenhouse";
pub const GREENHOUSE_DISPLAY_PREFIX: &str = "gh";
pub const GREENHOUSE_API_BASE: &str = "https://boards-api.greenhouse.io/v1/boards";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid board token {0:?}")]
    InvalidBoard(String),
    #[error("fetching board {board} failed: {source}")]
    Fetch {
        board: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding board {board} payload failed: {source}")]
    Decode {
        board: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Department {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocationRef {
    #[serde(default)]
    pub name: Option<String>,
}

/// One job as the board API returns it. Everything is optional because the
/// feed is not trusted; the normalizer decides what is required. A field of the
/// wrong JSON type fails [`RawJobRecord::decode`] for that record only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalJobRecord {
    #[serde(default, deserialize_with = "deserialize_external_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub departments: Option<Vec<Department>>,
    #[serde(default)]
    pub location: Option<LocationRef>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub absolute_url: Option<String>,
    #[serde(default)]
    pub internal_job_id: Option<i64>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

impl ExternalJobRecord {
    pub fn first_department(&self) -> Option<&str> {
        self.departments
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|d| d.name.as_deref())
            .map(str::trim)
            .find(|name| !name.is_empty())
    }

    pub fn location_name(&self) -> Option<&str> {
        self.location
            .as_ref()
            .and_then(|l| l.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Plain-text rendering of `content`; empty when the record has none.
    pub fn content_text(&self) -> String {
        self.content.as_deref().map(html_to_text).unwrap_or_default()
    }
}

fn deserialize_external_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    Ok(Option::<RawId>::deserialize(deserializer)?.and_then(|raw| {
        let id = match raw {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        };
        (!id.is_empty()).then_some(id)
    }))
}

/// One element of a board's `jobs` array, still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawJobRecord(JsonValue);

impl RawJobRecord {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    /// The `id` field as text, read without decoding the rest of the record.
    pub fn external_id(&self) -> Option<String> {
        match self.0.get("id")? {
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::String(s) => Some(s.trim().to_string()).filter(|id| !id.is_empty()),
            _ => None,
        }
    }

    pub fn decode(&self) -> Result<ExternalJobRecord, serde_json::Error> {
        ExternalJobRecord::deserialize(&self.0)
    }
}

impl From<ExternalJobRecord> for RawJobRecord {
    fn from(record: ExternalJobRecord) -> Self {
        Self(serde_json::to_value(record).unwrap_or_default())
    }
}

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "td", "section",
    "blockquote",
];

fn fragment_text(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let mut out = String::with_capacity(input.len());
    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => out.push(' '),
            _ => {}
        }
    }
    out
}

/// Decodes entity-escaped HTML (as Greenhouse serves `content`) down to collapsed plain text.
pub fn html_to_text(input: &str) -> String {
    let mut text = fragment_text(input);
    if text.contains('<') && text.contains('>') {
        text = fragment_text(&text);
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a board payload into raw records. Only the envelope is checked: a body
/// that is not a JSON object with a `jobs` array fails the whole board.
pub fn parse_board_payload(board: &str, bytes: &[u8]) -> Result<Vec<RawJobRecord>, SourceError> {
    let decode_error = |source| SourceError::Decode {
        board: board.to_string(),
        source,
    };
    let envelope: JsonValue = serde_json::from_slice(bytes).map_err(decode_error)?;
    let JsonValue::Object(mut body) = envelope else {
        return Err(decode_error(serde_json::Error::custom(
            "expected a JSON object with a `jobs` array",
        )));
    };
    match body.remove("jobs") {
        Some(JsonValue::Array(jobs)) => Ok(jobs.into_iter().map(RawJobRecord).collect()),
        Some(_) => Err(decode_error(serde_json::Error::custom("`jobs` is not an array"))),
        None => Err(decode_error(serde_json::Error::custom("missing field `jobs`"))),
    }
}

pub fn load_board_fixture(path: impl AsRef<Path>) -> Result<Vec<RawJobRecord>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_board_payload(&path.display().to_string(), &bytes)
        .with_context(|| format!("parsing {}", path.display()))
}

/// Board tokens end up in a URL path, so only slug characters are accepted.
pub fn validate_board_token(board: &str) -> Result<&str, SourceError> {
    let trimmed = board.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(trimmed)
    } else {
        Err(SourceError::InvalidBoard(board.to_string()))
    }
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Stable source name stored on every imported job.
    fn source_id(&self) -> &'static str;

    /// Prefix for preview identifiers, e.g. `gh` in `gh_4001`.
    fn display_prefix(&self) -> &'static str;

    /// The full job list for `board`. A transport failure or an unreadable
    /// envelope fails the whole call; records are decoded one by one later.
    async fn fetch_jobs(&self, board: &str) -> Result<Vec<RawJobRecord>, SourceError>;
}

pub struct GreenhouseSource {
    http: HttpFetcher,
    api_base: String,
}

impl GreenhouseSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            api_base: GREENHOUSE_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn board_url(&self, board: &str) -> String {
        format!(
            "{}/{}/jobs?content=true",
            self.api_base.trim_end_matches('/'),
            board
        )
    }
}

#[async_trait]
impl JobSource for GreenhouseSource {
    fn source_id(&self) -> &'static str {
        GREENHOUSE_SOURCE_ID
    }

    fn display_prefix(&self) -> &'static str {
        GREENHOUSE_DISPLAY_PREFIX
    }

    async fn fetch_jobs(&self, board: &str) -> Result<Vec<RawJobRecord>, SourceError> {
        let board = validate_board_token(board)?;
        let url = self.board_url(board);
        let response = self
            .http
            .fetch_bytes(board, &url)
            .await
            .map_err(|source| SourceError::Fetch {
                board: board.to_string(),
                source,
            })?;

        let records = parse_board_payload(board, &response.body)?;
        match &response.archived {
            Some(stored) => info!(
                board,
                records = records.len(),
                archived = %stored.path.display(),
                reused = stored.reused,
                "fetched greenhouse board"
            ),
            None => info!(board, records = records.len(), "fetched greenhouse board"),
        }
        Ok(records)
    }
}

/// In-process source serving canned boards, used by tests and local demos.
#[derive(Debug, Default)]
pub struct FixtureSource {
    boards: RwLock<HashMap<String, Result<Vec<RawJobRecord>, String>>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_board(mut self, board: &str, records: Vec<RawJobRecord>) -> Self {
        self.boards
            .get_mut()
            .insert(board.to_string(), Ok(records));
        self
    }

    pub async fn set_board(&self, board: &str, records: Vec<RawJobRecord>) {
        self.boards
            .write()
            .await
            .insert(board.to_string(), Ok(records));
    }

    pub async fn fail_board(&self, board: &str, message: &str) {
        self.boards
            .write()
            .await
            .insert(board.to_string(), Err(message.to_string()));
    }
}

#[async_trait]
impl JobSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        GREENHOUSE_SOURCE_ID
    }

    fn display_prefix(&self) -> &'static str {
        GREENHOUSE_DISPLAY_PREFIX
    }

    async fn fetch_jobs(&self, board: &str) -> Result<Vec<RawJobRecord>, SourceError> {
        let board = validate_board_token(board)?;
        match self.boards.read().await.get(board) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err(message)) => Err(SourceError::Unavailable(message.clone())),
            None => Err(SourceError::Unavailable(format!("unknown board {board}"))),
        }
    }
}
