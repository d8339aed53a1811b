//! Catalog service client + record repository seams for catsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catsync_core::ProblemRecord;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod memory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u32,
    pub total_pages: u32,
    pub total_problems: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub problems: Vec<ProblemRecord>,
    pub pagination: Pagination,
}

/// Result of a create call. A 409 is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(ProblemRecord),
    AlreadyExists { body: String },
}

/// Error payload the catalog service returns on validation failures.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Option<JsonValue>,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog service unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Service { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl CatalogError {
    pub fn status(&self) -> Option<u16> {
        match self {
            CatalogError::Service { status, .. } => Some(*status),
            CatalogError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Human-readable reason, preferring the server's `{error, details, field}` payload.
    pub fn detail(&self) -> String {
        match self {
            CatalogError::Service { body, .. } => describe_error_body(body),
            other => other.to_string(),
        }
    }
}

pub fn describe_error_body(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<ServiceErrorBody>(body) else {
        return body.trim().to_string();
    };
    let mut parts = Vec::new();
    if let Some(error) = parsed.error {
        parts.push(error);
    }
    match parsed.details {
        Some(JsonValue::String(details)) => parts.push(details),
        Some(JsonValue::Null) | None => {}
        Some(other) => parts.push(other.to_string()),
    }
    if let Some(field) = parsed.field {
        parts.push(format!("field: {field}"));
    }
    if parts.is_empty() {
        body.trim().to_string()
    } else {
        parts.join(" - ")
    }
}

/// Remote catalog service surface consumed by the drivers. No retries happen here.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn health_check(&self) -> Result<HealthStatus, CatalogError>;

    async fn list_records(&self, page: u32, limit: u32) -> Result<RecordPage, CatalogError>;

    async fn create_record(&self, record: &ProblemRecord) -> Result<CreateOutcome, CatalogError>;

    async fn remote_count(&self) -> Result<u64, CatalogError> {
        Ok(self.list_records(1, 1).await?.pagination.total_problems)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn read_body(resp: reqwest::Response) -> Result<(StatusCode, String), CatalogError> {
    let status = resp.status();
    let body = resp.text().await?;
    Ok((status, body))
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, CatalogError> {
    serde_json::from_str(body).map_err(|e| CatalogError::Decode(e.to_string()))
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn health_check(&self) -> Result<HealthStatus, CatalogError> {
        let url = self.url("/api/health");
        let unreachable = |reason: String| CatalogError::Unreachable {
            url: url.clone(),
            reason,
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .instrument(info_span!("catalog_health", url = %url))
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let (status, body) = read_body(resp).await.map_err(|e| unreachable(e.to_string()))?;
        if !status.is_success() {
            return Err(unreachable(format!("http status {}", status.as_u16())));
        }
        decode(&body).map_err(|e| unreachable(e.to_string()))
    }

    async fn list_records(&self, page: u32, limit: u32) -> Result<RecordPage, CatalogError> {
        let url = self.url("/api/problems");
        let resp = self
            .client
            .get(&url)
            .query(&[("limit", limit), ("page", page)])
            .send()
            .instrument(info_span!("catalog_list", page, limit))
            .await?;
        let (status, body) = read_body(resp).await?;
        if !status.is_success() {
            return Err(CatalogError::Service {
                status: status.as_u16(),
                body,
            });
        }
        decode(&body)
    }

    /// Reads only the pagination block, so one malformed record on the first
    /// page cannot hide the count.
    async fn remote_count(&self) -> Result<u64, CatalogError> {
        #[derive(Deserialize)]
        struct PaginationOnly {
            pagination: Pagination,
        }

        let url = self.url("/api/problems");
        let resp = self
            .client
            .get(&url)
            .query(&[("limit", 1u32), ("page", 1u32)])
            .send()
            .instrument(info_span!("catalog_count"))
            .await?;
        let (status, body) = read_body(resp).await?;
        if !status.is_success() {
            return Err(CatalogError::Service {
                status: status.as_u16(),
                body,
            });
        }
        Ok(decode::<PaginationOnly>(&body)?.pagination.total_problems)
    }

    async fn create_record(&self, record: &ProblemRecord) -> Result<CreateOutcome, CatalogError> {
        let url = self.url("/api/problems");
        let resp = self
            .client
            .post(&url)
            .json(record)
            .send()
            .instrument(info_span!("catalog_create", title = %record.title))
            .await?;
        let (status, body) = read_body(resp).await?;

        if status == StatusCode::CONFLICT {
            return Ok(CreateOutcome::AlreadyExists { body });
        }
        if !status.is_success() {
            return Err(CatalogError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let created = serde_json::from_str::<JsonValue>(&body)
            .ok()
            .map(|value| match value {
                JsonValue::Object(mut map) if map.contains_key("problem") => {
                    map.remove("problem").unwrap_or_default()
                }
                other => other,
            })
            .and_then(|value| serde_json::from_value::<ProblemRecord>(value).ok());

        match created {
            Some(record) => Ok(CreateOutcome::Created(record)),
            None => {
                warn!(title = %record.title, "created record response was not a problem record; echoing request");
                Ok(CreateOutcome::Created(record.clone()))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no stored record with id {0}")]
    NotFound(String),
    #[error("record {title:?} has no store id")]
    MissingId { title: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid store snapshot {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A stored entry that could not be read as a problem record. It is kept
/// verbatim in the snapshot and left out of every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableRecord {
    pub index: usize,
    pub id: Option<String>,
    pub title: Option<String>,
    pub reason: String,
}

/// Document-store access needed by the reconciliation drivers.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn find_active(&self) -> Result<Vec<ProblemRecord>, RepositoryError>;

    /// Every record with exactly this title, active or not.
    async fn find_by_title(&self, title: &str) -> Result<Vec<ProblemRecord>, RepositoryError>;

    async fn update(&self, record: &ProblemRecord) -> Result<(), RepositoryError>;

    /// Entries skipped because they did not parse.
    fn unreadable(&self) -> Vec<UnreadableRecord> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum StoredEntry {
    Record(ProblemRecord),
    Raw(JsonValue),
}

/// Repository over a JSON snapshot of the document store.
///
/// The whole snapshot is rewritten on every update through a temp file and an
/// atomic rename, so a crash never leaves a half-written store behind. Entries
/// that fail to parse are reported through [`RecordRepository::unreadable`]
/// and written back untouched.
#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    entries: Mutex<Vec<StoredEntry>>,
    unreadable: Vec<UnreadableRecord>,
}

impl JsonFileRepository {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let path = path.into();
        let data = fs::read_to_string(&path)
            .await
            .map_err(|source| RepositoryError::Io {
                path: path.clone(),
                source,
            })?;
        let values: Vec<JsonValue> =
            serde_json::from_str(&data).map_err(|source| RepositoryError::Serde {
                path: path.clone(),
                source,
            })?;

        let mut entries = Vec::with_capacity(values.len());
        let mut unreadable = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            match serde_json::from_value::<ProblemRecord>(value.clone()) {
                Ok(mut record) => {
                    assign_missing_id(&mut record, index);
                    entries.push(StoredEntry::Record(record));
                }
                Err(err) => {
                    let field = |key: &str| value.get(key).and_then(JsonValue::as_str).map(str::to_string);
                    let skipped = UnreadableRecord {
                        index,
                        id: field("_id").or_else(|| field("id")),
                        title: field("title"),
                        reason: err.to_string(),
                    };
                    warn!(path = %path.display(), index, title = ?skipped.title, reason = %skipped.reason, "skipping unreadable stored record");
                    unreadable.push(skipped);
                    entries.push(StoredEntry::Raw(value));
                }
            }
        }
        debug!(
            path = %path.display(),
            records = entries.len() - unreadable.len(),
            unreadable = unreadable.len(),
            "opened store snapshot"
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            unreadable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Vec<ProblemRecord> {
        self.entries.lock().await.iter().filter_map(as_record).cloned().collect()
    }

    async fn persist(&self, entries: &[StoredEntry]) -> Result<(), RepositoryError> {
        let io_err = |source| RepositoryError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(entries).map_err(|source| RepositoryError::Serde {
            path: self.path.clone(),
            source,
        })?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        Ok(())
    }
}

fn as_record(entry: &StoredEntry) -> Option<&ProblemRecord> {
    match entry {
        StoredEntry::Record(record) => Some(record),
        StoredEntry::Raw(_) => None,
    }
}

/// A record without a store id gets a stable one derived from slug and snapshot position.
fn assign_missing_id(record: &mut ProblemRecord, index: usize) {
    if record.id.is_none() {
        let seed = format!("catsync:{}:{}", record.effective_slug(), index);
        record.id = Some(Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string());
    }
}

#[async_trait]
impl RecordRepository for JsonFileRepository {
    async fn find_active(&self) -> Result<Vec<ProblemRecord>, RepositoryError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter_map(as_record)
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }

    async fn find_by_title(&self, title: &str) -> Result<Vec<ProblemRecord>, RepositoryError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter_map(as_record)
            .filter(|r| r.title == title)
            .cloned()
            .collect())
    }

    async fn update(&self, record: &ProblemRecord) -> Result<(), RepositoryError> {
        let id = record.id.clone().ok_or_else(|| RepositoryError::MissingId {
            title: record.title.clone(),
        })?;
        let mut entries = self.entries.lock().await;
        let position = entries
            .iter()
            .position(|e| as_record(e).is_some_and(|r| r.id.as_deref() == Some(id.as_str())))
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        let previous = std::mem::replace(&mut entries[position], StoredEntry::Record(record.clone()));
        if let Err(err) = self.persist(&entries).await {
            entries[position] = previous;
            return Err(err);
        }
        Ok(())
    }

    fn unreadable(&self) -> Vec<UnreadableRecord> {
        self.unreadable.clone()
    }
}
