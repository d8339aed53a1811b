//! In-memory stand-ins for the catalog service and the document store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use catsync_core::ProblemRecord;
use serde_json::json;
use tokio::sync::Mutex;

use crate::{
    CatalogClient, CatalogError, CreateOutcome, HealthStatus, Pagination, RecordPage,
    RecordRepository, RepositoryError,
};

#[derive(Debug, Default)]
struct CatalogState {
    records: Vec<ProblemRecord>,
    failures: HashMap<String, (u16, String)>,
    unreachable: bool,
    create_calls: usize,
}

/// Catalog service fake keyed by slug, mirroring the service's 409-on-duplicate behaviour.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the service were down.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Reject creates for `title` with the given status and body.
    pub async fn fail_title(&self, title: impl Into<String>, status: u16, body: impl Into<String>) {
        self.state
            .lock()
            .await
            .failures
            .insert(title.into(), (status, body.into()));
    }

    pub async fn records(&self) -> Vec<ProblemRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn create_calls(&self) -> usize {
        self.state.lock().await.create_calls
    }
}

fn down() -> CatalogError {
    CatalogError::Unreachable {
        url: "memory://catalog".to_string(),
        reason: "service marked unreachable".to_string(),
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn health_check(&self) -> Result<HealthStatus, CatalogError> {
        if self.state.lock().await.unreachable {
            return Err(down());
        }
        Ok(HealthStatus {
            status: "ok".to_string(),
        })
    }

    async fn list_records(&self, page: u32, limit: u32) -> Result<RecordPage, CatalogError> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(down());
        }
        let limit = limit.max(1) as usize;
        let page = page.max(1);
        let total = state.records.len();
        let total_pages = total.div_ceil(limit).max(1) as u32;
        let problems = state
            .records
            .iter()
            .skip((page as usize - 1) * limit)
            .take(limit)
            .cloned()
            .collect();
        Ok(RecordPage {
            problems,
            pagination: Pagination {
                current_page: page,
                total_pages,
                total_problems: total as u64,
            },
        })
    }

    async fn create_record(&self, record: &ProblemRecord) -> Result<CreateOutcome, CatalogError> {
        let mut state = self.state.lock().await;
        if state.unreachable {
            return Err(down());
        }
        state.create_calls += 1;

        if let Some((status, body)) = state.failures.get(&record.title) {
            return Err(CatalogError::Service {
                status: *status,
                body: body.clone(),
            });
        }

        let slug = record.effective_slug();
        if state.records.iter().any(|r| r.effective_slug() == slug) {
            return Ok(CreateOutcome::AlreadyExists {
                body: json!({ "error": "Problem with this slug already exists", "field": "slug" })
                    .to_string(),
            });
        }

        let mut created = record.clone();
        created.id = Some(format!("mem-{}", state.records.len() + 1));
        created.slug = Some(slug);
        state.records.push(created.clone());
        Ok(CreateOutcome::Created(created))
    }
}

/// Document store fake. Records without an id are given one on insert.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    records: Arc<Mutex<Vec<ProblemRecord>>>,
    failing_ids: Arc<Mutex<Vec<String>>>,
}

impl InMemoryRepository {
    pub fn new(records: Vec<ProblemRecord>) -> Self {
        let records = records
            .into_iter()
            .enumerate()
            .map(|(index, mut record)| {
                record.id.get_or_insert_with(|| format!("doc-{}", index + 1));
                record
            })
            .collect();
        Self {
            records: Arc::new(Mutex::new(records)),
            failing_ids: Arc::default(),
        }
    }

    pub async fn records(&self) -> Vec<ProblemRecord> {
        self.records.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ProblemRecord> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.id.as_deref() == Some(id))
            .cloned()
    }

    /// Make updates to `id` fail as if the write were rejected.
    pub async fn fail_updates_for(&self, id: impl Into<String>) {
        self.failing_ids.lock().await.push(id.into());
    }
}

#[async_trait]
impl RecordRepository for InMemoryRepository {
    async fn find_active(&self) -> Result<Vec<ProblemRecord>, RepositoryError> {
        let records = self.records.lock().await;
        Ok(records.iter().filter(|r| r.is_active).cloned().collect())
    }

    async fn find_by_title(&self, title: &str) -> Result<Vec<ProblemRecord>, RepositoryError> {
        let records = self.records.lock().await;
        Ok(records.iter().filter(|r| r.title == title).cloned().collect())
    }

    async fn update(&self, record: &ProblemRecord) -> Result<(), RepositoryError> {
        let id = record.id.clone().ok_or_else(|| RepositoryError::MissingId {
            title: record.title.clone(),
        })?;
        if self.failing_ids.lock().await.contains(&id) {
            return Err(RepositoryError::Io {
                path: format!("memory://{id}").into(),
                source: std::io::Error::other("write rejected"),
            });
        }
        let mut records = self.records.lock().await;
        let slot = records
            .iter_mut()
            .find(|r| r.id.as_deref() == Some(id.as_str()))
            .ok_or(RepositoryError::NotFound(id))?;
        *slot = record.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catalog_fake_conflicts_on_derived_slug() {
        let catalog = InMemoryCatalog::new();
        let first = catalog.create_record(&ProblemRecord::new("Two Sum")).await.unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));

        let mut explicit = ProblemRecord::new("Two  Sum!");
        explicit.slug = Some("two-sum".into());
        let second = catalog.create_record(&explicit).await.unwrap();
        assert!(matches!(second, CreateOutcome::AlreadyExists { .. }));

        assert_eq!(catalog.remote_count().await.unwrap(), 1);
        assert_eq!(catalog.create_calls().await, 2);
    }

    #[tokio::test]
    async fn catalog_fake_paginates() {
        let catalog = InMemoryCatalog::new();
        for title in ["a", "b", "c"] {
            catalog.create_record(&ProblemRecord::new(title)).await.unwrap();
        }
        let page = catalog.list_records(2, 2).await.unwrap();
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.problems.len(), 1);
        assert_eq!(page.problems[0].title, "c");
    }

    #[tokio::test]
    async fn repository_fake_assigns_ids_and_updates_in_place() {
        let mut inactive = ProblemRecord::new("b");
        inactive.is_active = false;
        let repo = InMemoryRepository::new(vec![ProblemRecord::new("a"), inactive]);
        assert_eq!(repo.find_active().await.unwrap().len(), 1);

        let mut record = repo.get("doc-2").await.unwrap();
        record.description = "changed".into();
        repo.update(&record).await.unwrap();
        assert_eq!(repo.get("doc-2").await.unwrap().description, "changed");
    }
}
