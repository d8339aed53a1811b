//! Synchronization and reconciliation drivers for catsync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use catsync_classify::{RuleBook, TemplateCatalog};
use catsync_core::{load_canonical_dataset, ProblemRecord};
use catsync_storage::{
    CatalogClient, CatalogError, CreateOutcome, HealthStatus, HttpCatalogClient, HttpClientConfig,
    JsonFileRepository,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod reconcile;

pub use reconcile::{
    DuplicateRepairReport, FixReason, ReconcileDriver, ReconcileError, ReconcileReport, RecordFix,
    TitleRepair,
};

pub const DEFAULT_CREATE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub dataset_path: PathBuf,
    pub store_path: PathBuf,
    pub reports_dir: PathBuf,
    pub create_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub write_reports: bool,
    pub rules_path: Option<PathBuf>,
    pub templates_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_url: lookup("CATSYNC_API_URL").unwrap_or_else(|| "http://localhost:5000".to_string()),
            dataset_path: lookup("CATSYNC_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/problems.json")),
            store_path: lookup("CATSYNC_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/store.json")),
            reports_dir: lookup("CATSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("reports")),
            create_delay: lookup("CATSYNC_CREATE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CREATE_DELAY),
            http_timeout_secs: lookup("CATSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: lookup("CATSYNC_USER_AGENT").unwrap_or_else(|| "catsync/0.1".to_string()),
            write_reports: lookup("CATSYNC_WRITE_REPORTS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            rules_path: lookup("CATSYNC_RULES_PATH").map(PathBuf::from),
            templates_path: lookup("CATSYNC_TEMPLATES_PATH").map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    /// Rule book and template catalog, built once and checked against each other.
    pub fn load_rules(&self) -> Result<(RuleBook, TemplateCatalog)> {
        let rules = match &self.rules_path {
            Some(path) => RuleBook::from_path(path)
                .with_context(|| format!("loading rules from {}", path.display()))?,
            None => RuleBook::builtin().context("loading builtin rules")?,
        };
        let templates = match &self.templates_path {
            Some(path) => TemplateCatalog::from_path(path)
                .with_context(|| format!("loading templates from {}", path.display()))?,
            None => TemplateCatalog::builtin().context("loading builtin templates")?,
        };
        templates
            .validate_against(&rules)
            .context("templates disagree with classification rules")?;
        Ok((rules, templates))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catalog service is unreachable; aborting run: {0}")]
    Unreachable(#[source] CatalogError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub title: String,
    pub slug: String,
    pub status: Option<u16>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub baseline_remote_count: Option<u64>,
    pub final_remote_count: Option<u64>,
    pub interrupted: bool,
    pub per_category: BTreeMap<String, CategoryCounts>,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn to_markdown(&self) -> String {
        let count = |c: Option<u64>| c.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into());
        let mut lines = vec![
            "# catsync sync report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Remote count before: {}", count(self.baseline_remote_count)),
            format!("- Remote count after: {}", count(self.final_remote_count)),
            format!(
                "- Attempted: {} (created {}, skipped {}, failed {})",
                self.attempted, self.created, self.skipped, self.failed
            ),
        ];
        if self.interrupted {
            lines.push("- Run was stopped before the dataset was exhausted".to_string());
        }
        lines.push(String::new());
        lines.push("## Categories".to_string());
        for (category, counts) in &self.per_category {
            lines.push(format!(
                "- {category}: created {}, skipped {}, failed {}",
                counts.created, counts.skipped, counts.failed
            ));
        }
        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Failures".to_string());
            for failure in &self.failures {
                let status = failure
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                lines.push(format!("- {} [{}]: {}", failure.title, status, failure.detail));
            }
        }
        lines.join("\n") + "\n"
    }
}

/// Pushes canonical records to the catalog one at a time, absorbing 409s as skips.
pub struct SyncDriver<C> {
    client: C,
    delay: Duration,
    stop: Option<Arc<AtomicBool>>,
}

impl<C: CatalogClient> SyncDriver<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            delay: DEFAULT_CREATE_DELAY,
            stop: None,
        }
    }

    /// Fixed pause inserted between consecutive create calls.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Flag checked before each record; raising it ends the run early.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn sync(&self, records: &[ProblemRecord]) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, records = records.len());
        self.sync_inner(run_id, records).instrument(span).await
    }

    async fn sync_inner(&self, run_id: Uuid, records: &[ProblemRecord]) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();

        let health = self.client.health_check().await.map_err(SyncError::Unreachable)?;
        info!(status = %health.status, "catalog service reachable");

        let baseline_remote_count = match self.client.remote_count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "could not read baseline remote count");
                None
            }
        };

        let mut report = SyncReport {
            run_id,
            started_at,
            finished_at: started_at,
            attempted: 0,
            created: 0,
            skipped: 0,
            failed: 0,
            baseline_remote_count,
            final_remote_count: None,
            interrupted: false,
            per_category: BTreeMap::new(),
            failures: Vec::new(),
        };

        for (index, record) in records.iter().enumerate() {
            if self.stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst)) {
                warn!(remaining = records.len() - index, "stop requested; ending sync early");
                report.interrupted = true;
                break;
            }

            report.attempted += 1;
            let category = if record.category.is_empty() {
                "uncategorized".to_string()
            } else {
                record.category.clone()
            };
            let counts = report.per_category.entry(category).or_default();

            match self.client.create_record(record).await {
                Ok(CreateOutcome::Created(_)) => {
                    debug!(title = %record.title, "created");
                    report.created += 1;
                    counts.created += 1;
                }
                Ok(CreateOutcome::AlreadyExists { .. }) => {
                    debug!(title = %record.title, "already exists; skipped");
                    report.skipped += 1;
                    counts.skipped += 1;
                }
                Err(err) => {
                    let failure = SyncFailure {
                        title: record.title.clone(),
                        slug: record.effective_slug(),
                        status: err.status(),
                        detail: err.detail(),
                    };
                    warn!(title = %failure.title, status = ?failure.status, detail = %failure.detail, "create failed");
                    report.failed += 1;
                    counts.failed += 1;
                    report.failures.push(failure);
                }
            }

            if index + 1 < records.len() && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        report.final_remote_count = match self.client.remote_count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "could not read final remote count");
                None
            }
        };
        report.finished_at = Utc::now();

        info!(
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            final_remote_count = ?report.final_remote_count,
            "sync finished"
        );
        Ok(report)
    }
}

/// Write `<kind>_report.json` and `summary.md` under `<reports_dir>/<run_id>/`.
pub async fn write_report<T: Serialize>(
    reports_dir: &Path,
    run_id: Uuid,
    kind: &str,
    report: &T,
    markdown: &str,
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).with_context(|| format!("serializing {kind} report"))?;
    let json_path = run_dir.join(format!("{kind}_report.json"));
    fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;
    fs::write(run_dir.join("summary.md"), markdown)
        .await
        .context("writing summary.md")?;
    Ok(run_dir)
}

/// Load the canonical dataset named by `config` and push it to the configured service.
pub async fn run_sync(config: &SyncConfig, stop: Option<Arc<AtomicBool>>) -> Result<SyncReport> {
    let records = load_canonical_dataset(&config.dataset_path)?;
    info!(path = %config.dataset_path.display(), records = records.len(), "loaded canonical dataset");

    let client = HttpCatalogClient::new(config.http_client_config())?;
    let mut driver = SyncDriver::new(client).with_delay(config.create_delay);
    if let Some(stop) = stop {
        driver = driver.with_stop_flag(stop);
    }
    let report = driver.sync(&records).await?;

    if config.write_reports {
        let dir = write_report(&config.reports_dir, report.run_id, "sync", &report, &report.to_markdown()).await?;
        info!(dir = %dir.display(), "wrote sync report");
    }
    Ok(report)
}

/// Reconcile every active record in the configured document store.
pub async fn run_reconcile(config: &SyncConfig, dry_run: bool) -> Result<ReconcileReport> {
    let (rules, templates) = config.load_rules()?;
    let repo = JsonFileRepository::open(&config.store_path)
        .await
        .with_context(|| format!("opening store {}", config.store_path.display()))?;

    let report = ReconcileDriver::new(&repo, &rules, &templates)
        .dry_run(dry_run)
        .reconcile_all()
        .await?;

    if config.write_reports {
        let dir =
            write_report(&config.reports_dir, report.run_id, "reconcile", &report, &report.to_markdown()).await?;
        info!(dir = %dir.display(), "wrote reconcile report");
    }
    Ok(report)
}

/// Converge the rule book's known duplicate titles onto their templates.
pub async fn run_duplicate_repair(config: &SyncConfig, dry_run: bool) -> Result<DuplicateRepairReport> {
    let (rules, templates) = config.load_rules()?;
    let repo = JsonFileRepository::open(&config.store_path)
        .await
        .with_context(|| format!("opening store {}", config.store_path.display()))?;

    let report = ReconcileDriver::new(&repo, &rules, &templates)
        .dry_run(dry_run)
        .repair_duplicates(rules.remediation())
        .await?;

    if config.write_reports {
        let dir = write_report(
            &config.reports_dir,
            report.run_id,
            "duplicate_repair",
            &report,
            &report.to_markdown(),
        )
        .await?;
        info!(dir = %dir.display(), "wrote duplicate repair report");
    }
    Ok(report)
}

/// Check the configured service once.
pub async fn check_health(config: &SyncConfig) -> Result<HealthStatus> {
    let client = HttpCatalogClient::new(config.http_client_config())?;
    Ok(client.health_check().await?)
}
