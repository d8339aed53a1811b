use catsync_classify::{fingerprint, Classification, RemediationEntry, RuleBook, TemplateCatalog};
use catsync_core::ProblemRecord;
use catsync_storage::{RecordRepository, RepositoryError, UnreadableRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reading stored records: {0}")]
    Repository(#[from] RepositoryError),
}

/// Why a stored record was rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum FixReason {
    MissingConstraints,
    CategoryMismatch { stored: String, inferred: String },
    ContaminatedExample { trigger: String, forbidden: String, example_index: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFix {
    pub id: Option<String>,
    pub title: String,
    pub previous_category: String,
    pub category: String,
    /// Template kind applied; `None` when only category and constraints were set.
    pub template: Option<String>,
    pub reasons: Vec<FixReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub inspected: usize,
    pub fixed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub ambiguous: usize,
    pub fixes: Vec<RecordFix>,
    /// Stored entries that did not parse and were left untouched.
    pub unreadable: Vec<UnreadableRecord>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# catsync reconcile report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Dry run: {}", self.dry_run),
            format!(
                "- Inspected: {} (fixed {}, skipped {}, failed {}, ambiguous {})",
                self.inspected, self.fixed, self.skipped, self.failed, self.ambiguous
            ),
        ];
        if !self.unreadable.is_empty() {
            lines.push(String::new());
            lines.push("## Unreadable records".to_string());
            for entry in &self.unreadable {
                lines.push(format!(
                    "- #{} {}: {}",
                    entry.index,
                    entry.title.as_deref().unwrap_or("(untitled)"),
                    entry.reason
                ));
            }
        }
        if !self.fixes.is_empty() {
            lines.push(String::new());
            lines.push("## Fixes".to_string());
            for fix in &self.fixes {
                lines.push(format!(
                    "- {}: {} -> {} ({})",
                    fix.title,
                    fix.previous_category,
                    fix.category,
                    fix.template.as_deref().unwrap_or("constraints only")
                ));
            }
        }
        if !self.errors.is_empty() {
            lines.push(String::new());
            lines.push("## Errors".to_string());
            lines.extend(self.errors.iter().map(|e| format!("- {e}")));
        }
        lines.join("\n") + "\n"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TitleRepair {
    pub title: String,
    pub template: String,
    pub matched: usize,
    pub fixed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateRepairReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub matched: usize,
    pub fixed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub titles: Vec<TitleRepair>,
    pub errors: Vec<String>,
}

impl DuplicateRepairReport {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# catsync duplicate repair report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Dry run: {}", self.dry_run),
            format!(
                "- Matched: {} (fixed {}, unchanged {}, failed {})",
                self.matched, self.fixed, self.unchanged, self.failed
            ),
            String::new(),
            "## Titles".to_string(),
        ];
        for title in &self.titles {
            lines.push(format!(
                "- {} -> {}: {} matched, {} fixed, {} unchanged",
                title.title, title.template, title.matched, title.fixed, title.unchanged
            ));
        }
        if !self.errors.is_empty() {
            lines.push(String::new());
            lines.push("## Errors".to_string());
            lines.extend(self.errors.iter().map(|e| format!("- {e}")));
        }
        lines.join("\n") + "\n"
    }
}

/// Rewrites stored records into their canonical shape.
pub struct ReconcileDriver<'a, R: ?Sized> {
    repo: &'a R,
    rules: &'a RuleBook,
    templates: &'a TemplateCatalog,
    dry_run: bool,
}

impl<'a, R: RecordRepository + ?Sized> ReconcileDriver<'a, R> {
    pub fn new(repo: &'a R, rules: &'a RuleBook, templates: &'a TemplateCatalog) -> Self {
        Self {
            repo,
            rules,
            templates,
            dry_run: false,
        }
    }

    /// Compute reports without writing to the repository.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reasons `record` is not canonical under `classification`; empty when it is.
    pub fn fix_reasons(&self, record: &ProblemRecord, classification: &Classification) -> Vec<FixReason> {
        let mut reasons = Vec::new();
        if self.rules.constraints_missing(&record.constraints) {
            reasons.push(FixReason::MissingConstraints);
        }
        // An unmatched record says nothing about a category the store already
        // holds, so only a missing or unknown one counts as a mismatch.
        let category_known = classification.is_ambiguous() && record.category().is_some();
        if !category_known && record.category != classification.category.as_str() {
            reasons.push(FixReason::CategoryMismatch {
                stored: record.category.clone(),
                inferred: classification.category.as_str().to_string(),
            });
        }
        reasons.extend(self.rules.contamination(record).into_iter().map(|c| {
            FixReason::ContaminatedExample {
                trigger: c.trigger,
                forbidden: c.forbidden,
                example_index: c.example_index,
            }
        }));
        reasons
    }

    /// Record rewritten to its template, or only to the classified category and
    /// constraints when no template exists for its kind. Unmatched records keep
    /// a valid stored category and take that category's constraints.
    fn canonical_form(&self, record: &ProblemRecord, classification: &Classification) -> (ProblemRecord, Option<String>) {
        let mut fixed = record.clone();
        let template = classification
            .kind
            .as_deref()
            .and_then(|kind| self.templates.get(kind).map(|bundle| (kind, bundle)));
        match template {
            Some((kind, bundle)) => {
                fixed.apply_bundle(bundle);
                (fixed, Some(kind.to_string()))
            }
            None => match record.category().filter(|_| classification.is_ambiguous()) {
                Some(stored) => {
                    fixed.constraints = self.rules.constraints_for(stored);
                    (fixed, None)
                }
                None => {
                    fixed.category = classification.category.as_str().to_string();
                    fixed.constraints = classification.constraints.clone();
                    (fixed, None)
                }
            },
        }
    }

    pub async fn reconcile_all(&self) -> Result<ReconcileReport, ReconcileError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id, dry_run = self.dry_run);
        self.reconcile_inner(run_id).instrument(span).await
    }

    async fn reconcile_inner(&self, run_id: Uuid) -> Result<ReconcileReport, ReconcileError> {
        let started_at = Utc::now();
        let records = self.repo.find_active().await?;
        info!(records = records.len(), "reconciling active records");

        let mut report = ReconcileReport {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run: self.dry_run,
            inspected: records.len(),
            fixed: 0,
            skipped: 0,
            failed: 0,
            ambiguous: 0,
            fixes: Vec::new(),
            unreadable: self.repo.unreadable(),
            errors: Vec::new(),
        };
        if !report.unreadable.is_empty() {
            warn!(count = report.unreadable.len(), "unreadable stored records left untouched");
        }

        for record in records {
            let classification = self.rules.classify_record(&record);
            if classification.is_ambiguous() {
                report.ambiguous += 1;
                warn!(title = %record.title, category = %classification.category, "classification ambiguous; using default category");
            }

            let reasons = self.fix_reasons(&record, &classification);
            if reasons.is_empty() {
                report.skipped += 1;
                continue;
            }

            let (fixed, template) = self.canonical_form(&record, &classification);
            if fixed == record {
                warn!(title = %record.title, ?reasons, "record is inconsistent but no template can repair it");
                report.skipped += 1;
                continue;
            }

            if !self.dry_run {
                if let Err(err) = self.repo.update(&fixed).await {
                    warn!(title = %record.title, error = %err, "update failed");
                    report.failed += 1;
                    report.errors.push(format!("{}: {err}", record.title));
                    continue;
                }
            }

            debug!(title = %record.title, template = ?template, "record reconciled");
            report.fixed += 1;
            report.fixes.push(RecordFix {
                id: record.id.clone(),
                title: record.title.clone(),
                previous_category: record.category.clone(),
                category: fixed.category.clone(),
                template,
                reasons,
            });
        }

        report.finished_at = Utc::now();
        info!(fixed = report.fixed, skipped = report.skipped, failed = report.failed, "reconcile finished");
        Ok(report)
    }

    /// Converge every record sharing a remediation title onto that title's template.
    pub async fn repair_duplicates(
        &self,
        remediation: &[RemediationEntry],
    ) -> Result<DuplicateRepairReport, ReconcileError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("duplicate_repair_run", %run_id, titles = remediation.len());
        self.repair_inner(run_id, remediation).instrument(span).await
    }

    async fn repair_inner(
        &self,
        run_id: Uuid,
        remediation: &[RemediationEntry],
    ) -> Result<DuplicateRepairReport, ReconcileError> {
        let started_at = Utc::now();
        let mut report = DuplicateRepairReport {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run: self.dry_run,
            matched: 0,
            fixed: 0,
            unchanged: 0,
            failed: 0,
            titles: Vec::new(),
            errors: Vec::new(),
        };

        for entry in remediation {
            let Some(bundle) = self.templates.get(&entry.kind) else {
                warn!(title = %entry.title, kind = %entry.kind, "no template for remediation entry");
                report.errors.push(format!("{}: unknown template {}", entry.title, entry.kind));
                continue;
            };

            let records = match self.repo.find_by_title(&entry.title).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(title = %entry.title, error = %err, "lookup failed");
                    report.errors.push(format!("{}: {err}", entry.title));
                    continue;
                }
            };

            let mut title_report = TitleRepair {
                title: entry.title.clone(),
                template: entry.kind.clone(),
                matched: records.len(),
                fixed: 0,
                unchanged: 0,
                failed: 0,
                fingerprint: (!records.is_empty()).then(|| fingerprint(bundle)),
            };

            for record in records {
                if record.bundle().as_ref() == Some(bundle) {
                    title_report.unchanged += 1;
                    continue;
                }
                let mut fixed = record.clone();
                fixed.apply_bundle(bundle);
                if !self.dry_run {
                    if let Err(err) = self.repo.update(&fixed).await {
                        warn!(title = %record.title, id = ?record.id, error = %err, "update failed");
                        title_report.failed += 1;
                        report.errors.push(format!("{} ({:?}): {err}", record.title, record.id));
                        continue;
                    }
                }
                title_report.fixed += 1;
            }

            info!(
                title = %entry.title,
                matched = title_report.matched,
                fixed = title_report.fixed,
                "duplicate set repaired"
            );
            report.matched += title_report.matched;
            report.fixed += title_report.fixed;
            report.unchanged += title_report.unchanged;
            report.failed += title_report.failed;
            report.titles.push(title_report);
        }

        report.finished_at = Utc::now();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::{Category, Example};
    use catsync_storage::memory::InMemoryRepository;

    fn tables() -> (RuleBook, TemplateCatalog) {
        (RuleBook::builtin().unwrap(), TemplateCatalog::builtin().unwrap())
    }

    fn stored(title: &str, category: &str, description: &str, constraints: &[&str]) -> ProblemRecord {
        let mut r = ProblemRecord::new(title);
        r.category = category.into();
        r.description = description.into();
        r.constraints = constraints.iter().map(|c| c.to_string()).collect();
        r
    }

    #[tokio::test]
    async fn consistent_records_are_skipped() {
        let (rules, templates) = tables();
        let repo = InMemoryRepository::new(vec![stored(
            "Valid Parentheses",
            "stacks",
            "Check the brackets.",
            &["1 <= s.length <= 10^4"],
        )]);
        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!((report.fixed, report.skipped), (0, 1));
        assert_eq!(repo.records().await[0].description, "Check the brackets.");
    }

    #[tokio::test]
    async fn contaminated_examples_trigger_a_template_rewrite() {
        let (rules, templates) = tables();
        let mut record = stored(
            "Missing Number",
            "math",
            "Find the missing number in the range.",
            &["1 <= n <= 10^4"],
        );
        record.examples = vec![Example {
            input: "n = 5".into(),
            output: "120".into(),
            explanation: "5 factorial".into(),
        }];
        let repo = InMemoryRepository::new(vec![record]);

        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!(report.fixed, 1);
        assert!(matches!(
            report.fixes[0].reasons[0],
            FixReason::ContaminatedExample { ref forbidden, .. } if forbidden == "factorial"
        ));
        let after = repo.get("doc-1").await.unwrap();
        assert_eq!(after.bundle().as_ref(), templates.get("missing-number"));
    }

    #[tokio::test]
    async fn second_pass_reports_nothing_to_fix() {
        let (rules, templates) = tables();
        let repo = InMemoryRepository::new(vec![
            stored("Valid Parentheses", "arrays", "", &[]),
            stored("Climbing Stairs", "math", "Count the distinct ways up.", &["TBD"]),
            stored("Sum It", "strings", "Return the sum.", &["n <= 10"]),
        ]);
        let driver = ReconcileDriver::new(&repo, &rules, &templates);

        let first = driver.reconcile_all().await.unwrap();
        assert_eq!(first.fixed, 3);
        let second = driver.reconcile_all().await.unwrap();
        assert_eq!((second.fixed, second.skipped), (0, 3));
    }

    #[tokio::test]
    async fn kinds_without_template_only_get_category_and_constraints() {
        let (rules, templates) = tables();
        let repo = InMemoryRepository::new(vec![stored(
            "Count Primes",
            "arrays",
            "Count the primes below n.",
            &[],
        )]);
        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!(report.fixes[0].template, None);

        let after = repo.get("doc-1").await.unwrap();
        assert_eq!(after.category, "math");
        assert_eq!(after.constraints, rules.constraints_for(Category::Math));
        assert_eq!(after.description, "Count the primes below n.");
    }

    #[tokio::test]
    async fn ambiguous_records_take_default_category_and_generic_constraints() {
        let (rules, templates) = tables();
        let repo = InMemoryRepository::new(vec![stored("Mystery", "", "Do the thing.", &[])]);
        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!(report.ambiguous, 1);
        assert_eq!(report.fixed, 1);
        let after = repo.get("doc-1").await.unwrap();
        assert_eq!(after.category, rules.default_category().as_str());
        assert_eq!(after.constraints, rules.generic_constraints());
    }

    #[tokio::test]
    async fn words_containing_keywords_do_not_pull_in_templates() {
        let (rules, templates) = tables();
        let description = "Given a paragraph and a list of banned words, return the most frequent word.";
        let repo = InMemoryRepository::new(vec![
            stored("Most Common Word", "strings", description, &["1 <= paragraph.length <= 1000"]),
            stored("Rotate Array", "strings", "Rotate right by k. Assume k is non-negative.", &["TBD"]),
        ]);
        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!((report.fixed, report.skipped), (1, 1));
        assert!(report.fixes.iter().all(|f| f.template.is_none()));

        let word = repo.get("doc-1").await.unwrap();
        assert_eq!(word.category, "strings");
        assert_eq!(word.description, description);

        let rotate = repo.get("doc-2").await.unwrap();
        assert_eq!(rotate.category, "arrays");
        assert_eq!(rotate.description, "Rotate right by k. Assume k is non-negative.");
    }

    #[tokio::test]
    async fn unmatched_records_keep_a_valid_stored_category() {
        let (rules, templates) = tables();
        let repo = InMemoryRepository::new(vec![stored("Mystery", "graphs", "Do the thing.", &[])]);
        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!(report.fixes[0].reasons, vec![FixReason::MissingConstraints]);
        let after = repo.get("doc-1").await.unwrap();
        assert_eq!(after.category, "graphs");
        assert_eq!(after.constraints, rules.constraints_for(Category::Graphs));
    }

    #[tokio::test]
    async fn dry_run_leaves_store_untouched() {
        let (rules, templates) = tables();
        let original = stored("Valid Parentheses", "arrays", "", &[]);
        let repo = InMemoryRepository::new(vec![original.clone()]);
        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .dry_run(true)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!(report.fixed, 1);
        assert_eq!(repo.records().await[0].category, "arrays");
    }

    #[tokio::test]
    async fn failed_updates_are_counted_and_the_run_continues() {
        let (rules, templates) = tables();
        let repo = InMemoryRepository::new(vec![
            stored("Valid Parentheses", "arrays", "", &[]),
            stored("Two Sum", "strings", "", &[]),
        ]);
        repo.fail_updates_for("doc-1").await;

        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .reconcile_all()
            .await
            .unwrap();
        assert_eq!((report.fixed, report.failed), (1, 1));
        assert_eq!(repo.get("doc-2").await.unwrap().category, "arrays");
        assert!(report.errors[0].starts_with("Valid Parentheses"));
    }

    #[tokio::test]
    async fn repair_skips_copies_that_already_match() {
        let (rules, templates) = tables();
        let bundle = templates.get("two-sum").unwrap();
        let mut canonical = ProblemRecord::new("Two Sum");
        canonical.apply_bundle(bundle);
        let repo = InMemoryRepository::new(vec![canonical, stored("Two Sum", "hash-tables", "", &[])]);

        let entries = [RemediationEntry {
            title: "Two Sum".into(),
            kind: "two-sum".into(),
        }];
        let driver = ReconcileDriver::new(&repo, &rules, &templates);
        let report = driver.repair_duplicates(&entries).await.unwrap();
        assert_eq!((report.matched, report.fixed, report.unchanged), (2, 1, 1));
        assert_eq!(report.titles[0].fingerprint.as_deref(), Some(fingerprint(bundle).as_str()));

        let again = driver.repair_duplicates(&entries).await.unwrap();
        assert_eq!((again.fixed, again.unchanged), (0, 2));
    }

    #[tokio::test]
    async fn repair_reports_unknown_templates_without_aborting() {
        let (rules, templates) = tables();
        let repo = InMemoryRepository::new(vec![stored("Two Sum", "", "", &[])]);
        let entries = [
            RemediationEntry {
                title: "Ghost".into(),
                kind: "no-such-kind".into(),
            },
            RemediationEntry {
                title: "Two Sum".into(),
                kind: "two-sum".into(),
            },
        ];
        let report = ReconcileDriver::new(&repo, &rules, &templates)
            .repair_duplicates(&entries)
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.fixed, 1);
    }
}
