//! Keyword-rule classification of problem records and the canonical template catalog.
//!
//! Both tables are data: ordered YAML rule lists embedded at build time and
//! parsed once into immutable values.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use catsync_core::{Category, ProblemRecord};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

mod templates;

pub use templates::{fingerprint, TemplateCatalog};

const BUILTIN_RULES: &str = include_str!("../rules/classification.yaml");

#[derive(Debug, Error)]
pub enum RuleBookError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid rule book: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    default_category: Category,
    problem_rules: Vec<ProblemRule>,
    #[serde(default)]
    constraint_rules: Vec<ConstraintRule>,
    generic_constraints: Vec<String>,
    #[serde(default)]
    placeholder_constraints: Vec<String>,
    #[serde(default)]
    contamination_checks: Vec<ContaminationCheck>,
    #[serde(default)]
    remediation: Vec<RemediationEntry>,
}

/// Lower-cased phrase matched on word boundaries, so `graph` does not fire
/// inside `paragraph`. A plural `s`/`es` is accepted after the last word; a
/// trailing `*` leaves the end open for stems such as `parenthes*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct Keyword {
    phrase: String,
    pattern: Regex,
}

impl Keyword {
    pub fn new(raw: &str) -> Result<Self, regex::Error> {
        let normalized = normalize_needle(raw);
        let (phrase, open_end) = match normalized.strip_suffix('*') {
            Some(stem) => (stem.trim_end().to_string(), true),
            None => (normalized, false),
        };

        let is_word = |c: char| c.is_alphanumeric() || c == '_';
        let mut pattern = String::new();
        if phrase.starts_with(is_word) {
            pattern.push_str(r"\b");
        }
        pattern.push_str(&regex::escape(&phrase));
        if !open_end && phrase.ends_with(is_word) {
            pattern.push_str(r"(?:e?s)?\b");
        }
        Ok(Self {
            pattern: Regex::new(&pattern)?,
            phrase,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.phrase
    }

    pub fn is_empty(&self) -> bool {
        self.phrase.is_empty()
    }

    /// `text` must already be lower-cased.
    pub fn is_match(&self, text: &str) -> bool {
        !self.is_empty() && self.pattern.is_match(text)
    }
}

impl TryFrom<String> for Keyword {
    type Error = regex::Error;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(&raw)
    }
}

impl PartialEq for Keyword {
    fn eq(&self, other: &Self) -> bool {
        self.phrase == other.phrase
    }
}

impl Eq for Keyword {}

/// One row of the ordered problem table: any keyword in the text selects `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProblemRule {
    pub kind: String,
    pub category: Category,
    pub contains_any: Vec<Keyword>,
}

impl ProblemRule {
    /// `text` must already be lower-cased.
    pub fn matches(&self, text: &str) -> bool {
        self.contains_any.iter().any(|keyword| keyword.is_match(text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConstraintRule {
    pub category: Category,
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContaminationCheck {
    pub description_mentions: Keyword,
    pub examples_must_not_mention: Vec<Keyword>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemediationEntry {
    pub title: String,
    pub kind: String,
}

/// Outcome of classifying a title/description pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Problem kind of the first matching rule; `None` when nothing matched.
    pub kind: Option<String>,
    pub category: Category,
    pub constraints: Vec<String>,
    pub rule_index: Option<usize>,
}

impl Classification {
    /// No rule matched and the default category was used.
    pub fn is_ambiguous(&self) -> bool {
        self.rule_index.is_none()
    }
}

/// An example that mentions a concept foreign to its record's description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contamination {
    pub trigger: String,
    pub forbidden: String,
    pub example_index: usize,
}

#[derive(Debug, Clone)]
pub struct RuleBook {
    default_category: Category,
    problem_rules: Vec<ProblemRule>,
    constraint_rules: Vec<ConstraintRule>,
    generic_constraints: Vec<String>,
    placeholder_constraints: Vec<String>,
    contamination_checks: Vec<ContaminationCheck>,
    remediation: Vec<RemediationEntry>,
}

fn normalize_needle(needle: &str) -> String {
    needle.trim().to_lowercase()
}

impl RuleBook {
    /// Rule book compiled into the binary.
    pub fn builtin() -> Result<Self, RuleBookError> {
        Self::from_yaml_str(BUILTIN_RULES)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RuleBookError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuleBookError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleBookError> {
        let mut file: RulesFile = serde_yaml::from_str(text)?;

        if file.problem_rules.is_empty() {
            return Err(RuleBookError::Invalid("no problem rules".into()));
        }
        let mut kinds = HashSet::new();
        for rule in &mut file.problem_rules {
            rule.contains_any.retain(|k| !k.is_empty());
            if rule.contains_any.is_empty() {
                return Err(RuleBookError::Invalid(format!(
                    "rule {} has no keywords",
                    rule.kind
                )));
            }
            if !kinds.insert(rule.kind.clone()) {
                return Err(RuleBookError::Invalid(format!(
                    "rule {} is listed twice",
                    rule.kind
                )));
            }
        }
        if file.generic_constraints.is_empty() {
            return Err(RuleBookError::Invalid("generic constraints are empty".into()));
        }
        if let Some(rule) = file.constraint_rules.iter().find(|r| r.constraints.is_empty()) {
            return Err(RuleBookError::Invalid(format!(
                "constraint rule for {} is empty",
                rule.category
            )));
        }
        for check in &mut file.contamination_checks {
            check.examples_must_not_mention.retain(|k| !k.is_empty());
        }

        Ok(Self {
            default_category: file.default_category,
            problem_rules: file.problem_rules,
            constraint_rules: file.constraint_rules,
            generic_constraints: file.generic_constraints,
            placeholder_constraints: file
                .placeholder_constraints
                .iter()
                .map(|p| normalize_needle(p))
                .collect(),
            contamination_checks: file.contamination_checks,
            remediation: file.remediation,
        })
    }

    pub fn default_category(&self) -> Category {
        self.default_category
    }

    pub fn problem_rules(&self) -> &[ProblemRule] {
        &self.problem_rules
    }

    pub fn constraint_rules(&self) -> &[ConstraintRule] {
        &self.constraint_rules
    }

    pub fn generic_constraints(&self) -> &[String] {
        &self.generic_constraints
    }

    pub fn remediation(&self) -> &[RemediationEntry] {
        &self.remediation
    }

    pub fn rule_for_kind(&self, kind: &str) -> Option<&ProblemRule> {
        self.problem_rules.iter().find(|r| r.kind == kind)
    }

    /// First matching rule wins; no match falls back to the default category
    /// with generic constraints.
    pub fn classify(&self, title: &str, description: &str) -> Classification {
        let text = format!("{title} {description}").to_lowercase();
        let matched = self
            .problem_rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(&text));

        match matched {
            Some((index, rule)) => Classification {
                kind: Some(rule.kind.clone()),
                category: rule.category,
                constraints: self.constraints_for(rule.category),
                rule_index: Some(index),
            },
            None => Classification {
                kind: None,
                category: self.default_category,
                constraints: self.generic_constraints.clone(),
                rule_index: None,
            },
        }
    }

    pub fn classify_record(&self, record: &ProblemRecord) -> Classification {
        self.classify(&record.title, &record.description)
    }

    pub fn constraints_for(&self, category: Category) -> Vec<String> {
        self.constraint_rules
            .iter()
            .find(|r| r.category == category)
            .map(|r| r.constraints.clone())
            .unwrap_or_else(|| self.generic_constraints.clone())
    }

    /// True when the list is empty or holds nothing but placeholder entries.
    pub fn constraints_missing(&self, constraints: &[String]) -> bool {
        constraints.iter().all(|c| {
            let c = normalize_needle(c);
            c.is_empty() || self.placeholder_constraints.contains(&c)
        })
    }

    pub fn contamination(&self, record: &ProblemRecord) -> Vec<Contamination> {
        let description = record.description.to_lowercase();
        let examples: Vec<String> = record.examples.iter().map(|e| e.searchable_text()).collect();

        let mut found = Vec::new();
        for check in &self.contamination_checks {
            if !check.description_mentions.is_match(&description) {
                continue;
            }
            for (example_index, text) in examples.iter().enumerate() {
                if let Some(forbidden) = check
                    .examples_must_not_mention
                    .iter()
                    .find(|f| f.is_match(text))
                {
                    found.push(Contamination {
                        trigger: check.description_mentions.as_str().to_string(),
                        forbidden: forbidden.as_str().to_string(),
                        example_index,
                    });
                }
            }
        }
        found
    }
}
