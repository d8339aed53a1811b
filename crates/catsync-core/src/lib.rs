//! Core domain model for catsync: problem records, canonical bundles and the
//! canonical dataset loader.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Topic tag a problem is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Arrays,
    Strings,
    Stacks,
    LinkedLists,
    Trees,
    Graphs,
    BinarySearch,
    DynamicProgramming,
    Recursion,
    Math,
    BitManipulation,
    HashTables,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::Arrays,
        Category::Strings,
        Category::Stacks,
        Category::LinkedLists,
        Category::Trees,
        Category::Graphs,
        Category::BinarySearch,
        Category::DynamicProgramming,
        Category::Recursion,
        Category::Math,
        Category::BitManipulation,
        Category::HashTables,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Arrays => "arrays",
            Category::Strings => "strings",
            Category::Stacks => "stacks",
            Category::LinkedLists => "linked-lists",
            Category::Trees => "trees",
            Category::Graphs => "graphs",
            Category::BinarySearch => "binary-search",
            Category::DynamicProgramming => "dynamic-programming",
            Category::Recursion => "recursion",
            Category::Math => "math",
            Category::BitManipulation => "bit-manipulation",
            Category::HashTables => "hash-tables",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// Case-significant on the wire: only the lowercase forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// Worked example shown alongside the description. Missing parts load as
/// empty strings so an incomplete stored example can still be repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub explanation: String,
}

impl Example {
    /// Lower-cased concatenation of all three parts, used by consistency checks.
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.input, self.output, self.explanation).to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: JsonValue,
    pub expected_output: JsonValue,
    #[serde(default)]
    pub is_hidden: bool,
}

/// A catalog entry as held in the canonical dataset and in the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemRecord {
    #[serde(rename = "_id", alias = "id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<Example>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub solution: String,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<u32>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Server-side fields this crate does not model, kept for write-back.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_active() -> bool {
    true
}

impl ProblemRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            slug: None,
            category: String::new(),
            topics: Vec::new(),
            difficulty: None,
            description: String::new(),
            examples: Vec::new(),
            test_cases: Vec::new(),
            constraints: Vec::new(),
            hints: Vec::new(),
            solution: String::new(),
            learning_objectives: Vec::new(),
            prerequisites: Vec::new(),
            estimated_time: None,
            is_active: true,
            extra: Map::new(),
        }
    }

    /// Slug as the server would key it: explicit if supplied, otherwise derived from the title.
    pub fn effective_slug(&self) -> String {
        match self.slug.as_deref().map(str::trim) {
            Some(slug) if !slug.is_empty() => slug.to_string(),
            _ => slugify(&self.title),
        }
    }

    pub fn category(&self) -> Option<Category> {
        self.category.parse().ok()
    }

    /// Snapshot of the fields a template overwrites. `None` when the stored
    /// category is not a known tag.
    pub fn bundle(&self) -> Option<CanonicalBundle> {
        Some(CanonicalBundle {
            category: self.category()?,
            description: self.description.clone(),
            examples: self.examples.clone(),
            test_cases: self.test_cases.clone(),
            solution: self.solution.clone(),
            constraints: self.constraints.clone(),
            hints: self.hints.clone(),
            learning_objectives: self.learning_objectives.clone(),
            prerequisites: self.prerequisites.clone(),
            estimated_time: self.estimated_time,
        })
    }

    /// Overwrite every bundle field wholesale. Identity, topics and difficulty are left alone.
    pub fn apply_bundle(&mut self, bundle: &CanonicalBundle) {
        self.category = bundle.category.as_str().to_string();
        self.description = bundle.description.clone();
        self.examples = bundle.examples.clone();
        self.test_cases = bundle.test_cases.clone();
        self.solution = bundle.solution.clone();
        self.constraints = bundle.constraints.clone();
        self.hints = bundle.hints.clone();
        self.learning_objectives = bundle.learning_objectives.clone();
        self.prerequisites = bundle.prerequisites.clone();
        self.estimated_time = bundle.estimated_time;
    }
}

/// The complete, self-consistent content of one problem type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalBundle {
    pub category: Category,
    pub description: String,
    pub examples: Vec<Example>,
    pub test_cases: Vec<TestCase>,
    pub solution: String,
    pub constraints: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub estimated_time: Option<u32>,
}

/// Server-compatible slug: lowercase ascii alphanumerics joined by single dashes.
pub fn slugify(title: &str) -> String {
    title
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Bare(Vec<JsonValue>),
    Wrapped { problems: Vec<JsonValue> },
}

/// Load the canonical dataset from a JSON file, preserving file order.
///
/// Accepts either a bare array of records or an object with a `problems` array.
pub fn load_canonical_dataset(path: impl AsRef<Path>) -> Result<Vec<ProblemRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_canonical_dataset(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_canonical_dataset(data: &str) -> Result<Vec<ProblemRecord>> {
    let values = match serde_json::from_str::<DatasetFile>(data)? {
        DatasetFile::Bare(values) => values,
        DatasetFile::Wrapped { problems } => problems,
    };
    let mut records = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        let record: ProblemRecord =
            serde_json::from_value(value).with_context(|| format!("record #{index}"))?;
        if record.title.trim().is_empty() {
            bail!("record #{index} has an empty title");
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn slug_is_derived_from_title_when_missing() {
        let mut record = ProblemRecord::new("  Two Sum (II): Sorted! ");
        assert_eq!(record.effective_slug(), "two-sum-ii-sorted");

        record.slug = Some("custom-slug".into());
        assert_eq!(record.effective_slug(), "custom-slug");

        record.slug = Some("   ".into());
        assert_eq!(record.effective_slug(), "two-sum-ii-sorted");
    }

    #[test]
    fn category_strings_round_trip_through_enum() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
        assert!("Arrays".parse::<Category>().is_err());
    }

    #[test]
    fn record_preserves_unknown_fields_and_wire_names() {
        let raw = r#"{
            "_id": "65f0",
            "title": "Valid Parentheses",
            "category": "arrays",
            "difficulty": "easy",
            "testCases": [{"input": {"s": "()"}, "expectedOutput": true}],
            "createdAt": "2024-01-01T00:00:00Z"
        }"#;
        let record: ProblemRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.id.as_deref(), Some("65f0"));
        assert_eq!(record.difficulty, Some(Difficulty::Easy));
        assert!(record.is_active);
        assert!(!record.test_cases[0].is_hidden);
        assert_eq!(record.extra["createdAt"], "2024-01-01T00:00:00Z");

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["_id"], "65f0");
        assert_eq!(back["difficulty"], "easy");
        assert_eq!(back["createdAt"], "2024-01-01T00:00:00Z");
        assert!(back.get("slug").is_none());
    }

    #[test]
    fn bundle_requires_known_category() {
        let mut record = ProblemRecord::new("x");
        record.category = "misc".into();
        assert!(record.bundle().is_none());
        record.category = "stacks".into();
        assert_eq!(record.bundle().unwrap().category, Category::Stacks);
    }

    #[test]
    fn apply_bundle_overwrites_content_but_keeps_identity() {
        let mut record = ProblemRecord::new("Group Anagrams");
        record.id = Some("a1".into());
        record.topics = vec!["strings".into()];
        record.hints = vec!["stale".into()];
        let bundle = CanonicalBundle {
            category: Category::HashTables,
            description: "Group the anagrams together.".into(),
            examples: vec![],
            test_cases: vec![],
            solution: "fn f() {}".into(),
            constraints: vec!["1 <= strs.length <= 10^4".into()],
            hints: vec![],
            learning_objectives: vec![],
            prerequisites: vec![],
            estimated_time: Some(20),
        };
        record.apply_bundle(&bundle);
        assert_eq!(record.id.as_deref(), Some("a1"));
        assert_eq!(record.topics, vec!["strings".to_string()]);
        assert!(record.hints.is_empty());
        assert_eq!(record.bundle().unwrap(), bundle);
    }

    #[test]
    fn loads_bare_and_wrapped_datasets_in_order() {
        let dir = tempdir().expect("tempdir");
        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, r#"[{"title": "B"}, {"title": "A"}]"#).unwrap();
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(&wrapped, r#"{"problems": [{"title": "C"}]}"#).unwrap();

        let titles: Vec<_> = load_canonical_dataset(&bare)
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["B", "A"]);
        assert_eq!(load_canonical_dataset(&wrapped).unwrap()[0].title, "C");
    }

    #[test]
    fn difficulty_is_case_significant() {
        let err = parse_canonical_dataset(r#"[{"title": "A", "difficulty": "hard"}, {"title": "B", "difficulty": "Easy"}]"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("record #1"), "{err:#}");
        assert!(serde_json::from_str::<Difficulty>("\"Medium\"").is_err());
        assert_eq!(serde_json::from_str::<Difficulty>("\"medium\"").unwrap(), Difficulty::Medium);
    }

    #[test]
    fn incomplete_examples_still_load() {
        let record: ProblemRecord =
            serde_json::from_str(r#"{"title": "T", "examples": [{"input": "nums=[2,7]", "output": "[0,1]"}]}"#).unwrap();
        assert_eq!(record.examples[0].explanation, "");
    }

    #[test]
    fn rejects_records_without_title() {
        let err = parse_canonical_dataset(r#"[{"title": "ok"}, {"title": " "}]"#).unwrap_err();
        assert!(err.to_string().contains("record #1"));
    }
}
