use std::collections::BTreeMap;
use std::path::Path;

use catsync_core::{CanonicalBundle, ProblemRecord};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{RuleBook, RuleBookError};

const BUILTIN_TEMPLATES: &str = include_str!("../rules/templates.yaml");

#[derive(Debug, Deserialize)]
struct TemplatesFile {
    #[allow(dead_code)]
    version: u32,
    templates: BTreeMap<String, CanonicalBundle>,
}

/// Immutable table of canonical bundles keyed by problem kind.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, CanonicalBundle>,
}

impl TemplateCatalog {
    pub fn builtin() -> Result<Self, RuleBookError> {
        Self::from_yaml_str(BUILTIN_TEMPLATES)
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
        let file: TemplatesFile = serde_yaml::from_str(text)?;
        Ok(Self {
            templates: file.templates,
        })
    }

    pub fn get(&self, kind: &str) -> Option<&CanonicalBundle> {
        self.templates.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Check that every template is a fixed point of reconciliation under `rules`:
    /// its description classifies back to its own kind and category, its
    /// constraints are real and its examples pass the contamination checks.
    /// Remediation entries must point at existing templates.
    pub fn validate_against(&self, rules: &RuleBook) -> Result<(), RuleBookError> {
        for (kind, bundle) in &self.templates {
            let rule = rules
                .rule_for_kind(kind)
                .ok_or_else(|| RuleBookError::Invalid(format!("template {kind} has no rule")))?;
            if rule.category != bundle.category {
                return Err(RuleBookError::Invalid(format!(
                    "template {kind} is filed under {} but its rule says {}",
                    bundle.category, rule.category
                )));
            }

            let classified = rules.classify("", &bundle.description);
            if classified.kind.as_deref() != Some(kind.as_str()) {
                return Err(RuleBookError::Invalid(format!(
                    "template {kind} description classifies as {:?}",
                    classified.kind
                )));
            }
            if rules.constraints_missing(&bundle.constraints) {
                return Err(RuleBookError::Invalid(format!("template {kind} has no constraints")));
            }
            if bundle.examples.is_empty() || bundle.test_cases.is_empty() {
                return Err(RuleBookError::Invalid(format!(
                    "template {kind} needs examples and test cases"
                )));
            }

            let mut candidate = ProblemRecord::new(kind.clone());
            candidate.apply_bundle(bundle);
            if let Some(hit) = rules.contamination(&candidate).first() {
                return Err(RuleBookError::Invalid(format!(
                    "template {kind} example {} mentions {:?}",
                    hit.example_index, hit.forbidden
                )));
            }
        }

        for entry in rules.remediation() {
            if !self.templates.contains_key(&entry.kind) {
                return Err(RuleBookError::Invalid(format!(
                    "remediation for {:?} points at unknown template {}",
                    entry.title, entry.kind
                )));
            }
        }
        Ok(())
    }
}

/// SHA-256 over the bundle's JSON form. Equal fingerprints mean byte-identical bundles.
pub fn fingerprint(bundle: &CanonicalBundle) -> String {
    let bytes = serde_json::to_vec(bundle).expect("bundle always serializes to json");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::Category;

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::builtin().expect("builtin templates parse")
    }

    #[test]
    fn builtin_templates_are_fixed_points_of_the_builtin_rules() {
        let rules = RuleBook::builtin().unwrap();
        catalog().validate_against(&rules).unwrap();
    }

    #[test]
    fn builtin_catalog_covers_remediation_titles() {
        let catalog = catalog();
        let rules = RuleBook::builtin().unwrap();
        assert!(!rules.remediation().is_empty());
        for entry in rules.remediation() {
            assert!(catalog.get(&entry.kind).is_some(), "{}", entry.kind);
        }
        assert_eq!(catalog.get("group-anagrams").unwrap().category, Category::HashTables);
        assert_eq!(catalog.get("valid-parentheses").unwrap().category, Category::Stacks);
    }

    #[test]
    fn templates_keep_structured_test_case_inputs() {
        let bundle = catalog().get("two-sum").cloned().unwrap();
        assert_eq!(bundle.test_cases[0].input["target"], 9);
        assert_eq!(bundle.test_cases[0].expected_output, serde_json::json!([0, 1]));
        assert!(bundle.test_cases.iter().any(|t| t.is_hidden));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let catalog = catalog();
        let a = catalog.get("missing-number").unwrap();
        let b = catalog.get("factorial").unwrap();
        assert_eq!(fingerprint(a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(a), fingerprint(b));
        assert_eq!(fingerprint(a).len(), 64);
    }

    #[test]
    fn validation_rejects_template_with_wrong_category() {
        let rules = RuleBook::builtin().unwrap();
        let mut catalog = catalog();
        if let Some(bundle) = catalog.templates.get_mut("valid-parentheses") {
            bundle.category = Category::Arrays;
        }
        assert!(matches!(
            catalog.validate_against(&rules),
            Err(RuleBookError::Invalid(_))
        ));
    }

    #[test]
    fn validation_rejects_contaminated_template() {
        let rules = RuleBook::builtin().unwrap();
        let mut catalog = catalog();
        if let Some(bundle) = catalog.templates.get_mut("missing-number") {
            bundle.examples[0].explanation = "Like computing 3 factorial.".into();
        }
        let err = catalog.validate_against(&rules).unwrap_err();
        assert!(err.to_string().contains("factorial"));
    }
}
