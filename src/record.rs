//! Candidate records returned by the storage backends.
//!
//! A record is an identifier plus a flat map of displayable attributes.
//! Identifiers are globally unique and stable across both backends, which is
//! what lets the merger deduplicate and the paginator slice without skipping
//! or repeating rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A row produced by a backend executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Globally unique, stable identifier. Global ordering is by this value.
    pub id: String,
    /// All displayable attributes (`mobile`, `name`, `address`, ...).
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

impl CandidateRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    /// Attribute value, or `None` when the record does not carry the field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.attributes.get(field).map(String::as_str)
    }

    /// Fields whose values differ between two versions of the same record.
    ///
    /// A field present on only one side counts as divergent.
    pub fn divergent_fields(&self, other: &CandidateRecord) -> Vec<String> {
        let mut fields: Vec<String> = self
            .attributes
            .iter()
            .filter(|(k, v)| other.attributes.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in other.attributes.keys() {
            if !self.attributes.contains_key(key) {
                fields.push(key.clone());
            }
        }
        fields.sort();
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_get() {
        let rec = CandidateRecord::new("p-1").with("name", "Asha Singh").with("mobile", "9876543210");
        assert_eq!(rec.get("name"), Some("Asha Singh"));
        assert_eq!(rec.get("email"), None);
    }

    #[test]
    fn test_serializes_flat() {
        let rec = CandidateRecord::new("p-1").with("name", "Asha");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json, serde_json::json!({"id": "p-1", "name": "Asha"}));
    }

    #[test]
    fn test_divergent_fields() {
        let a = CandidateRecord::new("x").with("name", "A").with("mobile", "1");
        let b = CandidateRecord::new("x").with("name", "B").with("email", "e");
        assert_eq!(a.divergent_fields(&b), vec!["email", "mobile", "name"]);
        assert!(a.divergent_fields(&a.clone()).is_empty());
    }
}
