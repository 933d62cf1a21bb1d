// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field Matcher - compiles (field, value, match type) into predicates
//!
//! Values are normalised (trimmed, case-folded) once at compile time so every
//! backend compares against the same canonical text.
//!
//! # Example
//!
//! ```rust
//! use record_search::search::{FieldMatcher, MatchType, Comparator};
//!
//! let matcher = FieldMatcher::new(["name", "mobile"]);
//!
//! let p = matcher.compile("name", "  Singh ", MatchType::Partial).unwrap();
//! assert_eq!(p.comparator, Comparator::Contains);
//! assert_eq!(p.value, "singh");
//!
//! // Empty text matches everything rather than failing
//! let all = matcher.compile("mobile", "   ", MatchType::Full).unwrap();
//! assert_eq!(all.comparator, Comparator::Always);
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::record::CandidateRecord;

use super::request::{CombineLogic, MatchType};

/// Field comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    /// Exact match on the normalised value
    Equals,
    /// Substring match on the normalised value
    Contains,
    /// Matches every record (empty query text)
    Always,
}

/// A resolved (field, comparator, value) unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPredicate {
    /// Field name (e.g., "mobile", "name")
    pub field: String,
    /// Comparison operator
    pub comparator: Comparator,
    /// Normalised comparison value (empty for `Always`)
    pub value: String,
}

impl FieldPredicate {
    #[must_use]
    pub fn is_always(&self) -> bool {
        self.comparator == Comparator::Always
    }

    /// Evaluate against a record. A missing attribute compares as empty text.
    #[must_use]
    pub fn matches(&self, record: &CandidateRecord) -> bool {
        let actual = || normalize(record.get(&self.field).unwrap_or(""));
        match self.comparator {
            Comparator::Always => true,
            Comparator::Equals => actual() == self.value,
            Comparator::Contains => actual().contains(&self.value),
        }
    }
}

/// Evaluate a predicate set combined by `logic`.
#[must_use]
pub fn matches_all(predicates: &[FieldPredicate], logic: CombineLogic, record: &CandidateRecord) -> bool {
    match logic {
        CombineLogic::And => predicates.iter().all(|p| p.matches(record)),
        CombineLogic::Or => predicates.iter().any(|p| p.matches(record)),
    }
}

/// Canonical comparison form: trimmed and case-folded.
#[must_use]
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Compiles predicates for the configured searchable-field set.
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    searchable: BTreeSet<String>,
}

impl FieldMatcher {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            searchable: fields.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_searchable(&self, field: &str) -> bool {
        self.searchable.contains(field)
    }

    /// Every configured field, in stable (sorted) order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.searchable.iter().map(String::as_str)
    }

    pub fn compile(
        &self,
        field: &str,
        value: &str,
        match_type: MatchType,
    ) -> Result<FieldPredicate, SearchError> {
        if !self.is_searchable(field) {
            return Err(SearchError::InvalidField(field.to_string()));
        }

        let value = normalize(value);
        let comparator = if value.is_empty() {
            Comparator::Always
        } else {
            match match_type {
                MatchType::Full => Comparator::Equals,
                MatchType::Partial => Comparator::Contains,
            }
        };

        Ok(FieldPredicate {
            field: field.to_string(),
            comparator,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> FieldMatcher {
        FieldMatcher::new(["mobile", "name", "email"])
    }

    #[test]
    fn test_full_compiles_to_equals() {
        let p = matcher().compile("mobile", "9876543210", MatchType::Full).unwrap();
        assert_eq!(p.comparator, Comparator::Equals);
        assert_eq!(p.value, "9876543210");
    }

    #[test]
    fn test_partial_compiles_to_contains_normalised() {
        let p = matcher().compile("name", "  SiNgH\t", MatchType::Partial).unwrap();
        assert_eq!(p.comparator, Comparator::Contains);
        assert_eq!(p.value, "singh");
    }

    #[test]
    fn test_empty_value_matches_everything() {
        for text in ["", "   ", "\n\t"] {
            let p = matcher().compile("name", text, MatchType::Partial).unwrap();
            assert!(p.is_always());
            assert!(p.matches(&CandidateRecord::new("x")));
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = matcher().compile("password", "x", MatchType::Full).unwrap_err();
        assert_eq!(err, SearchError::InvalidField("password".into()));
    }

    #[test]
    fn test_predicate_evaluation() {
        let rec = CandidateRecord::new("1").with("name", "Asha Singh").with("mobile", "9876543210");
        let m = matcher();

        assert!(m.compile("name", "singh", MatchType::Partial).unwrap().matches(&rec));
        assert!(!m.compile("name", "singh", MatchType::Full).unwrap().matches(&rec));
        assert!(m.compile("name", "ASHA SINGH", MatchType::Full).unwrap().matches(&rec));
        // Missing attribute never satisfies a non-empty predicate
        assert!(!m.compile("email", "a", MatchType::Partial).unwrap().matches(&rec));
    }

    #[test]
    fn test_special_characters_are_literal() {
        let rec = CandidateRecord::new("1").with("name", "100% pure_gold");
        let m = matcher();
        assert!(m.compile("name", "%", MatchType::Partial).unwrap().matches(&rec));
        assert!(m.compile("name", "_gold", MatchType::Partial).unwrap().matches(&rec));
        assert!(!m.compile("name", "' OR 1=1 --", MatchType::Partial).unwrap().matches(&rec));
    }

    #[test]
    fn test_matches_all_logic() {
        let rec = CandidateRecord::new("1").with("name", "Asha").with("mobile", "123");
        let m = matcher();
        let preds = vec![
            m.compile("name", "asha", MatchType::Full).unwrap(),
            m.compile("mobile", "999", MatchType::Full).unwrap(),
        ];
        assert!(matches_all(&preds, CombineLogic::Or, &rec));
        assert!(!matches_all(&preds, CombineLogic::And, &rec));
    }
}
