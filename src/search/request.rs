//! Search requests: wire decoding, validation and fingerprinting.
//!
//! # Example
//!
//! ```rust
//! use record_search::SearchEngineConfig;
//! use record_search::search::{SearchRequest, MatchType, CombineLogic};
//!
//! let config = SearchEngineConfig::default();
//! let request = SearchRequest::builder("Singh")
//!     .fields(["name"])
//!     .match_type(MatchType::Partial)
//!     .logic(CombineLogic::Or)
//!     .limit(100)
//!     .build(&config)
//!     .unwrap();
//! assert_eq!(request.limit(), 100);
//! assert_eq!(request.offset(), 0);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::SearchEngineConfig;
use crate::error::SearchError;

/// Whether a predicate compares for equality or substring containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Full,
    #[default]
    Partial,
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

/// How per-field predicates combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CombineLogic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[default]
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl std::fmt::Display for CombineLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

/// The request exactly as it arrives from the transport layer.
///
/// Limit and offset are signed so that negative values reach validation
/// and are rejected with the violated constraint named.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequestWire {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub field_queries: BTreeMap<String, String>,
    #[serde(default)]
    pub match_type: MatchType,
    #[serde(default)]
    pub logic: CombineLogic,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl SearchRequestWire {
    /// Decode a JSON body. Unknown match types or logic names are validation errors.
    pub fn from_json(body: &str) -> Result<Self, SearchError> {
        serde_json::from_str(body).map_err(|e| SearchError::Validation {
            constraint: "body",
            detail: e.to_string(),
        })
    }

    pub fn into_request(self, config: &SearchEngineConfig) -> Result<SearchRequest, SearchError> {
        let mut builder = SearchRequest::builder(self.query)
            .fields(self.fields)
            .match_type(self.match_type)
            .logic(self.logic);
        for (field, value) in self.field_queries {
            builder = builder.field_query(field, value);
        }
        if let Some(limit) = self.limit {
            builder = builder.limit(limit);
        }
        if let Some(offset) = self.offset {
            builder = builder.offset(offset);
        }
        builder.build(config)
    }
}

/// Narrow an earlier search: the refinement is ANDed with everything the
/// search `search_id` was answering, and paged by its own limit and offset.
///
/// ```json
/// {"search_id": "…", "query": "delhi", "fields": ["circle"], "limit": 50}
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchWithinWire {
    pub search_id: String,
    #[serde(flatten)]
    pub refinement: SearchRequestWire,
}

impl SearchWithinWire {
    pub fn from_json(body: &str) -> Result<Self, SearchError> {
        serde_json::from_str(body).map_err(|e| SearchError::Validation {
            constraint: "body",
            detail: e.to_string(),
        })
    }
}

/// Fingerprint of several requests answered together, order-sensitive.
#[must_use]
pub fn combined_fingerprint(requests: &[SearchRequest]) -> String {
    if let [only] = requests {
        return only.fingerprint();
    }
    let parts: Vec<String> = requests.iter().map(SearchRequest::fingerprint).collect();
    hex::encode(Sha256::digest(parts.join("&").as_bytes()))
}

/// A validated, immutable search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    query: String,
    fields: Vec<String>,
    field_queries: BTreeMap<String, String>,
    match_type: MatchType,
    logic: CombineLogic,
    limit: usize,
    offset: u64,
}

impl SearchRequest {
    pub fn builder(query: impl Into<String>) -> SearchRequestBuilder {
        SearchRequestBuilder {
            query: query.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Target fields; empty means every configured field.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Per-field values. When non-empty they take precedence over `query`/`fields`.
    #[must_use]
    pub fn field_queries(&self) -> &BTreeMap<String, String> {
        &self.field_queries
    }

    #[must_use]
    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    #[must_use]
    pub fn logic(&self) -> CombineLogic {
        self.logic
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Copy of this request pointing at a different page.
    #[must_use]
    pub fn with_page(&self, limit: usize, offset: u64) -> Self {
        Self {
            limit,
            offset,
            ..self.clone()
        }
    }

    /// Stable SHA-256 fingerprint of the query semantics, ignoring pagination.
    ///
    /// Field order and field-query order do not affect the result.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut fields = self.fields.clone();
        fields.sort();
        let pairs: Vec<String> = self
            .field_queries
            .iter()
            .map(|(k, v)| format!("{}={}", k.trim().to_lowercase(), v.trim()))
            .collect();

        let base = format!(
            "logic={};match={};q={};fields={};field_queries={}",
            self.logic,
            self.match_type,
            self.query.trim(),
            fields.join(","),
            pairs.join(","),
        );
        hex::encode(Sha256::digest(base.as_bytes()))
    }
}

#[derive(Debug, Default)]
pub struct SearchRequestBuilder {
    query: String,
    fields: Vec<String>,
    field_queries: BTreeMap<String, String>,
    match_type: MatchType,
    logic: CombineLogic,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl SearchRequestBuilder {
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn field_query(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.field_queries.insert(field.into(), value.into());
        self
    }

    pub fn match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn logic(mut self, logic: CombineLogic) -> Self {
        self.logic = logic;
        self
    }

    /// `0` selects the configured default limit.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Validate against the configured field set and limits.
    ///
    /// Query text itself is never rejected: empty, whitespace-only, very long
    /// or injection-shaped strings are all literal search text.
    pub fn build(self, config: &SearchEngineConfig) -> Result<SearchRequest, SearchError> {
        let limit = match self.limit {
            None | Some(0) => config.default_limit,
            Some(n) if n < 0 => {
                return Err(SearchError::Validation {
                    constraint: "limit",
                    detail: format!("limit must be positive, got {}", n),
                });
            }
            Some(n) if n as u64 > config.max_limit as u64 => {
                return Err(SearchError::Validation {
                    constraint: "limit",
                    detail: format!("limit {} exceeds maximum of {}", n, config.max_limit),
                });
            }
            Some(n) => n as usize,
        };

        let offset = match self.offset {
            None => 0,
            Some(n) if n < 0 => {
                return Err(SearchError::Validation {
                    constraint: "offset",
                    detail: format!("offset must be non-negative, got {}", n),
                });
            }
            Some(n) => n as u64,
        };

        let mut fields: Vec<String> = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            let field = field.trim().to_string();
            if !config.is_searchable(&field) {
                return Err(SearchError::Validation {
                    constraint: "fields",
                    detail: format!("unknown search field '{}'", field),
                });
            }
            if !fields.contains(&field) {
                fields.push(field);
            }
        }

        let mut field_queries = BTreeMap::new();
        for (field, value) in self.field_queries {
            let field = field.trim().to_string();
            if !config.is_searchable(&field) {
                return Err(SearchError::Validation {
                    constraint: "field_queries",
                    detail: format!("unknown search field '{}'", field),
                });
            }
            field_queries.insert(field, value);
        }

        Ok(SearchRequest {
            query: self.query,
            fields,
            field_queries,
            match_type: self.match_type,
            logic: self.logic,
            limit,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_within_body_flattens_refinement() {
        let wire = SearchWithinWire::from_json(
            r#"{"search_id": "abc", "query": "delhi", "fields": ["circle"], "match_type": "full", "limit": 5}"#,
        )
        .unwrap();
        assert_eq!(wire.search_id, "abc");
        let refinement = wire.refinement.into_request(&config()).unwrap();
        assert_eq!(refinement.query(), "delhi");
        assert_eq!(refinement.match_type(), MatchType::Full);
        assert_eq!(refinement.limit(), 5);

        let err = SearchWithinWire::from_json(r#"{"query": "delhi"}"#).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_combined_fingerprint() {
        let a = SearchRequest::builder("singh").build(&config()).unwrap();
        let b = SearchRequest::builder("delhi").build(&config()).unwrap();
        assert_eq!(combined_fingerprint(std::slice::from_ref(&a)), a.fingerprint());
        let ab = combined_fingerprint(&[a.clone(), b.clone()]);
        assert_eq!(ab.len(), 64);
        assert_ne!(ab, combined_fingerprint(&[b, a]));
    }

    fn config() -> SearchEngineConfig {
        SearchEngineConfig::default()
    }

    #[test]
    fn test_defaults() {
        let req = SearchRequest::builder("").build(&config()).unwrap();
        assert_eq!(req.limit(), 1000);
        assert_eq!(req.offset(), 0);
        assert_eq!(req.match_type(), MatchType::Partial);
        assert_eq!(req.logic(), CombineLogic::Or);
        assert!(req.fields().is_empty());
    }

    #[test]
    fn test_zero_limit_uses_default() {
        let req = SearchRequest::builder("x").limit(0).build(&config()).unwrap();
        assert_eq!(req.limit(), 1000);
    }

    #[test]
    fn test_limit_over_cap_rejected() {
        let err = SearchRequest::builder("x").limit(10_001).build(&config()).unwrap_err();
        assert!(matches!(err, SearchError::Validation { constraint: "limit", .. }));
    }

    #[test]
    fn test_negative_values_rejected() {
        let err = SearchRequest::builder("x").limit(-1).build(&config()).unwrap_err();
        assert!(matches!(err, SearchError::Validation { constraint: "limit", .. }));

        let err = SearchRequest::builder("x").offset(-5).build(&config()).unwrap_err();
        assert!(matches!(err, SearchError::Validation { constraint: "offset", .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SearchRequest::builder("x")
            .fields(["name", "password_hash"])
            .build(&config())
            .unwrap_err();
        match err {
            SearchError::Validation { constraint, detail } => {
                assert_eq!(constraint, "fields");
                assert!(detail.contains("password_hash"));
            }
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_fields_collapsed() {
        let req = SearchRequest::builder("x")
            .fields(["name", " name ", "email"])
            .build(&config())
            .unwrap();
        assert_eq!(req.fields(), &["name".to_string(), "email".to_string()]);
    }

    #[test]
    fn test_hostile_query_text_is_accepted() {
        let long = "a".repeat(100_000);
        for text in ["", "   ", "'; DROP TABLE people; --", "%_\\", long.as_str()] {
            assert!(SearchRequest::builder(text).build(&config()).is_ok());
        }
    }

    #[test]
    fn test_wire_decoding() {
        let wire = SearchRequestWire::from_json(
            r#"{"query":"Singh","fields":["name"],"match_type":"partial","logic":"AND","limit":100,"offset":200}"#,
        )
        .unwrap();
        let req = wire.into_request(&config()).unwrap();
        assert_eq!(req.query(), "Singh");
        assert_eq!(req.logic(), CombineLogic::And);
        assert_eq!(req.limit(), 100);
        assert_eq!(req.offset(), 200);
    }

    #[test]
    fn test_wire_rejects_unknown_match_type() {
        let err = SearchRequestWire::from_json(r#"{"query":"x","match_type":"fuzzy"}"#).unwrap_err();
        assert!(matches!(err, SearchError::Validation { constraint: "body", .. }));
    }

    #[test]
    fn test_wire_negative_offset_rejected() {
        let wire = SearchRequestWire::from_json(r#"{"query":"x","offset":-1}"#).unwrap();
        assert!(wire.into_request(&config()).is_err());
    }

    #[test]
    fn test_fingerprint_ignores_pagination_and_field_order() {
        let cfg = config();
        let a = SearchRequest::builder("Singh").fields(["name", "fname"]).limit(10).build(&cfg).unwrap();
        let b = SearchRequest::builder(" Singh ").fields(["fname", "name"]).offset(30).build(&cfg).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let c = SearchRequest::builder("Singh").fields(["name"]).build(&cfg).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_with_page() {
        let req = SearchRequest::builder("x").build(&config()).unwrap();
        let next = req.with_page(50, 100);
        assert_eq!(next.limit(), 50);
        assert_eq!(next.offset(), 100);
        assert_eq!(next.query(), "x");
    }
}
