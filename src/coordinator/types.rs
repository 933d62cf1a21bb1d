//! Public types for the search engine coordinator.

use serde::Serialize;

use crate::error::SearchError;
use crate::record::CandidateRecord;
use crate::storage::traits::BackendKind;

/// Outcome of the external auth collaborator's check on the caller's
/// bearer credential. The engine treats it as an opaque gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Authorized,
    Unauthorized,
}

impl Access {
    #[must_use]
    pub fn from_authorized(authorized: bool) -> Self {
        if authorized {
            Self::Authorized
        } else {
            Self::Unauthorized
        }
    }

    pub fn check(self) -> Result<(), SearchError> {
        match self {
            Self::Authorized => Ok(()),
            Self::Unauthorized => Err(SearchError::Unauthorized),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    /// Unique per request, assigned at dispatch
    pub search_id: String,
    /// Size of the deduplicated match set
    pub total_count: u64,
    pub execution_time_ms: u64,
    pub has_more: bool,
    pub results: Vec<CandidateRecord>,
    /// Answered without every planned backend
    #[serde(skip_serializing_if = "is_false")]
    pub partial: bool,
    /// Backends left out of a partial answer
    #[serde(skip)]
    pub degraded: Vec<BackendKind>,
}

impl SearchResponse {
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_gate() {
        assert!(Access::Authorized.check().is_ok());
        assert_eq!(Access::Unauthorized.check(), Err(SearchError::Unauthorized));
        assert_eq!(Access::from_authorized(false), Access::Unauthorized);
    }

    #[test]
    fn test_partial_only_serialized_when_set() {
        let mut response = SearchResponse {
            search_id: "s-1".into(),
            total_count: 1,
            execution_time_ms: 3,
            has_more: false,
            results: vec![CandidateRecord::new("p1").with("name", "Asha")],
            partial: false,
            degraded: vec![],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("partial").is_none());
        assert_eq!(json["results"][0]["name"], "Asha");

        response.partial = true;
        response.degraded = vec![BackendKind::Bulk];
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["partial"], true);
        assert!(json.get("degraded").is_none());
    }
}
