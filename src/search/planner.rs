// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query Planner - decides which backends serve a request
//!
//! # Routing
//!
//! ```text
//! field indexed AND match_type = full  →  Indexed store (point lookup)
//! anything else                        →  Bulk store (streaming scan)
//! ```
//!
//! Predicates routed to the same backend form one [`PlanStep`] combined by
//! the request logic; steps are then combined across backends by the same
//! logic (intersection for AND, union for OR, by identifier). Because both
//! operations are associative this is equivalent to evaluating the flat
//! predicate list.
//!
//! A match-all predicate (empty query text) short-circuits: under OR it
//! makes the whole request match-all, under AND it is dropped. A match-all
//! request becomes one bulk-store step, so its total comes from a single
//! `count()` instead of merging two full scans.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SearchEngineConfig;
use crate::storage::traits::BackendKind;

use super::matcher::{FieldMatcher, FieldPredicate};
use super::request::{CombineLogic, MatchType, SearchRequest};

/// One backend call: a predicate set combined by `logic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub backend: BackendKind,
    pub predicates: Vec<FieldPredicate>,
    pub logic: CombineLogic,
}

/// Ordered backend calls plus the logic joining their candidate sets.
///
/// Steps are ordered indexed-first so the merger sees the authoritative
/// version of a record before the bulk store's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    pub logic: CombineLogic,
}

impl ExecutionPlan {
    /// Only the indexed store is consulted.
    #[must_use]
    pub fn is_fast_path(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.backend == BackendKind::Indexed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn backends(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.steps.iter().map(|s| s.backend)
    }

    #[must_use]
    pub fn step(&self, backend: BackendKind) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.backend == backend)
    }
}

pub struct QueryPlanner {
    matcher: FieldMatcher,
    indexed: BTreeSet<String>,
}

impl QueryPlanner {
    pub fn new(matcher: FieldMatcher, indexed_fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            matcher,
            indexed: indexed_fields.into_iter().collect(),
        }
    }

    pub fn from_config(config: &SearchEngineConfig) -> Self {
        Self::new(
            FieldMatcher::new(config.searchable_fields.iter().cloned()),
            config.indexed_fields.iter().cloned(),
        )
    }

    #[must_use]
    pub fn matcher(&self) -> &FieldMatcher {
        &self.matcher
    }

    /// Build the execution plan for a validated request.
    ///
    /// Never fails: an empty plan is only possible when no fields are
    /// configured, which [`SearchEngineConfig::validate`] rejects at startup.
    pub fn plan(&self, request: &SearchRequest) -> ExecutionPlan {
        let (targets, logic) = self.targets(request);

        let mut predicates = Vec::with_capacity(targets.len());
        for (field, value) in targets {
            match self.matcher.compile(&field, &value, request.match_type()) {
                Ok(p) => predicates.push(p),
                Err(e) => {
                    // Requests are validated against the same field set
                    warn!(field = %field, error = %e, "Skipping uncompilable field");
                }
            }
        }

        if let Some(all) = Self::match_all(&mut predicates, logic) {
            let plan = ExecutionPlan {
                steps: vec![PlanStep { backend: BackendKind::Bulk, predicates: vec![all], logic: CombineLogic::Or }],
                logic,
            };
            debug!(logic = %logic, "Planned match-all search");
            return plan;
        }

        let (indexed, bulk): (Vec<_>, Vec<_>) = predicates
            .into_iter()
            .partition(|p| request.match_type() == MatchType::Full && self.indexed.contains(&p.field));

        let mut steps = Vec::with_capacity(2);
        if !indexed.is_empty() {
            steps.push(PlanStep { backend: BackendKind::Indexed, predicates: indexed, logic });
        }
        if !bulk.is_empty() {
            steps.push(PlanStep { backend: BackendKind::Bulk, predicates: bulk, logic });
        }

        let plan = ExecutionPlan { steps, logic };
        debug!(
            logic = %logic,
            steps = plan.steps.len(),
            fast_path = plan.is_fast_path(),
            "Planned search"
        );
        plan
    }

    /// Fold match-all predicates away. Returns the predicate to run alone
    /// when the whole request matches every record.
    fn match_all(predicates: &mut Vec<FieldPredicate>, logic: CombineLogic) -> Option<FieldPredicate> {
        let always = predicates.iter().position(FieldPredicate::is_always)?;
        match logic {
            CombineLogic::Or => Some(predicates.swap_remove(always)),
            CombineLogic::And if predicates.iter().all(FieldPredicate::is_always) => Some(predicates.swap_remove(always)),
            CombineLogic::And => {
                predicates.retain(|p| !p.is_always());
                None
            }
        }
    }

    /// Resolve (field, value) pairs and the logic joining them.
    fn targets(&self, request: &SearchRequest) -> (Vec<(String, String)>, CombineLogic) {
        if !request.field_queries().is_empty() {
            let pairs: Vec<(String, String)> = request
                .field_queries()
                .iter()
                .filter(|(_, v)| !v.trim().is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !pairs.is_empty() {
                return (pairs, request.logic());
            }
            // Every per-field value was blank: search everything
            return (self.all_fields(""), CombineLogic::Or);
        }

        if request.fields().is_empty() {
            return (self.all_fields(request.query()), CombineLogic::Or);
        }

        let pairs = request
            .fields()
            .iter()
            .map(|f| (f.clone(), request.query().to_string()))
            .collect();
        (pairs, request.logic())
    }

    fn all_fields(&self, value: &str) -> Vec<(String, String)> {
        self.matcher.fields().map(|f| (f.to_string(), value.to_string())).collect()
    }
}
