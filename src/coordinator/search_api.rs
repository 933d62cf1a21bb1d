//! Search API for SearchEngine
//!
//! # Architecture
//!
//! ```text
//! search(access, request)
//!       │
//!       ├─→ Access gate (before anything else)
//!       │
//!       ├─→ QueryPlanner → ExecutionPlan
//!       │
//!       ├─→ Open every step concurrently (circuit breaker + deadline)
//!       │        │
//!       │        ├─→ single step: execute ∥ count
//!       │        └─→ several steps: execute only, count while merging
//!       │
//!       ├─→ Degrade policy: OR may drop an unreachable store (partial),
//!       │                   AND or a sole store fails the request
//!       │
//!       └─→ MergeJoin → paginate → telemetry
//! ```
//!
//! Dropping the returned future abandons every in-flight backend call;
//! streams and their pooled connections are released on drop.

use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant as Deadline};
use tracing::{debug, info, warn};

use crate::error::SearchError;
use crate::metrics::{self, LatencyTimer};
use crate::record::CandidateRecord;
use crate::resilience::circuit_breaker::CircuitError;
use crate::search::{
    combined_fingerprint, has_more, paginate, CombineLogic, ExecutionPlan, Intersection, MergeJoin, PlanStep,
    SearchRequest, SearchRequestWire, SearchWithinWire, SourceStream,
};
use crate::storage::traits::{BackendKind, RecordStream, StorageError};
use crate::telemetry::TelemetryRecorder;

use super::{Access, SearchEngine, SearchResponse};

/// What a plan produced before it is stamped into a response.
#[derive(Debug, Default)]
struct PlanOutcome {
    records: Vec<CandidateRecord>,
    total: u64,
    degraded: Vec<BackendKind>,
}

/// Every step of a plan opened and merged, not yet pulled.
struct OpenedPlan {
    merge: MergeJoin,
    /// Exact match-set size, when a lone step could count it.
    counted: Option<u64>,
    degraded: Vec<BackendKind>,
}

fn note_rejection(e: &SearchError) {
    if let SearchError::Validation { constraint, .. } = e {
        metrics::record_validation_rejected(constraint);
    }
}

fn push_unique(into: &mut Vec<BackendKind>, kinds: impl IntoIterator<Item = BackendKind>) {
    for kind in kinds {
        if !into.contains(&kind) {
            into.push(kind);
        }
    }
}

impl SearchEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // Search API
    // ═══════════════════════════════════════════════════════════════════════════

    /// Decode a JSON request body and run it.
    ///
    /// The access gate runs before decoding, so an unauthorized caller
    /// learns nothing about request validity.
    pub async fn search_json(&self, access: Access, body: &str) -> Result<SearchResponse, SearchError> {
        access.check()?;
        let request = SearchRequestWire::from_json(body)
            .and_then(|wire| wire.into_request(&self.config))
            .inspect_err(note_rejection)?;
        self.search(access, &request).await
    }

    /// Run a validated request and return one page.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use record_search::{Access, SearchEngine, SearchRequest, MatchType};
    /// # async fn example(engine: &SearchEngine) -> Result<(), Box<dyn std::error::Error>> {
    /// let request = SearchRequest::builder("Singh")
    ///     .fields(["name"])
    ///     .match_type(MatchType::Partial)
    ///     .limit(100)
    ///     .build(engine.config())?;
    ///
    /// let first = engine.search(Access::Authorized, &request).await?;
    /// if first.has_more {
    ///     let second = engine.search(Access::Authorized, &request.with_page(100, 100)).await?;
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn search(&self, access: Access, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        access.check()?;

        let search_id = TelemetryRecorder::new_search_id();
        let start = Instant::now();
        let plan = self.planner.plan(request);
        let fast_path = plan.is_fast_path();

        let outcome = match self.execute_plan(&plan, request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(search_id = %search_id, error = %e, retryable = e.is_retryable(), "Search failed");
                metrics::record_search("error", fast_path);
                return Err(e);
            }
        };

        Ok(self.respond(search_id, vec![request.clone()], request, outcome, start, fast_path))
    }

    /// Decode a search-within body and run it. See [`SearchEngine::search_within`].
    pub async fn search_within_json(&self, access: Access, body: &str) -> Result<SearchResponse, SearchError> {
        access.check()?;
        let wire = SearchWithinWire::from_json(body).inspect_err(note_rejection)?;
        let refinement = wire.refinement.into_request(&self.config).inspect_err(note_rejection)?;
        self.search_within(access, &wire.search_id, &refinement).await
    }

    /// Narrow an earlier search.
    ///
    /// Answers the records matching every request the search `search_id`
    /// answered AND `refinement`, paged by the refinement's limit and offset.
    /// The new response has its own search id, so narrowing can be chained.
    ///
    /// Only searches still in the recent-search log can be narrowed; an
    /// unknown or evicted id is a validation error.
    pub async fn search_within(
        &self,
        access: Access,
        search_id: &str,
        refinement: &SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        access.check()?;

        let Some(mut criteria) = self.telemetry.criteria(search_id) else {
            let err = SearchError::Validation {
                constraint: "search_id",
                detail: format!("no recent search with id '{}'", search_id),
            };
            note_rejection(&err);
            return Err(err);
        };
        criteria.push(refinement.clone());

        let new_id = TelemetryRecorder::new_search_id();
        let start = Instant::now();
        let outcome = match self.execute_within(&criteria, refinement).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(search_id = %new_id, within = %search_id, error = %e, "Search within failed");
                metrics::record_search("error", false);
                return Err(e);
            }
        };

        debug!(search_id = %new_id, within = %search_id, depth = criteria.len(), "Search narrowed");
        Ok(self.respond(new_id, criteria, refinement, outcome, start, false))
    }

    /// Stamp an outcome into a response and account for it.
    fn respond(
        &self,
        search_id: String,
        criteria: Vec<SearchRequest>,
        page: &SearchRequest,
        outcome: PlanOutcome,
        start: Instant,
        fast_path: bool,
    ) -> SearchResponse {
        let elapsed = start.elapsed();
        let execution_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let partial = !outcome.degraded.is_empty();
        let response = SearchResponse {
            has_more: has_more(page.offset(), outcome.records.len(), outcome.total),
            search_id,
            total_count: outcome.total,
            execution_time_ms,
            results: outcome.records,
            partial,
            degraded: outcome.degraded,
        };

        let mut entry = TelemetryRecorder::entry(
            response.search_id.clone(),
            combined_fingerprint(&criteria),
            response.total_count,
            response.results.len(),
            execution_time_ms,
            partial,
        );
        entry.criteria = criteria;
        self.telemetry.record(entry);
        metrics::record_search(if partial { "partial" } else { "ok" }, fast_path);
        metrics::record_search_latency(elapsed);
        metrics::record_search_results(response.results.len());

        info!(
            search_id = %response.search_id,
            total = response.total_count,
            returned = response.results.len(),
            elapsed_ms = execution_time_ms,
            partial,
            fast_path,
            "Search complete"
        );
        response
    }

    #[tracing::instrument(skip(self, plan, request), fields(steps = plan.steps.len(), logic = %plan.logic))]
    async fn execute_plan(&self, plan: &ExecutionPlan, request: &SearchRequest) -> Result<PlanOutcome, SearchError> {
        if plan.is_empty() {
            return Ok(PlanOutcome::default());
        }

        let deadline = Deadline::now() + self.config.backend_timeout();
        // A lone step's backend can count its own match set; otherwise the
        // deduplicated total only exists after merging.
        let single = plan.steps.len() == 1;
        let OpenedPlan {
            mut merge,
            counted,
            mut degraded,
        } = self.open_plan(plan, deadline, single).await?;

        // A known total past the offset needs no rows at all
        if let Some(total) = counted {
            if request.offset() >= total {
                debug!(total, offset = request.offset(), "Offset past the match set");
                return Ok(PlanOutcome {
                    records: Vec::new(),
                    total,
                    degraded,
                });
            }
        }

        let window = paginate(&mut merge, request.limit(), request.offset(), counted.is_none()).await?;
        push_unique(&mut degraded, merge.degraded().iter().copied());

        let total = counted.unwrap_or(window.seen);
        debug!(total, page = window.records.len(), "Plan executed");
        Ok(PlanOutcome {
            records: window.records,
            total,
            degraded,
        })
    }

    /// Intersect the plans of every request in `criteria` and page by `page`.
    #[tracing::instrument(skip_all, fields(depth = criteria.len()))]
    async fn execute_within(&self, criteria: &[SearchRequest], page: &SearchRequest) -> Result<PlanOutcome, SearchError> {
        let plans: Vec<ExecutionPlan> = criteria.iter().map(|r| self.planner.plan(r)).collect();
        // Anything ANDed with nothing is nothing
        if plans.iter().any(ExecutionPlan::is_empty) {
            return Ok(PlanOutcome::default());
        }

        let deadline = Deadline::now() + self.config.backend_timeout();
        let opened = join_all(plans.iter().map(|plan| self.open_plan(plan, deadline, false))).await;

        let mut merges = Vec::with_capacity(opened.len());
        let mut degraded = Vec::new();
        for result in opened {
            let opened = result?;
            push_unique(&mut degraded, opened.degraded);
            merges.push(opened.merge);
        }

        let mut within = Intersection::new(merges);
        let window = paginate(&mut within, page.limit(), page.offset(), true).await?;
        push_unique(&mut degraded, within.degraded());

        debug!(total = window.seen, page = window.records.len(), "Narrowed plan executed");
        Ok(PlanOutcome {
            records: window.records,
            total: window.seen,
            degraded,
        })
    }

    /// Open every step of `plan` concurrently and apply the degrade policy.
    async fn open_plan(
        &self,
        plan: &ExecutionPlan,
        deadline: Deadline,
        with_count: bool,
    ) -> Result<OpenedPlan, SearchError> {
        let opened = join_all(plan.steps.iter().map(|step| self.open_step(step, deadline, with_count))).await;

        let mut sources = Vec::with_capacity(opened.len());
        let mut counted = None;
        let mut failures = Vec::new();
        for result in opened {
            match result {
                Ok((source, total)) => {
                    counted = counted.or(total);
                    sources.push(source);
                }
                Err(e) => failures.push(e),
            }
        }

        let mut degraded = Vec::new();
        if !failures.is_empty() {
            let can_degrade =
                plan.logic == CombineLogic::Or && !sources.is_empty() && failures.iter().all(SearchError::is_outage);
            if !can_degrade {
                return Err(failures.swap_remove(0));
            }
            for err in failures {
                if let Some(backend) = err.backend() {
                    warn!(backend = %backend, error = %err, "Answering without unreachable store");
                    metrics::record_degraded(backend.as_str());
                    degraded.push(backend);
                }
            }
        }

        Ok(OpenedPlan {
            merge: MergeJoin::new(sources, plan.logic),
            counted,
            degraded,
        })
    }

    /// Open one step's stream through its circuit, bounded by `deadline`.
    async fn open_step(
        &self,
        step: &PlanStep,
        deadline: Deadline,
        with_count: bool,
    ) -> Result<(SourceStream, Option<u64>), SearchError> {
        let kind = step.backend;
        let backend = self.backend(kind);
        let budget = self.config.backend_timeout();
        let _timer = LatencyTimer::new(kind.as_str(), "execute");

        let result = self
            .circuits
            .for_backend(kind)
            .call(move || async move {
                let work = async {
                    if with_count {
                        let (stream, total) = tokio::try_join!(
                            backend.execute(&step.predicates, step.logic),
                            backend.count(&step.predicates, step.logic)
                        )?;
                        Ok::<_, StorageError>((stream, Some(total)))
                    } else {
                        let stream = backend.execute(&step.predicates, step.logic).await?;
                        Ok::<_, StorageError>((stream, None))
                    }
                };
                match timeout_at(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Timeout {
                        operation: "execute".into(),
                        deadline: budget,
                    }),
                }
            })
            .await;

        match result {
            Ok((stream, total)) => {
                metrics::record_backend_call(kind.as_str(), "execute", "ok");
                let stream = bounded(stream, deadline, budget);
                Ok((SourceStream::new(kind, stream), total))
            }
            Err(CircuitError::Rejected) => {
                metrics::record_backend_call(kind.as_str(), "execute", "rejected");
                Err(SearchError::BackendUnavailable {
                    backend: kind,
                    reason: "circuit breaker open".into(),
                })
            }
            Err(CircuitError::Inner(e)) => {
                if matches!(e, StorageError::Timeout { .. }) {
                    metrics::record_timeout(kind.as_str(), "execute");
                }
                metrics::record_backend_call(kind.as_str(), "execute", "error");
                Err(SearchError::from_storage(kind, e))
            }
        }
    }
}

/// Cut a stream off at `deadline`: the pending pull yields a timeout error
/// and the underlying stream (with whatever connection it holds) is dropped.
fn bounded(stream: RecordStream, deadline: Deadline, budget: Duration) -> RecordStream {
    stream::unfold(Some(stream), move |state| async move {
        let mut inner = state?;
        match timeout_at(deadline, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => {
                let err = StorageError::Timeout {
                    operation: "stream".into(),
                    deadline: budget,
                };
                Some((Err(err), None))
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_items_before_deadline() {
        let items: Vec<Result<CandidateRecord, StorageError>> =
            vec![Ok(CandidateRecord::new("a")), Ok(CandidateRecord::new("b"))];
        let deadline = Deadline::now() + Duration::from_secs(5);
        let out: Vec<_> = bounded(stream::iter(items).boxed(), deadline, Duration::from_secs(5))
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_bounded_times_out_once_then_ends() {
        let slow = stream::once(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(CandidateRecord::new("late"))
        })
        .boxed();
        let deadline = Deadline::now() + Duration::from_millis(20);
        let out: Vec<_> = bounded(slow, deadline, Duration::from_millis(20)).collect().await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(StorageError::Timeout { .. })));
    }
}
