// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query planning and result merging.
//!
//! # Architecture
//!
//! ```text
//! SearchRequest
//!     ↓
//! QueryPlanner (FieldMatcher compiles each field)
//!     ↓
//! ExecutionPlan
//!     ├─→ RedisTranslator → index key / ZINTERSTORE | ZUNIONSTORE   (indexed store)
//!     └─→ SqlTranslator   → keyset-paged WHERE clause             (bulk store)
//!     ↓
//! MergeJoin (streams ascending by id) → paginate → page + total
//! ```
//!
//! # Matching
//!
//! ```text
//! full    + "  9876543210 " → mobile = "9876543210"
//! partial + "Singh"         → name contains "singh"
//! any     + "   "           → always true
//! ```

pub mod request;
pub mod matcher;
pub mod planner;
pub mod merge;
pub mod redis_translator;
pub mod sql_translator;

pub use request::{
    combined_fingerprint, CombineLogic, MatchType, SearchRequest, SearchRequestBuilder, SearchRequestWire, SearchWithinWire,
};
pub use matcher::{Comparator, FieldMatcher, FieldPredicate};
pub use planner::{ExecutionPlan, PlanStep, QueryPlanner};
pub use merge::{has_more, paginate, Intersection, MergeJoin, MergedSequence, PageWindow, SourceStream};
pub use redis_translator::{RedisKeyspace, RedisLookup, RedisTranslator, SetOp};
pub use sql_translator::{SqlParam, SqlQuery, SqlTranslator};
