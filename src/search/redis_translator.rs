//! Redis Translator
//!
//! Translates predicate sets into sorted-set lookups for the indexed store.
//!
//! # Key Layout
//!
//! ```text
//! {prefix}rec:{id}               - HASH of record attributes
//! {prefix}idx:{field}:{value}    - ZSET of ids whose normalised field equals value
//! {prefix}ids                    - ZSET of every id
//! {prefix}tmp:{uuid}             - scratch ZSET for combined lookups (expires)
//! ```
//!
//! All sorted-set members carry score 0, so members come back in binary
//! (lexicographic) order and `ZRANGEBYLEX key (last +` pages by identifier.
//! Combining sets uses `AGGREGATE MIN` which keeps every score at 0.
//!
//! Only `Equals` and `Always` predicates have an index; `Contains` is
//! rejected with [`StorageError::Unsupported`].

use crate::search::matcher::{Comparator, FieldPredicate};
use crate::search::request::CombineLogic;
use crate::storage::traits::StorageError;

/// Builds every key the indexed store touches.
#[derive(Debug, Clone, Default)]
pub struct RedisKeyspace {
    prefix: String,
}

impl RedisKeyspace {
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix.unwrap_or("").to_string(),
        }
    }

    #[must_use]
    pub fn record_key(&self, id: &str) -> String {
        format!("{}rec:{}", self.prefix, id)
    }

    /// `value` must already be normalised.
    #[must_use]
    pub fn index_key(&self, field: &str, value: &str) -> String {
        format!("{}idx:{}:{}", self.prefix, field, value)
    }

    #[must_use]
    pub fn all_ids_key(&self) -> String {
        format!("{}ids", self.prefix)
    }

    #[must_use]
    pub fn scratch_key(&self) -> String {
        format!("{}tmp:{}", self.prefix, uuid::Uuid::new_v4())
    }
}

/// How sorted sets are combined server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// ZINTERSTORE
    Inter,
    /// ZUNIONSTORE
    Union,
}

impl SetOp {
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Self::Inter => "ZINTERSTORE",
            Self::Union => "ZUNIONSTORE",
        }
    }
}

/// A resolved indexed-store lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisLookup {
    /// Read one sorted set directly
    Single(String),
    /// Combine several sets into a scratch key, then read that
    Combine { op: SetOp, sources: Vec<String> },
}

/// Redis lookup translator
pub struct RedisTranslator;

impl RedisTranslator {
    pub fn translate(
        keyspace: &RedisKeyspace,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
    ) -> Result<RedisLookup, StorageError> {
        if let Some(p) = predicates.iter().find(|p| p.comparator == Comparator::Contains) {
            return Err(StorageError::Unsupported(format!(
                "substring match on '{}' has no index",
                p.field
            )));
        }

        let any_always = predicates.iter().any(FieldPredicate::is_always);
        if predicates.is_empty() || (logic == CombineLogic::Or && any_always) {
            return Ok(RedisLookup::Single(keyspace.all_ids_key()));
        }

        let mut sources: Vec<String> = Vec::with_capacity(predicates.len());
        for p in predicates.iter().filter(|p| !p.is_always()) {
            let key = keyspace.index_key(&p.field, &p.value);
            if !sources.contains(&key) {
                sources.push(key);
            }
        }

        match sources.len() {
            // AND of Always-only predicates
            0 => Ok(RedisLookup::Single(keyspace.all_ids_key())),
            1 => Ok(RedisLookup::Single(sources.remove(0))),
            _ => Ok(RedisLookup::Combine {
                op: match logic {
                    CombineLogic::And => SetOp::Inter,
                    CombineLogic::Or => SetOp::Union,
                },
                sources,
            }),
        }
    }

    /// Lower bound for `ZRANGEBYLEX` resuming after `last`.
    #[must_use]
    pub fn lex_lower_bound(last: Option<&str>) -> String {
        match last {
            Some(id) => format!("({}", id),
            None => "-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(field: &str, comparator: Comparator, value: &str) -> FieldPredicate {
        FieldPredicate {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }

    fn ks() -> RedisKeyspace {
        RedisKeyspace::new(Some("people:"))
    }

    #[test]
    fn test_key_layout() {
        let ks = ks();
        assert_eq!(ks.record_key("42"), "people:rec:42");
        assert_eq!(ks.index_key("mobile", "98765"), "people:idx:mobile:98765");
        assert_eq!(ks.all_ids_key(), "people:ids");
        assert!(ks.scratch_key().starts_with("people:tmp:"));
        assert_eq!(RedisKeyspace::new(None).all_ids_key(), "ids");
    }

    #[test]
    fn test_single_equals() {
        let lookup =
            RedisTranslator::translate(&ks(), &[pred("mobile", Comparator::Equals, "98765")], CombineLogic::Or).unwrap();
        assert_eq!(lookup, RedisLookup::Single("people:idx:mobile:98765".into()));
    }

    #[test]
    fn test_and_intersects_or_unions() {
        let preds = [
            pred("mobile", Comparator::Equals, "1"),
            pred("email", Comparator::Equals, "a@b.c"),
        ];
        match RedisTranslator::translate(&ks(), &preds, CombineLogic::And).unwrap() {
            RedisLookup::Combine { op, sources } => {
                assert_eq!(op, SetOp::Inter);
                assert_eq!(sources.len(), 2);
            }
            other => panic!("Expected combine, got {:?}", other),
        }
        match RedisTranslator::translate(&ks(), &preds, CombineLogic::Or).unwrap() {
            RedisLookup::Combine { op, .. } => assert_eq!(op.command(), "ZUNIONSTORE"),
            other => panic!("Expected combine, got {:?}", other),
        }
    }

    #[test]
    fn test_always_uses_all_ids() {
        let preds = [
            pred("mobile", Comparator::Equals, "1"),
            pred("email", Comparator::Always, ""),
        ];
        assert_eq!(
            RedisTranslator::translate(&ks(), &preds, CombineLogic::Or).unwrap(),
            RedisLookup::Single("people:ids".into())
        );
        assert_eq!(
            RedisTranslator::translate(&ks(), &preds, CombineLogic::And).unwrap(),
            RedisLookup::Single("people:idx:mobile:1".into())
        );
    }

    #[test]
    fn test_contains_unsupported() {
        let err = RedisTranslator::translate(&ks(), &[pred("mobile", Comparator::Contains, "98")], CombineLogic::Or)
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }

    #[test]
    fn test_lex_bounds() {
        assert_eq!(RedisTranslator::lex_lower_bound(None), "-");
        assert_eq!(RedisTranslator::lex_lower_bound(Some("p9")), "(p9");
    }
}
