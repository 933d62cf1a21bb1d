//! SQL Translator
//!
//! Translates predicate sets into parameterized statements for the bulk store.
//! Every attribute is a plain column with a `<field>_norm` shadow column
//! holding [`normalize`](crate::search::matcher::normalize)d text, written at load time. Comparisons run on the
//! shadow column, so case folding and whitespace trimming are exactly the
//! in-memory rules rather than whatever the SQL dialect's `LOWER`/`TRIM` do.
//!
//! # SQL Syntax Generated
//!
//! ```sql
//! COALESCE(mobile_norm, '') = ?                  -- Equals
//! COALESCE(name_norm, '') LIKE ? ESCAPE '!'      -- Contains
//! 1=1                                            -- Always
//!
//! SELECT id, ... FROM people WHERE (<clause>) AND id > ? ORDER BY id LIMIT ?
//! SELECT COUNT(*) FROM people WHERE <clause>
//! ```
//!
//! `!` is used as the LIKE escape character because it is spelled the same
//! way in every dialect sqlx's `Any` driver speaks.

use crate::search::matcher::{Comparator, FieldPredicate};
use crate::search::request::CombineLogic;

/// SQL query translator for column predicates
pub struct SqlTranslator;

/// SQL query with parameterized placeholders
#[derive(Debug, Clone)]
pub struct SqlQuery {
    /// The statement or WHERE clause (without "WHERE" keyword)
    pub clause: String,
    /// The parameter values in order
    pub params: Vec<SqlParam>,
}

/// SQL parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

const LIKE_ESCAPE: char = '!';

const NORM_SUFFIX: &str = "_norm";

impl SqlTranslator {
    /// Translate predicates to a parameterized WHERE clause.
    ///
    /// Uses `?` placeholders. Column names must already be validated
    /// identifiers (see [`crate::SearchEngineConfig::validate`]).
    pub fn translate(predicates: &[FieldPredicate], logic: CombineLogic) -> SqlQuery {
        let mut params = Vec::new();

        // Always-true parts collapse: OR with one is everything, AND ignores them
        let any_always = predicates.iter().any(FieldPredicate::is_always);
        if predicates.is_empty() || (logic == CombineLogic::Or && any_always) {
            return SqlQuery { clause: "1=1".to_string(), params };
        }

        let parts: Vec<String> = predicates
            .iter()
            .filter(|p| !p.is_always())
            .map(|p| Self::translate_predicate(p, &mut params))
            .collect();

        let clause = match parts.len() {
            0 => "1=1".to_string(),
            1 => parts[0].clone(),
            _ => {
                let joiner = match logic {
                    CombineLogic::And => " AND ",
                    CombineLogic::Or => " OR ",
                };
                format!("({})", parts.join(joiner))
            }
        };
        SqlQuery { clause, params }
    }

    /// Translate to a WHERE clause with inline values.
    ///
    /// Warning: Only use for logging, never execute the result.
    pub fn translate_inline(predicates: &[FieldPredicate], logic: CombineLogic) -> String {
        let query = Self::translate(predicates, logic);
        let mut result = query.clause;
        for param in query.params {
            let value = match param {
                SqlParam::Text(s) => format!("'{}'", s.replace('\'', "''")),
                SqlParam::Integer(n) => n.to_string(),
            };
            result = result.replacen('?', &value, 1);
        }
        result
    }

    /// One keyset-paginated chunk: rows with `id > after`, ascending, at most `limit`.
    pub fn chunk_query(
        table: &str,
        columns: &[String],
        predicates: &[FieldPredicate],
        logic: CombineLogic,
        after: Option<&str>,
        limit: usize,
    ) -> SqlQuery {
        let SqlQuery { clause, mut params } = Self::translate(predicates, logic);

        let mut sql = format!("SELECT {} FROM {} WHERE ({})", Self::select_list(columns), table, clause);
        if let Some(after) = after {
            sql.push_str(" AND id > ?");
            params.push(SqlParam::Text(after.to_string()));
        }
        sql.push_str(" ORDER BY id LIMIT ?");
        params.push(SqlParam::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        SqlQuery { clause: sql, params }
    }

    /// Point read by identifier.
    pub fn get_query(table: &str, columns: &[String], id: &str) -> SqlQuery {
        SqlQuery {
            clause: format!("SELECT {} FROM {} WHERE id = ?", Self::select_list(columns), table),
            params: vec![SqlParam::Text(id.to_string())],
        }
    }

    fn select_list(columns: &[String]) -> String {
        if columns.is_empty() {
            "id".to_string()
        } else {
            format!("id, {}", columns.join(", "))
        }
    }

    pub fn count_query(table: &str, predicates: &[FieldPredicate], logic: CombineLogic) -> SqlQuery {
        let SqlQuery { clause, params } = Self::translate(predicates, logic);
        SqlQuery {
            clause: format!("SELECT COUNT(*) FROM {} WHERE {}", table, clause),
            params,
        }
    }

    /// Shadow column holding the normalised value of `field`.
    pub fn norm_column(field: &str) -> String {
        format!("{}{}", field, NORM_SUFFIX)
    }

    /// Escape LIKE wildcards so user text is matched literally.
    pub fn escape_like(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            if c == '%' || c == '_' || c == LIKE_ESCAPE {
                escaped.push(LIKE_ESCAPE);
            }
            escaped.push(c);
        }
        escaped
    }

    fn translate_predicate(predicate: &FieldPredicate, params: &mut Vec<SqlParam>) -> String {
        let column = format!("COALESCE({}, '')", Self::norm_column(&predicate.field));
        match predicate.comparator {
            Comparator::Equals => {
                params.push(SqlParam::Text(predicate.value.clone()));
                format!("{} = ?", column)
            }
            Comparator::Contains => {
                params.push(SqlParam::Text(format!("%{}%", Self::escape_like(&predicate.value))));
                format!("{} LIKE ? ESCAPE '{}'", column, LIKE_ESCAPE)
            }
            Comparator::Always => "1=1".to_string(),
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

    #[test]
    fn test_simple_equals() {
        let sql = SqlTranslator::translate(&[pred("mobile", Comparator::Equals, "98765")], CombineLogic::Or);
        assert_eq!(sql.clause, "COALESCE(mobile_norm, '') = ?");
        assert_eq!(sql.params, vec![SqlParam::Text("98765".into())]);
    }

    #[test]
    fn test_contains_escapes_wildcards() {
        let sql = SqlTranslator::translate(&[pred("name", Comparator::Contains, "100%_!")], CombineLogic::Or);
        assert_eq!(sql.clause, "COALESCE(name_norm, '') LIKE ? ESCAPE '!'");
        assert_eq!(sql.params, vec![SqlParam::Text("%100!%!_!!%".into())]);
    }

    #[test]
    fn test_and_or_joining() {
        let preds = [
            pred("name", Comparator::Contains, "singh"),
            pred("circle", Comparator::Equals, "delhi"),
        ];
        let and = SqlTranslator::translate(&preds, CombineLogic::And);
        assert!(and.clause.starts_with('('));
        assert!(and.clause.contains(" AND "));
        assert_eq!(and.params.len(), 2);

        let or = SqlTranslator::translate(&preds, CombineLogic::Or);
        assert!(or.clause.contains(" OR "));
    }

    #[test]
    fn test_always_collapses() {
        let preds = [
            pred("name", Comparator::Contains, "singh"),
            pred("email", Comparator::Always, ""),
        ];
        let or = SqlTranslator::translate(&preds, CombineLogic::Or);
        assert_eq!(or.clause, "1=1");
        assert!(or.params.is_empty());

        let and = SqlTranslator::translate(&preds, CombineLogic::And);
        assert_eq!(and.clause, "COALESCE(name_norm, '') LIKE ? ESCAPE '!'");
    }

    #[test]
    fn test_injection_text_is_a_parameter() {
        let text = "'; drop table people; --";
        let inline = SqlTranslator::translate_inline(&[pred("name", Comparator::Equals, text)], CombineLogic::Or);
        assert_eq!(inline, "COALESCE(name_norm, '') = '''; drop table people; --'");
        let sql = SqlTranslator::translate(&[pred("name", Comparator::Equals, text)], CombineLogic::Or);
        assert!(!sql.clause.contains("drop"));
    }

    #[test]
    fn test_chunk_query_keyset() {
        let columns = vec!["name".to_string(), "mobile".to_string()];
        let preds = [pred("name", Comparator::Contains, "a")];

        let first = SqlTranslator::chunk_query("people", &columns, &preds, CombineLogic::Or, None, 500);
        assert_eq!(
            first.clause,
            "SELECT id, name, mobile FROM people WHERE (COALESCE(name_norm, '') LIKE ? ESCAPE '!') ORDER BY id LIMIT ?"
        );
        assert_eq!(first.params.last(), Some(&SqlParam::Integer(500)));

        let next = SqlTranslator::chunk_query("people", &columns, &preds, CombineLogic::Or, Some("p42"), 500);
        assert!(next.clause.contains("AND id > ? ORDER BY id"));
        assert_eq!(next.params[1], SqlParam::Text("p42".into()));
    }

    #[test]
    fn test_get_query_binds_id() {
        let columns = vec!["name".to_string()];
        let sql = SqlTranslator::get_query("people", &columns, "p' OR 1=1");
        assert_eq!(sql.clause, "SELECT id, name FROM people WHERE id = ?");
        assert_eq!(sql.params, vec![SqlParam::Text("p' OR 1=1".into())]);
    }

    #[test]
    fn test_count_query() {
        let sql = SqlTranslator::count_query("people", &[], CombineLogic::And);
        assert_eq!(sql.clause, "SELECT COUNT(*) FROM people WHERE 1=1");
    }
}
