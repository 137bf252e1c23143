//! The query AST and its translation to tantivy queries.
//!
//! Analysis is delegated entirely to tantivy's tokenizer registry: `Match`
//! and `Phrase` go through the query parser scoped to a single field, `Term`
//! matches the raw indexed value.

use crate::error::{Error, Result};
use crate::mapping::{FieldRegistry, FieldType};
use serde::{Deserialize, Serialize};
use tantivy::query::{AllQuery, BooleanQuery, ConstScoreQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{Index, Term};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchQuery {
    MatchAll,
    /// Exact match on the indexed value (untokenized fields, numerics, bools).
    Term { field: String, value: String },
    /// Analyzed full-text match on one field.
    Match { field: String, query: String },
    /// Analyzed phrase match on one field.
    Phrase { field: String, phrase: String },
    Bool {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must: Vec<SearchQuery>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        should: Vec<SearchQuery>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must_not: Vec<SearchQuery>,
        /// Like `must`, but does not contribute to scoring.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filter: Vec<SearchQuery>,
    },
}

impl SearchQuery {
    pub fn match_all() -> SearchQuery {
        SearchQuery::MatchAll
    }

    pub fn term(field: impl Into<String>, value: impl Into<String>) -> SearchQuery {
        SearchQuery::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn match_(field: impl Into<String>, query: impl Into<String>) -> SearchQuery {
        SearchQuery::Match {
            field: field.into(),
            query: query.into(),
        }
    }

    /// Translate into a tantivy query against the given index/mapping.
    pub fn to_tantivy(&self, registry: &FieldRegistry, index: &Index) -> Result<Box<dyn Query>> {
        match self {
            SearchQuery::MatchAll => Ok(Box::new(AllQuery)),
            SearchQuery::Term { field, value } => {
                let term = self.build_term(registry, field, value)?;
                Ok(Box::new(TermQuery::new(term, IndexRecordOption::Basic)))
            }
            SearchQuery::Match { field, query } => {
                parse_on_field(registry, index, field, query)
            }
            SearchQuery::Phrase { field, phrase } => {
                // The parser treats quoted input as a positional phrase.
                let quoted = format!("\"{}\"", phrase.replace('"', " "));
                parse_on_field(registry, index, field, &quoted)
            }
            SearchQuery::Bool {
                must,
                should,
                must_not,
                filter,
            } => {
                if must.is_empty() && should.is_empty() && must_not.is_empty() && filter.is_empty()
                {
                    return Err(Error::InvalidQuery("empty bool query".to_string()));
                }
                let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
                for q in must {
                    clauses.push((Occur::Must, q.to_tantivy(registry, index)?));
                }
                for q in should {
                    clauses.push((Occur::Should, q.to_tantivy(registry, index)?));
                }
                for q in must_not {
                    clauses.push((Occur::MustNot, q.to_tantivy(registry, index)?));
                }
                for q in filter {
                    let inner = q.to_tantivy(registry, index)?;
                    clauses.push((Occur::Must, Box::new(ConstScoreQuery::new(inner, 0.0))));
                }
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
        }
    }

    fn build_term(&self, registry: &FieldRegistry, field: &str, value: &str) -> Result<Term> {
        let handle = registry
            .field(field)
            .ok_or_else(|| Error::InvalidQuery(format!("unknown field [{}]", field)))?;
        // System fields (_id, _seq_no) resolve through the registry too.
        let field_type = registry.field_type(field).unwrap_or(FieldType::Keyword);
        let term = match field_type {
            FieldType::Text | FieldType::Keyword => Term::from_field_text(handle, value),
            FieldType::Long | FieldType::Date => {
                let parsed: i64 = value.parse().map_err(|_| {
                    Error::InvalidQuery(format!(
                        "field [{}] expects an integer term, got [{}]",
                        field, value
                    ))
                })?;
                Term::from_field_i64(handle, parsed)
            }
            FieldType::Double => {
                let parsed: f64 = value.parse().map_err(|_| {
                    Error::InvalidQuery(format!(
                        "field [{}] expects a float term, got [{}]",
                        field, value
                    ))
                })?;
                Term::from_field_f64(handle, parsed)
            }
            FieldType::Bool => {
                let parsed: bool = value.parse().map_err(|_| {
                    Error::InvalidQuery(format!(
                        "field [{}] expects true/false, got [{}]",
                        field, value
                    ))
                })?;
                Term::from_field_bool(handle, parsed)
            }
        };
        Ok(term)
    }
}

fn parse_on_field(
    registry: &FieldRegistry,
    index: &Index,
    field: &str,
    input: &str,
) -> Result<Box<dyn Query>> {
    let handle = registry
        .field(field)
        .ok_or_else(|| Error::InvalidQuery(format!("unknown field [{}]", field)))?;
    match registry.field_type(field) {
        Some(FieldType::Text) | Some(FieldType::Keyword) => {}
        other => {
            return Err(Error::InvalidQuery(format!(
                "match query requires a text field, [{}] is {:?}",
                field, other
            )))
        }
    }
    let parser = QueryParser::for_index(index, vec![handle]);
    parser
        .parse_query(input)
        .map_err(|e| Error::InvalidQuery(format!("cannot parse [{}]: {}", input, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{FieldMapping, IndexMapping};

    fn setup() -> (FieldRegistry, Index) {
        let registry = FieldRegistry::compile(
            &IndexMapping::builder()
                .field("body", FieldMapping::text())
                .field("tag", FieldMapping::keyword())
                .field("price", FieldMapping::of(FieldType::Long))
                .build(),
        )
        .unwrap();
        let index = Index::create_in_ram(registry.schema.clone());
        (registry, index)
    }

    #[test]
    fn test_term_on_unknown_field_rejected() {
        let (registry, index) = setup();
        let err = SearchQuery::term("ghost", "x")
            .to_tantivy(&registry, &index)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn test_term_type_coercion() {
        let (registry, index) = setup();
        assert!(SearchQuery::term("price", "42")
            .to_tantivy(&registry, &index)
            .is_ok());
        assert!(SearchQuery::term("price", "forty-two")
            .to_tantivy(&registry, &index)
            .is_err());
        assert!(SearchQuery::term("tag", "error")
            .to_tantivy(&registry, &index)
            .is_ok());
    }

    #[test]
    fn test_match_requires_text_field() {
        let (registry, index) = setup();
        assert!(SearchQuery::match_("body", "quick fox")
            .to_tantivy(&registry, &index)
            .is_ok());
        assert!(SearchQuery::match_("price", "5")
            .to_tantivy(&registry, &index)
            .is_err());
    }

    #[test]
    fn test_empty_bool_rejected() {
        let (registry, index) = setup();
        let query = SearchQuery::Bool {
            must: vec![],
            should: vec![],
            must_not: vec![],
            filter: vec![],
        };
        assert!(query.to_tantivy(&registry, &index).is_err());
    }

    #[test]
    fn test_bool_composition() {
        let (registry, index) = setup();
        let query = SearchQuery::Bool {
            must: vec![SearchQuery::match_("body", "fox")],
            should: vec![],
            must_not: vec![SearchQuery::term("tag", "archived")],
            filter: vec![SearchQuery::term("price", "10")],
        };
        assert!(query.to_tantivy(&registry, &index).is_ok());
    }

    #[test]
    fn test_query_serde_roundtrip() {
        let query = SearchQuery::Bool {
            must: vec![SearchQuery::match_("body", "hello world")],
            should: vec![SearchQuery::term("tag", "a")],
            must_not: vec![],
            filter: vec![],
        };
        let json = serde_json::to_string(&query).unwrap();
        let back: SearchQuery = serde_json::from_str(&json).unwrap();
        assert_eq!(back, query);
    }
}
