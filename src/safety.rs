//! Query depth and complexity limits
//!
//! Measured on the parsed document before execution, so a rejected query
//! never reaches a resolver or the store. Fragments are expanded inline and
//! introspection fields (`__schema`, `__type`, `__typename`) are free.
//!
//! Every field costs 1. A list-valued field multiplies the cost of its
//! children by its literal `first`/`limit`/`last` argument (a variable counts
//! when it is bound to an integer) or by the schema's fan-out factor.

use std::collections::{BTreeSet, HashMap};

use async_graphql::Variables;
use async_graphql::parser::types::{ExecutableDocument, Field, FragmentDefinition, Selection, SelectionSet};
use async_graphql::parser::{Positioned, parse_query};
use async_graphql::{Name, Value};
use serde::Serialize;

use crate::error::SafetyError;
use crate::schema::SchemaSettings;

const PAGE_ARGUMENTS: [&str; 3] = ["first", "limit", "last"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryMetrics {
    pub depth: usize,
    pub complexity: usize,
}

impl QueryMetrics {
    /// Depth is checked before complexity.
    pub fn check(&self, settings: &SchemaSettings) -> Result<(), SafetyError> {
        if self.depth > settings.max_query_depth {
            return Err(SafetyError::TooDeep {
                measured: self.depth,
                limit: settings.max_query_depth,
            });
        }
        if self.complexity > settings.max_query_complexity {
            return Err(SafetyError::TooComplex {
                measured: self.complexity,
                limit: settings.max_query_complexity,
            });
        }
        Ok(())
    }
}

pub struct QueryAnalyzer<'a> {
    list_fields: &'a BTreeSet<String>,
    fanout: usize,
}

struct Walk<'d> {
    fragments: &'d HashMap<Name, Positioned<FragmentDefinition>>,
    variables: &'d Variables,
    /// Fragments on the current path; a spread of one of them is skipped
    expanding: Vec<&'d str>,
}

impl<'a> QueryAnalyzer<'a> {
    pub fn new(list_fields: &'a BTreeSet<String>, fanout: usize) -> Self {
        Self {
            list_fields,
            fanout: fanout.max(1),
        }
    }

    /// Parse `query` and measure `operation` (or the most expensive one when
    /// no name is given).
    pub fn analyze(
        &self,
        query: &str,
        operation: Option<&str>,
        variables: &Variables,
    ) -> Result<QueryMetrics, SafetyError> {
        let document = parse_query(query).map_err(|err| SafetyError::Parse(err.to_string()))?;
        Ok(self.measure(&document, operation, variables))
    }

    pub fn measure(&self, document: &ExecutableDocument, operation: Option<&str>, variables: &Variables) -> QueryMetrics {
        let mut walk = Walk {
            fragments: &document.fragments,
            variables,
            expanding: Vec::new(),
        };
        let mut metrics = QueryMetrics::default();
        for (name, definition) in document.operations.iter() {
            if operation.is_some() && operation != name.map(|n| n.as_str()) {
                continue;
            }
            let selection = &definition.node.selection_set;
            let depth = self.depth(&mut walk, selection, 1);
            let complexity = self.complexity(&mut walk, selection);
            metrics.depth = metrics.depth.max(depth);
            metrics.complexity = metrics.complexity.max(complexity);
        }
        metrics
    }

    /// Deepest field level reached under `set`, where `level` is the level
    /// of the fields directly in it.
    fn depth<'d>(&self, walk: &mut Walk<'d>, set: &'d Positioned<SelectionSet>, level: usize) -> usize {
        let mut deepest = 0;
        for item in &set.node.items {
            let reached = match &item.node {
                Selection::Field(field) => {
                    if is_introspection(field.node.name.node.as_str()) {
                        continue;
                    }
                    if field.node.selection_set.node.items.is_empty() {
                        level
                    } else {
                        self.depth(walk, &field.node.selection_set, level + 1).max(level)
                    }
                }
                Selection::InlineFragment(fragment) => self.depth(walk, &fragment.node.selection_set, level),
                Selection::FragmentSpread(spread) => match walk.enter(spread.node.fragment_name.node.as_str()) {
                    Some(fragment) => {
                        let reached = self.depth(walk, &fragment.node.selection_set, level);
                        walk.expanding.pop();
                        reached
                    }
                    None => 0,
                },
            };
            deepest = deepest.max(reached);
        }
        deepest
    }

    fn complexity<'d>(&self, walk: &mut Walk<'d>, set: &'d Positioned<SelectionSet>) -> usize {
        let mut total = 0usize;
        for item in &set.node.items {
            let cost = match &item.node {
                Selection::Field(field) => {
                    let name = field.node.name.node.as_str();
                    if is_introspection(name) {
                        continue;
                    }
                    let children = self.complexity(walk, &field.node.selection_set);
                    let multiplier = if self.list_fields.contains(name) {
                        walk.page_size(field).unwrap_or(self.fanout)
                    } else {
                        1
                    };
                    1usize.saturating_add(children.saturating_mul(multiplier))
                }
                Selection::InlineFragment(fragment) => self.complexity(walk, &fragment.node.selection_set),
                Selection::FragmentSpread(spread) => match walk.enter(spread.node.fragment_name.node.as_str()) {
                    Some(fragment) => {
                        let cost = self.complexity(walk, &fragment.node.selection_set);
                        walk.expanding.pop();
                        cost
                    }
                    None => 0,
                },
            };
            total = total.saturating_add(cost);
        }
        total
    }
}

impl<'d> Walk<'d> {
    /// Start expanding `name`; `None` for unknown or recursive spreads.
    fn enter(&mut self, name: &'d str) -> Option<&'d Positioned<FragmentDefinition>> {
        if self.expanding.contains(&name) {
            return None;
        }
        let fragment = self.fragments.get(name)?;
        self.expanding.push(name);
        Some(fragment)
    }

    /// Largest integer `first`/`limit`/`last` argument of `field`.
    fn page_size(&self, field: &Positioned<Field>) -> Option<usize> {
        field
            .node
            .arguments
            .iter()
            .filter(|(name, _)| PAGE_ARGUMENTS.contains(&name.node.as_str()))
            .filter_map(|(_, value)| {
                let value = value
                    .node
                    .clone()
                    .into_const_with(|var| self.variables.get(&var).cloned().ok_or(()))
                    .ok()?;
                match value {
                    Value::Number(n) => n.as_u64().map(|n| n as usize),
                    _ => None,
                }
            })
            .max()
    }
}

fn is_introspection(name: &str) -> bool {
    name.starts_with("__")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn list_fields() -> BTreeSet<String> {
        ["products", "productPages", "tags", "productSet"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn measure(query: &str) -> QueryMetrics {
        let fields = list_fields();
        QueryAnalyzer::new(&fields, 10)
            .analyze(query, None, &Variables::default())
            .unwrap()
    }

    #[test]
    fn test_flat_query() {
        assert_eq!(
            measure("{ product(id: 1) { id name } }"),
            QueryMetrics { depth: 2, complexity: 3 }
        );
    }

    #[test]
    fn test_list_multiplier_uses_literal_page_size() {
        // products: 1 + 10 * (id + tags: 1 + 5 * name)
        let metrics = measure("{ products(limit: 10) { id tags(first: 5) { name } } }");
        assert_eq!(metrics.depth, 3);
        assert_eq!(metrics.complexity, 1 + 10 * (1 + (1 + 5)));

        // no literal: fan-out of 10
        assert_eq!(measure("{ products { id } }").complexity, 11);
    }

    #[test]
    fn test_variables_count_as_page_size() {
        let fields = list_fields();
        let variables = Variables::from_json(serde_json::json!({"n": 3}));
        let metrics = QueryAnalyzer::new(&fields, 10)
            .analyze("query($n: Int) { products(limit: $n) { id } }", None, &variables)
            .unwrap();
        assert_eq!(metrics.complexity, 4);
    }

    #[test]
    fn test_fragments_are_expanded() {
        let inline = measure("{ product(id: 1) { category { name } } }");
        let spread = measure("{ product(id: 1) { ...F } } fragment F on Product { category { name } }");
        assert_eq!(inline, spread);
        let nested = measure("{ product(id: 1) { ... on Product { category { name } } } }");
        assert_eq!(inline, nested);
    }

    #[test]
    fn test_introspection_is_free() {
        let metrics = measure("{ __typename product(id: 1) { __typename id } __schema { types { name } } }");
        assert_eq!(metrics, QueryMetrics { depth: 2, complexity: 2 });
    }

    #[test]
    fn test_recursive_fragment_terminates() {
        let metrics = measure("{ product(id: 1) { ...A } } fragment A on Product { id ...A }");
        assert_eq!(metrics.depth, 2);
    }

    #[test]
    fn test_named_operation_selection() {
        let fields = list_fields();
        let query = "query Small { product(id: 1) { id } } query Big { products { id name } }";
        let analyzer = QueryAnalyzer::new(&fields, 10);
        let small = analyzer.analyze(query, Some("Small"), &Variables::default()).unwrap();
        let any = analyzer.analyze(query, None, &Variables::default()).unwrap();
        assert_eq!(small.complexity, 2);
        assert_eq!(any.complexity, 21);
    }

    #[test]
    fn test_check_limits() {
        let settings = SchemaSettings {
            max_query_depth: 3,
            max_query_complexity: 50,
            ..SchemaSettings::default()
        };
        assert!(QueryMetrics { depth: 3, complexity: 50 }.check(&settings).is_ok());
        assert_matches!(
            QueryMetrics { depth: 4, complexity: 1 }.check(&settings),
            Err(SafetyError::TooDeep { measured: 4, limit: 3 })
        );
        assert_matches!(
            QueryMetrics { depth: 1, complexity: 51 }.check(&settings),
            Err(SafetyError::TooComplex { measured: 51, limit: 50 })
        );
        let fields = list_fields();
        assert_matches!(
            QueryAnalyzer::new(&fields, 10).analyze("{ product(", None, &Variables::default()),
            Err(SafetyError::Parse(_))
        );
    }
}
