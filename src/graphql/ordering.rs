//! `orderBy` token parsing.
//!
//! Tokens are member names (GraphQL or declared spelling), optionally
//! prefixed with `-` for descending order. Base fields and forward to-one
//! relationships (ordered by their key column) are orderable. The primary key
//! is always appended as a tiebreaker so windows over equal values are stable.

use async_graphql::Value;
use tracing::warn;

use super::ModelEntry;
use super::naming::field_name;
use crate::error::FilterError;
use crate::introspect::{Member, ModelDescriptor, RelationKind};
use crate::store::OrderTerm;

fn column_for<'a>(descriptor: &'a ModelDescriptor, name: &str) -> Option<&'a str> {
    descriptor.members.iter().find_map(|member| match member {
        Member::Field(f) if f.name == name || field_name(&f.name) == name => Some(f.column.as_str()),
        Member::Relationship(r)
            if r.kind == RelationKind::ToOne && (r.name == name || field_name(&r.name) == name) =>
        {
            r.column.as_deref()
        }
        _ => None,
    })
}

/// Parse one token.
pub fn parse_token(descriptor: &ModelDescriptor, token: &str) -> Result<OrderTerm, FilterError> {
    let token = token.trim();
    let (name, descending) = match token.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (token.strip_prefix('+').unwrap_or(token), false),
    };
    let column = column_for(descriptor, name).ok_or_else(|| FilterError::UnknownOrderField(token.to_string()))?;
    Ok(OrderTerm {
        column: column.to_string(),
        descending,
    })
}

/// Compile tokens, falling back to the model's default ordering when empty.
pub fn compile(entry: &ModelEntry, tokens: &[String]) -> Result<Vec<OrderTerm>, FilterError> {
    let descriptor = &entry.descriptor;
    let mut terms = if tokens.is_empty() {
        default_order(descriptor)
    } else {
        tokens
            .iter()
            .map(|t| parse_token(descriptor, t))
            .collect::<Result<Vec<_>, _>>()?
    };
    if let Some(pk) = descriptor.primary_field()
        && !terms.iter().any(|t| t.column == pk.column)
    {
        terms.push(OrderTerm::asc(pk.column.clone()));
    }
    Ok(terms)
}

/// The model's declared ordering; tokens that no longer resolve are dropped.
pub fn default_order(descriptor: &ModelDescriptor) -> Vec<OrderTerm> {
    descriptor
        .ordering
        .iter()
        .filter_map(|token| match parse_token(descriptor, token) {
            Ok(term) => Some(term),
            Err(err) => {
                warn!(model = %descriptor.key, %token, error = %err, "Ignoring default ordering");
                None
            }
        })
        .collect()
}

/// Tokens from an `orderBy` argument value (a list or a single string).
pub fn tokens(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::List(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}
