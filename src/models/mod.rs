//! Host-side model declarations
//!
//! A [ModelDefinition] is what the relational-mapping framework knows about
//! one entity: its raw attribute declarations, parents, managers and meta
//! options. Definitions live in a [ModelCatalog]; the introspector turns them
//! into immutable descriptors.
//!
//! Definitions can be built in code, loaded from YAML, or derived from an
//! annotated struct:
//!
//! ```rust,ignore
//! use modelql::models::DescribeModel;
//!
//! #[derive(modelql::Model)]
//! #[model(namespace = "catalog", ordering = "name")]
//! struct Category {
//!     #[model(primary_key)]
//!     id: i64,
//!     #[model(max_length = 80, unique)]
//!     name: String,
//! }
//!
//! let def = Category::model_definition();
//! ```

mod catalog;
mod definition;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use catalog::*;
pub use definition::*;

/// Stable identity of a model: owning namespace plus model name.
///
/// Relationships reference their targets by key so that cyclic graphs
/// (self references, mutual foreign keys) never need construction order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub namespace: String,
    pub name: String,
}

impl ModelKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `"namespace.Name"`, falling back to `default_namespace` for a bare `"Name"`.
    pub fn parse(reference: &str, default_namespace: &str) -> Self {
        match reference.rsplit_once('.') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new(default_namespace, reference),
        }
    }

    /// `"namespace.Name"`
    pub fn label(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified_reference() {
        let key = ModelKey::parse("catalog.Product", "shop");
        assert_eq!(key, ModelKey::new("catalog", "Product"));
    }

    #[test]
    fn test_parse_bare_reference_uses_default_namespace() {
        let key = ModelKey::parse("Product", "shop");
        assert_eq!(key.label(), "shop.Product");
    }
}
