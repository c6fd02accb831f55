//! Naming rules for generated types and operations.

use std::collections::BTreeMap;

use convert_case::{Case, Casing};

use crate::introspect::AccessorDescriptor;
use crate::models::{Choice, ModelKey};

/// Names of every type generated for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeNames {
    pub object: String,
    pub connection: String,
    pub edge: String,
    pub create_input: String,
    pub update_input: String,
    pub filter: String,
    pub payload: String,
    pub bulk_payload: String,
    pub invoke_payload: String,
    /// `product`
    pub single: String,
    /// `products`
    pub plural: String,
}

impl TypeNames {
    pub fn new(object: &str, plural_override: Option<&str>) -> Self {
        let single = object.to_case(Case::Camel);
        let plural = match plural_override {
            Some(p) => p.to_case(Case::Camel),
            None => pluralize(&single),
        };
        Self {
            object: object.to_string(),
            connection: format!("{object}Connection"),
            edge: format!("{object}Edge"),
            create_input: format!("{object}CreateInput"),
            update_input: format!("{object}UpdateInput"),
            filter: format!("{object}Filter"),
            payload: format!("{object}Payload"),
            bulk_payload: format!("{object}BulkPayload"),
            invoke_payload: format!("{object}InvokePayload"),
            single,
            plural,
        }
    }

    /// `product` / `product__archived`
    pub fn single_query(&self, accessor: &AccessorDescriptor) -> String {
        match accessor.suffix() {
            None => self.single.clone(),
            Some(suffix) => format!("{}__{}", self.single, suffix),
        }
    }

    /// `products` / `products__archived`
    pub fn list_query(&self, accessor: &AccessorDescriptor) -> String {
        match accessor.suffix() {
            None => self.plural.clone(),
            Some(suffix) => format!("{}__{}", self.plural, suffix),
        }
    }

    /// `productPages` / `product_pages_archived`
    pub fn pages_query(&self, accessor: &AccessorDescriptor) -> String {
        match accessor.suffix() {
            None => format!("{}Pages", self.single),
            Some(suffix) => format!("{}_pages_{}", self.single, suffix),
        }
    }

    pub fn create_mutation(&self) -> String {
        format!("create{}", self.object)
    }

    pub fn update_mutation(&self) -> String {
        format!("update{}", self.object)
    }

    pub fn delete_mutation(&self) -> String {
        format!("delete{}", self.object)
    }

    pub fn bulk_create_mutation(&self) -> String {
        format!("bulkCreate{}", self.object)
    }

    pub fn bulk_update_mutation(&self) -> String {
        format!("bulkUpdate{}", self.object)
    }

    pub fn bulk_delete_mutation(&self) -> String {
        format!("bulkDelete{}", self.object)
    }

    pub fn invoke_mutation(&self, method: &str) -> String {
        format!("invoke{}{}", self.object, method.to_case(Case::Pascal))
    }
}

/// Object type names for a set of models. Names that collide across
/// namespaces are prefixed with the namespace.
pub fn object_names<'a>(keys: impl IntoIterator<Item = &'a ModelKey>) -> BTreeMap<ModelKey, String> {
    let keys: Vec<&ModelKey> = keys.into_iter().collect();
    keys.iter()
        .map(|key| {
            let collides = keys
                .iter()
                .filter(|other| other.name == key.name)
                .count()
                > 1;
            let base = key.name.to_case(Case::Pascal);
            let name = if collides {
                format!("{}{}", key.namespace.to_case(Case::Pascal), base)
            } else {
                base
            };
            ((*key).clone(), name)
        })
        .collect()
}

/// GraphQL field name for a member.
pub fn field_name(member: &str) -> String {
    member.to_case(Case::Camel)
}

pub fn pluralize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if lower.ends_with('y')
        && !matches!(
            lower.chars().rev().nth(1),
            Some('a' | 'e' | 'i' | 'o' | 'u')
        )
    {
        format!("{}ies", &word[..word.len() - 1])
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|s| lower.ends_with(s)) {
        format!("{word}es")
    } else {
        format!("{word}s")
    }
}

/// Enum item for a stored choice value: `in-progress` becomes `IN_PROGRESS`.
pub fn enum_item(value: &str) -> String {
    let mut item: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if item.is_empty() || item.starts_with(|c: char| c.is_ascii_digit()) {
        item.insert(0, '_');
    }
    if matches!(item.as_str(), "TRUE" | "FALSE" | "NULL") {
        item.push('_');
    }
    item
}

/// Items for a choice set, disambiguating values that sanitize alike.
pub fn enum_items(choices: &[Choice]) -> Vec<(String, String)> {
    let mut items: Vec<(String, String)> = Vec::with_capacity(choices.len());
    for choice in choices {
        let base = enum_item(&choice.value);
        let mut item = base.clone();
        let mut n = 2;
        while items.iter().any(|(existing, _)| existing == &item) {
            item = format!("{base}_{n}");
            n += 1;
        }
        items.push((item, choice.value.clone()));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accessor(name: &str, is_default: bool) -> AccessorDescriptor {
        AccessorDescriptor {
            name: name.into(),
            is_default,
            scope: None,
            description: None,
        }
    }

    #[test]
    fn test_operation_names() {
        let names = TypeNames::new("OrderItem", None);
        let default = accessor("objects", true);
        let archived = accessor("archived", false);
        assert_eq!(names.single_query(&default), "orderItem");
        assert_eq!(names.list_query(&default), "orderItems");
        assert_eq!(names.pages_query(&default), "orderItemPages");
        assert_eq!(names.single_query(&archived), "orderItem__archived");
        assert_eq!(names.list_query(&archived), "orderItems__archived");
        assert_eq!(names.pages_query(&archived), "orderItem_pages_archived");
        assert_eq!(names.invoke_mutation("mark_shipped"), "invokeOrderItemMarkShipped");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("day"), "days");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("branch"), "branches");
        assert_eq!(pluralize("product"), "products");
    }

    #[test]
    fn test_colliding_names_get_namespace_prefix() {
        let a = ModelKey::new("billing", "Account");
        let b = ModelKey::new("crm", "Account");
        let c = ModelKey::new("crm", "Lead");
        let names = object_names([&a, &b, &c]);
        assert_eq!(names[&a], "BillingAccount");
        assert_eq!(names[&b], "CrmAccount");
        assert_eq!(names[&c], "Lead");
    }

    #[test]
    fn test_enum_items_are_valid_and_unique() {
        let choices = vec![Choice::new("in-progress"), Choice::new("in_progress"), Choice::new("1st")];
        let items = enum_items(&choices);
        assert_eq!(items[0].0, "IN_PROGRESS");
        assert_eq!(items[1].0, "IN_PROGRESS_2");
        assert_eq!(items[2].0, "_1ST");
    }
}
