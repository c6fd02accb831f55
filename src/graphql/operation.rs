//! Root operations a schema exposes for a model.

use convert_case::{Case, Casing};
use serde::Serialize;

use super::ModelEntry;
use crate::models::ModelKey;
use crate::schema::SchemaSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SingleRead,
    ListRead,
    PaginatedRead,
    Create,
    Update,
    Delete,
    BulkCreate,
    BulkUpdate,
    BulkDelete,
    MethodInvocation,
}

impl OperationKind {
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            OperationKind::SingleRead | OperationKind::ListRead | OperationKind::PaginatedRead
        )
    }

    fn verb(&self) -> &'static str {
        match self {
            OperationKind::SingleRead | OperationKind::ListRead | OperationKind::PaginatedRead => "view",
            OperationKind::Create | OperationKind::BulkCreate => "add",
            OperationKind::Update | OperationKind::BulkUpdate => "change",
            OperationKind::Delete | OperationKind::BulkDelete => "delete",
            OperationKind::MethodInvocation => "invoke",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationDescriptor {
    /// Root field name
    pub name: String,
    pub kind: OperationKind,
    pub model: ModelKey,
    /// Accessor for reads, `None` for the default accessor and writes
    pub accessor: Option<String>,
    /// Method name for invocations
    pub method: Option<String>,
    /// Permission tag, e.g. `catalog.view_product`
    pub capability: String,
}

impl OperationDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: OperationKind,
        model: ModelKey,
        accessor: Option<String>,
        method: Option<String>,
    ) -> Self {
        let capability = capability_for(kind, &model, method.as_deref());
        Self {
            name: name.into(),
            kind,
            model,
            accessor,
            method,
            capability,
        }
    }
}

/// `<namespace>.<verb>_<model>`; invocations append the method name.
pub fn capability_for(kind: OperationKind, model: &ModelKey, method: Option<&str>) -> String {
    let model_name = model.name.to_case(Case::Snake);
    match (kind, method) {
        (OperationKind::MethodInvocation, Some(method)) => {
            format!("{}.invoke_{}_{}", model.namespace, model_name, method.to_case(Case::Snake))
        }
        _ => format!("{}.{}_{}", model.namespace, kind.verb(), model_name),
    }
}

/// Every root operation generated for `entry` under `settings`, in schema order.
pub fn operations_for(entry: &ModelEntry, settings: &SchemaSettings) -> Vec<OperationDescriptor> {
    let mut ops = Vec::new();
    if !entry.exposed {
        return ops;
    }
    let key = entry.key().clone();
    let names = &entry.names;
    for accessor in &entry.descriptor.accessors {
        let scope = accessor.suffix().map(str::to_string);
        ops.push(OperationDescriptor::new(
            names.single_query(accessor),
            OperationKind::SingleRead,
            key.clone(),
            scope.clone(),
            None,
        ));
        ops.push(OperationDescriptor::new(
            names.list_query(accessor),
            OperationKind::ListRead,
            key.clone(),
            scope.clone(),
            None,
        ));
        ops.push(OperationDescriptor::new(
            names.pages_query(accessor),
            OperationKind::PaginatedRead,
            key.clone(),
            scope,
            None,
        ));
    }
    if !settings.enable_mutations || entry.descriptor.inheritance.is_abstract {
        return ops;
    }
    let mut write = |name: String, kind: OperationKind| {
        ops.push(OperationDescriptor::new(name, kind, key.clone(), None, None));
    };
    write(names.create_mutation(), OperationKind::Create);
    write(names.update_mutation(), OperationKind::Update);
    write(names.delete_mutation(), OperationKind::Delete);
    if settings.enable_bulk {
        write(names.bulk_create_mutation(), OperationKind::BulkCreate);
        write(names.bulk_update_mutation(), OperationKind::BulkUpdate);
        write(names.bulk_delete_mutation(), OperationKind::BulkDelete);
    }
    if settings.enable_invocations {
        for method in entry
            .descriptor
            .methods()
            .filter(|m| m.invokable && !m.read_only)
        {
            ops.push(OperationDescriptor::new(
                names.invoke_mutation(&method.name),
                OperationKind::MethodInvocation,
                key.clone(),
                None,
                Some(method.name.clone()),
            ));
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_tags() {
        let key = ModelKey::new("catalog", "OrderItem");
        assert_eq!(
            capability_for(OperationKind::PaginatedRead, &key, None),
            "catalog.view_order_item"
        );
        assert_eq!(
            capability_for(OperationKind::BulkDelete, &key, None),
            "catalog.delete_order_item"
        );
        assert_eq!(
            capability_for(OperationKind::MethodInvocation, &key, Some("markShipped")),
            "catalog.invoke_order_item_mark_shipped"
        );
    }
}
