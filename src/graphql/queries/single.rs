use super::prelude::*;
use crate::graphql::row_value;
use crate::graphql::types::{id_argument, key_predicate};
use crate::introspect::AccessorDescriptor;

/// `product(id: ID!): Product`
pub(super) fn field(entry: &ModelEntry, accessor: &AccessorDescriptor, op: ReadOperation) -> Field {
    let name = op.descriptor.name.clone();
    Field::new(name, TypeRef::named(&entry.names.object), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            authorize(&ctx, &op.runtime, &op.descriptor)?;
            let entry = op.entry()?;
            let id = id_argument(&ctx, "id")?;
            let query = StoreQuery::new(&entry.descriptor.table)
                .filter(op.scope.clone())
                .filter(key_predicate(entry, &id))
                .window(0, Some(1));
            let page = op
                .runtime
                .read(&query)
                .await
                .map_err(|err| op.runtime.store_failure(&ctx, err))?;
            Ok(page.rows.into_iter().next().map(row_value))
        })
    })
    .argument(InputValue::new("id", TypeRef::named_nn(TypeRef::ID)))
    .description(match &accessor.description {
        Some(description) => description.clone(),
        None => format!("Fetch one {} by id", entry.names.object),
    })
}
