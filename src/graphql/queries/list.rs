use super::prelude::*;
use super::{ListArgs, fetch_list, list_arguments};
use crate::graphql::row_value;
use crate::introspect::AccessorDescriptor;

/// `products(filter, orderBy, limit, offset): [Product!]!`
pub(super) fn field(entry: &ModelEntry, accessor: &AccessorDescriptor, op: ReadOperation) -> Field {
    let name = op.descriptor.name.clone();
    let field = Field::new(name, TypeRef::named_nn_list_nn(&entry.names.object), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            authorize(&ctx, &op.runtime, &op.descriptor)?;
            let entry = op.entry()?;
            let args = ListArgs::from_ctx(&ctx);
            let rows = fetch_list(&ctx, &op.runtime, entry, op.scope.clone(), &args).await?;
            Ok(Some(FieldValue::list(rows.into_iter().map(row_value))))
        })
    })
    .description(match &accessor.description {
        Some(description) => description.clone(),
        None => format!("List {} through `{}`", entry.names.plural, accessor.name),
    });
    list_arguments(field, entry)
}
