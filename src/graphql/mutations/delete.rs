use super::missing;
use super::prelude::*;
use crate::graphql::types::id_argument;

/// `deleteProduct(id: ID!): ProductPayload!`
pub(super) fn field(entry: &ModelEntry, op: WriteOperation) -> Field {
    Field::new(op.descriptor.name.clone(), TypeRef::named_nn(&entry.names.payload), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            let outcome = match id_argument(&ctx, "id") {
                Ok(id) => op.run_single(&ctx, WriteItem::Delete(id)).await?,
                Err(_) => missing("id"),
            };
            Ok(Some(FieldValue::owned_any(outcome)))
        })
    })
    .argument(InputValue::new("id", TypeRef::named_nn(TypeRef::ID)))
    .description(format!(
        "Delete a {} and apply the on-delete behaviour of its dependents",
        entry.names.object
    ))
}
