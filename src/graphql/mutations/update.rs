use super::missing;
use super::object_arg;
use super::prelude::*;

/// `updateProduct(input: ProductUpdateInput!): ProductPayload!`
///
/// Only the fields present in the input are written; many-to-many lists
/// replace the current links.
pub(super) fn field(entry: &ModelEntry, op: WriteOperation) -> Field {
    Field::new(op.descriptor.name.clone(), TypeRef::named_nn(&entry.names.payload), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            let outcome = match object_arg(&ctx, "input") {
                Some(input) => op.run_single(&ctx, WriteItem::Update(input)).await?,
                None => missing("input"),
            };
            Ok(Some(FieldValue::owned_any(outcome)))
        })
    })
    .argument(InputValue::new("input", TypeRef::named_nn(&entry.names.update_input)))
    .description(format!("Update a {}", entry.names.object))
}
