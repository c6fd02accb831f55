use super::missing;
use super::object_arg;
use super::prelude::*;

/// `createProduct(input: ProductCreateInput!): ProductPayload!`
pub(super) fn field(entry: &ModelEntry, op: WriteOperation) -> Field {
    Field::new(op.descriptor.name.clone(), TypeRef::named_nn(&entry.names.payload), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            let outcome = match object_arg(&ctx, "input") {
                Some(input) => op.run_single(&ctx, WriteItem::Create(input)).await?,
                None => missing("input"),
            };
            Ok(Some(FieldValue::owned_any(outcome)))
        })
    })
    .argument(InputValue::new("input", TypeRef::named_nn(&entry.names.create_input)))
    .description(format!("Create a {}", entry.names.object))
}
