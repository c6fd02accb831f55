use serde_json::Map as JsonMap;

use super::missing;
use super::prelude::*;
use crate::graphql::naming::field_name;
use crate::graphql::scalars;
use crate::graphql::types::id_argument;
use crate::introspect::MethodDescriptor;

/// `invokeProductRestock(id: ID!, amount: Int): ProductInvokePayload!`
///
/// Runs the method's registered handler on the stored row and persists
/// whatever columns it changed.
pub(super) fn field(entry: &ModelEntry, method: &MethodDescriptor, op: WriteOperation) -> Field {
    let method_name = method.name.clone();
    let params: Vec<(String, String)> = method
        .params
        .iter()
        .map(|p| (field_name(&p.name), p.name.clone()))
        .collect();
    let arguments: Vec<InputValue> = method
        .params
        .iter()
        .map(|param| {
            let ty = scalars::type_name(&param.kind, &op.runtime.models.enums);
            let ty = if param.required {
                TypeRef::named_nn(ty)
            } else {
                TypeRef::named(ty)
            };
            InputValue::new(field_name(&param.name), ty)
        })
        .collect();
    let mut field = Field::new(
        op.descriptor.name.clone(),
        TypeRef::named_nn(&entry.names.invoke_payload),
        move |ctx| {
            let op = op.clone();
            let method = method_name.clone();
            let params = params.clone();
            FieldFuture::new(async move {
                let Ok(id) = id_argument(&ctx, "id") else {
                    return Ok(Some(FieldValue::owned_any(missing("id"))));
                };
                let given = ctx.args.as_index_map();
                let mut args = JsonMap::new();
                for (gql, raw) in &params {
                    if let Some(value) = given.get(gql.as_str()) {
                        args.insert(raw.clone(), scalars::value_to_json(value));
                    }
                }
                let outcome = op.run_single(&ctx, WriteItem::Invoke { id, method, args }).await?;
                Ok(Some(FieldValue::owned_any(outcome)))
            })
        },
    )
    .argument(InputValue::new("id", TypeRef::named_nn(TypeRef::ID)));

    for argument in arguments {
        field = field.argument(argument);
    }
    if let Some(help) = &method.help_text {
        field = field.description(help);
    }
    field
}
