use async_graphql::Value;
use tracing::debug;

use super::int_arg;
use super::prelude::*;
use crate::graphql::filters::FilterCompiler;
use crate::graphql::ordering;
use crate::graphql::pagination::{Connection, PageRequest};
use crate::introspect::AccessorDescriptor;

fn string_arg<'a>(args: &'a async_graphql::indexmap::IndexMap<async_graphql::Name, Value>, name: &str) -> Option<&'a str> {
    match args.get(name) {
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// `productPages(filter, orderBy, first, after, last, before): ProductConnection!`
pub(super) fn field(entry: &ModelEntry, accessor: &AccessorDescriptor, op: ReadOperation) -> Field {
    let name = op.descriptor.name.clone();
    Field::new(name, TypeRef::named_nn(&entry.names.connection), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            authorize(&ctx, &op.runtime, &op.descriptor)?;
            let runtime = &op.runtime;
            let entry = op.entry()?;
            let args = ctx.args.as_index_map();

            let request = PageRequest::parse(
                int_arg(args, "first"),
                string_arg(args, "after"),
                int_arg(args, "last"),
                string_arg(args, "before"),
                &runtime.settings,
            )
            .map_err(|err| err.to_graphql())?;
            let filter = match args.get("filter") {
                Some(value) if !matches!(value, Value::Null) => FilterCompiler::new(&runtime.models, &runtime.settings)
                    .compile(entry, value)
                    .map_err(|err| err.to_graphql())?,
                _ => Predicate::All,
            };
            let order = ordering::compile(entry, &ordering::tokens(args.get("orderBy")))
                .map_err(|err| err.to_graphql())?;
            let base = StoreQuery::new(&entry.descriptor.table)
                .filter(op.scope.clone())
                .filter(filter)
                .order(order);

            let query = request.query(base).with_total();
            debug!(schema = %runtime.schema_name, model = %entry.key(), needs_total = request.needs_total(), "Paginated read");
            let page = runtime
                .read(&query)
                .await
                .map_err(|err| runtime.store_failure(&ctx, err))?;
            let (offset, _) = request.window(page.total);
            let total = page.total.unwrap_or(offset.saturating_add(page.rows.len()));
            Ok(Some(FieldValue::owned_any(Connection::from_rows(page.rows, offset, total))))
        })
    })
    .argument(InputValue::new("filter", TypeRef::named(&entry.names.filter)))
    .argument(InputValue::new("orderBy", TypeRef::named_nn_list(TypeRef::STRING)))
    .argument(InputValue::new("first", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("after", TypeRef::named(TypeRef::STRING)))
    .argument(InputValue::new("last", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("before", TypeRef::named(TypeRef::STRING)))
    .description(match &accessor.description {
        Some(description) => description.clone(),
        None => format!("Page through {} through `{}`", entry.names.plural, accessor.name),
    })
}
