//! Root read operations
//!
//! Every accessor of an exposed model yields three root fields:
//! `product(id)`, `products(filter, orderBy, limit, offset)` and
//! `productPages(filter, orderBy, first, after, last, before)`. Non-default
//! accessors are suffixed (`products__active`, `product_pages_active`) and
//! carry the accessor's scope predicate into every store query.

mod list;
mod pages;
mod single;

use std::sync::Arc;

use async_graphql::Value;
use async_graphql::dynamic::{Field, InputValue, ResolverContext, TypeRef};
use tracing::{debug, warn};

use super::filters::FilterCompiler;
use super::operation::{OperationDescriptor, OperationKind, operations_for};
use super::{ModelEntry, SchemaRuntime, ordering};
use crate::error::coded_error;
use crate::introspect::AccessorDescriptor;
use crate::store::{Predicate, Record, StoreQuery};

pub(crate) mod prelude {
    pub(crate) use async_graphql::dynamic::{Field, FieldFuture, FieldValue, InputValue, TypeRef};

    pub(crate) use super::{ReadOperation, authorize};
    pub(crate) use crate::graphql::ModelEntry;
    pub(crate) use crate::store::{Predicate, StoreQuery};
}

/// Everything a root read resolver captures.
#[derive(Clone)]
pub(crate) struct ReadOperation {
    pub runtime: Arc<SchemaRuntime>,
    pub descriptor: OperationDescriptor,
    /// Accessor scope, `Predicate::All` for unscoped accessors
    pub scope: Predicate,
}

impl ReadOperation {
    pub fn entry(&self) -> async_graphql::Result<&ModelEntry> {
        self.runtime.entry(&self.descriptor.model)
    }
}

/// Fail with a `PERMISSION` error unless the request may run `operation`.
pub(crate) fn authorize(
    ctx: &ResolverContext<'_>,
    runtime: &SchemaRuntime,
    operation: &OperationDescriptor,
) -> async_graphql::Result<()> {
    if runtime.permits(ctx, operation) {
        Ok(())
    } else {
        Err(coded_error(
            "PERMISSION",
            format!("not allowed to run `{}`", operation.name),
        ))
    }
}

/// Compile an accessor's declared scope against the model's filter.
pub(crate) fn accessor_scope(
    runtime: &SchemaRuntime,
    entry: &ModelEntry,
    accessor: &AccessorDescriptor,
) -> Result<Predicate, String> {
    let Some(scope) = &accessor.scope else {
        return Ok(Predicate::All);
    };
    let value = Value::from_json(scope.clone()).map_err(|err| err.to_string())?;
    FilterCompiler::new(&runtime.models, &runtime.settings)
        .compile(entry, &value)
        .map_err(|err| err.to_string())
}

/// Root read fields of every exposed model, paired with their operations.
pub fn root_fields(runtime: &Arc<SchemaRuntime>) -> (Vec<(OperationDescriptor, Field)>, Vec<String>) {
    let mut fields = Vec::new();
    let mut warnings = Vec::new();
    for entry in runtime.models.exposed() {
        for descriptor in operations_for(entry, &runtime.settings)
            .into_iter()
            .filter(|op| op.kind.is_read())
        {
            let accessor = entry
                .descriptor
                .accessors
                .iter()
                .find(|a| a.suffix() == descriptor.accessor.as_deref());
            let Some(accessor) = accessor else { continue };
            let scope = match accessor_scope(runtime, entry, accessor) {
                Ok(scope) => scope,
                Err(err) => {
                    warn!(model = %entry.key(), accessor = %accessor.name, error = %err, "Skipping accessor with invalid scope");
                    warnings.push(format!(
                        "{}: accessor `{}` skipped, invalid scope: {err}",
                        entry.key(),
                        accessor.name
                    ));
                    continue;
                }
            };
            let op = ReadOperation {
                runtime: runtime.clone(),
                descriptor: descriptor.clone(),
                scope,
            };
            let field = match descriptor.kind {
                OperationKind::SingleRead => single::field(entry, accessor, op),
                OperationKind::ListRead => list::field(entry, accessor, op),
                OperationKind::PaginatedRead => pages::field(entry, accessor, op),
                _ => continue,
            };
            fields.push((descriptor, field));
        }
    }
    (fields, warnings)
}

/// Arguments shared by list reads and list relationship fields.
#[derive(Debug, Clone, Default)]
pub(crate) struct ListArgs {
    pub filter: Option<Value>,
    pub order: Vec<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn int_arg(args: &async_graphql::indexmap::IndexMap<async_graphql::Name, Value>, name: &str) -> Option<i64> {
    match args.get(name) {
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    }
}

impl ListArgs {
    pub fn from_ctx(ctx: &ResolverContext<'_>) -> Self {
        let args = ctx.args.as_index_map();
        Self {
            filter: args.get("filter").filter(|v| !matches!(v, Value::Null)).cloned(),
            order: ordering::tokens(args.get("orderBy")),
            limit: int_arg(args, "limit"),
            offset: int_arg(args, "offset"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_none() && self.order.is_empty() && self.limit.is_none() && self.offset.is_none()
    }
}

/// Add `filter`, `orderBy`, `limit` and `offset` to a list field of `target`.
pub(crate) fn list_arguments(field: Field, target: &ModelEntry) -> Field {
    field
        .argument(InputValue::new("filter", TypeRef::named(&target.names.filter)))
        .argument(InputValue::new("orderBy", TypeRef::named_nn_list(TypeRef::STRING)))
        .argument(InputValue::new("limit", TypeRef::named(TypeRef::INT)))
        .argument(InputValue::new("offset", TypeRef::named(TypeRef::INT)))
}

/// Filter, order and window `entry` rows within `base`, in one store query.
///
/// `limit` defaults to and is clamped at `page_size_max`.
pub(crate) async fn fetch_list(
    ctx: &ResolverContext<'_>,
    runtime: &SchemaRuntime,
    entry: &ModelEntry,
    base: Predicate,
    args: &ListArgs,
) -> async_graphql::Result<Vec<Record>> {
    let predicate = match &args.filter {
        Some(filter) => FilterCompiler::new(&runtime.models, &runtime.settings)
            .compile(entry, filter)
            .map_err(|err| err.to_graphql())?,
        None => Predicate::All,
    };
    let order = ordering::compile(entry, &args.order).map_err(|err| err.to_graphql())?;
    let max = runtime.settings.page_size_max;
    let limit = args.limit.map(|l| l.clamp(0, max as i64) as usize).unwrap_or(max);
    let offset = args.offset.unwrap_or(0).max(0) as usize;

    let query = StoreQuery::new(&entry.descriptor.table)
        .filter(base)
        .filter(predicate)
        .order(order)
        .window(offset, Some(limit));
    debug!(schema = %runtime.schema_name, model = %entry.key(), ?query, "List read");
    runtime
        .read(&query)
        .await
        .map(|page| page.rows)
        .map_err(|err| runtime.store_failure(ctx, err))
}
