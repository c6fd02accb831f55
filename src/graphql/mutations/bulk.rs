//! Bulk create, update and delete
//!
//! Items are independent by default: each runs in its own transaction and a
//! failing item is reported against its index without touching its
//! siblings. With `stopOnError: true` the whole batch shares one transaction
//! and the first failure rolls everything back.

use async_graphql::Value;
use async_graphql::dynamic::ResolverContext;
use tracing::{info, warn};

use super::prelude::*;
use super::write::{self, Applied, WriteFailure};
use super::{MutationRun, MutationState};
use crate::graphql::payload::{ErrorCode, MutationError, MutationOutcome};
use crate::graphql::validation::{self, Input};

fn list_arg<'a>(ctx: &'a ResolverContext<'_>, name: &str) -> &'a [Value] {
    match ctx.args.as_index_map().get(name) {
        Some(Value::List(items)) => items,
        _ => &[],
    }
}

fn stop_on_error(ctx: &ResolverContext<'_>) -> bool {
    matches!(ctx.args.as_index_map().get("stopOnError"), Some(Value::Boolean(true)))
}

/// Input objects of `inputs`, `None` for anything else.
fn inputs<'a>(ctx: &'a ResolverContext<'_>, wrap: fn(&'a Input) -> WriteItem<'a>) -> Vec<Option<WriteItem<'a>>> {
    list_arg(ctx, "inputs")
        .iter()
        .map(|value| match value {
            Value::Object(map) => Some(wrap(map)),
            _ => None,
        })
        .collect()
}

fn outcome(applied: Vec<Applied>, errors: Vec<MutationError>, failed_items: usize) -> MutationOutcome {
    let success_count = applied.len();
    let mut outcome = MutationOutcome {
        ok: failed_items == 0,
        errors,
        success_count,
        error_count: failed_items,
        ..MutationOutcome::default()
    };
    for item in applied {
        outcome.objects.extend(item.row);
        outcome.deleted.extend(item.deleted);
    }
    outcome
}

impl WriteOperation {
    /// Run a batch of items and report per-index results.
    pub(crate) async fn run_bulk(
        &self,
        ctx: &ResolverContext<'_>,
        items: Vec<Option<WriteItem<'_>>>,
        stop_on_error: bool,
    ) -> async_graphql::Result<MutationOutcome> {
        let entry = self.entry()?;
        if !self.runtime.permits(ctx, &self.descriptor) {
            return Ok(self.denied());
        }
        let limit = self.runtime.settings.bulk_batch_limit;
        if items.len() > limit {
            warn!(operation = %self.descriptor.name, items = items.len(), limit, "Bulk batch over limit");
            return Ok(MutationOutcome::failed(vec![MutationError::new(
                ErrorCode::Validation,
                format!("At most {limit} items can be processed per request, got {}.", items.len()),
            )]));
        }

        let result = if stop_on_error {
            self.all_or_nothing(ctx, entry, &items).await
        } else {
            self.independent(ctx, entry, &items).await
        };
        info!(
            schema = %self.runtime.schema_name,
            operation = %self.descriptor.name,
            succeeded = result.success_count,
            failed = result.error_count,
            "Bulk mutation finished"
        );
        Ok(result)
    }

    async fn independent(
        &self,
        ctx: &ResolverContext<'_>,
        entry: &ModelEntry,
        items: &[Option<WriteItem<'_>>],
    ) -> MutationOutcome {
        let mut applied = Vec::new();
        let mut errors = Vec::new();
        let mut failed_items = 0;
        for (index, item) in items.iter().enumerate() {
            let mut run = MutationRun::new(&self.descriptor.name, Some(index));
            let result = match item {
                Some(item) => self.run_item(ctx, entry, item, &mut run).await,
                None => {
                    run.fail();
                    Err(vec![invalid_item()])
                }
            };
            match result {
                Ok(done) => applied.push(done),
                Err(item_errors) => {
                    failed_items += 1;
                    errors.extend(item_errors.into_iter().map(|e| e.at(index)));
                }
            }
        }
        self.changed(&applied);
        outcome(applied, errors, failed_items)
    }

    async fn all_or_nothing(
        &self,
        ctx: &ResolverContext<'_>,
        entry: &ModelEntry,
        items: &[Option<WriteItem<'_>>],
    ) -> MutationOutcome {
        let mut tx = match self.runtime.store.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                return outcome(Vec::new(), self.errors_of(ctx, WriteFailure::Store(err)), 1);
            }
        };
        let mut applied = Vec::new();
        let mut runs = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let mut run = MutationRun::new(&self.descriptor.name, Some(index));
            let result = match item {
                Some(item) => write::apply(tx.as_mut(), &self.runtime, entry, item, &mut run).await,
                None => Err(WriteFailure::Rejected(vec![invalid_item()])),
            };
            match result {
                Ok(done) => {
                    applied.push(done);
                    runs.push(run);
                }
                Err(failure) => {
                    run.fail();
                    for earlier in &mut runs {
                        earlier.fail();
                    }
                    if let Err(err) = tx.rollback().await {
                        warn!(operation = %self.descriptor.name, error = %err, "Rollback failed");
                    }
                    let errors = self
                        .errors_of(ctx, failure)
                        .into_iter()
                        .map(|e| e.at(index))
                        .collect();
                    return outcome(Vec::new(), errors, 1);
                }
            }
        }
        if let Err(err) = tx.commit().await {
            for run in &mut runs {
                run.fail();
            }
            return outcome(Vec::new(), self.errors_of(ctx, WriteFailure::Store(err)), 1);
        }
        for run in &mut runs {
            run.advance(MutationState::Succeeded);
        }
        self.changed(&applied);
        outcome(applied, Vec::new(), 0)
    }
}

fn invalid_item() -> MutationError {
    MutationError::new(ErrorCode::Validation, "Expected an input object.")
}

fn bulk_arguments(field: Field, list: InputValue) -> Field {
    field.argument(list).argument(
        InputValue::new("stopOnError", TypeRef::named(TypeRef::BOOLEAN)).default_value(Value::Boolean(false)),
    )
}

/// `bulkCreateProduct(inputs: [ProductCreateInput!]!, stopOnError: Boolean = false)`
pub(super) fn create_field(entry: &ModelEntry, op: WriteOperation) -> Field {
    let field = Field::new(op.descriptor.name.clone(), TypeRef::named_nn(&entry.names.bulk_payload), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            let items = inputs(&ctx, WriteItem::Create);
            let outcome = op.run_bulk(&ctx, items, stop_on_error(&ctx)).await?;
            Ok(Some(FieldValue::owned_any(outcome)))
        })
    })
    .description(format!("Create several {}", entry.names.plural));
    bulk_arguments(
        field,
        InputValue::new("inputs", TypeRef::named_nn_list_nn(&entry.names.create_input)),
    )
}

/// `bulkUpdateProduct(inputs: [ProductUpdateInput!]!, stopOnError: Boolean = false)`
pub(super) fn update_field(entry: &ModelEntry, op: WriteOperation) -> Field {
    let field = Field::new(op.descriptor.name.clone(), TypeRef::named_nn(&entry.names.bulk_payload), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            let items = inputs(&ctx, WriteItem::Update);
            let outcome = op.run_bulk(&ctx, items, stop_on_error(&ctx)).await?;
            Ok(Some(FieldValue::owned_any(outcome)))
        })
    })
    .description(format!("Update several {}", entry.names.plural));
    bulk_arguments(
        field,
        InputValue::new("inputs", TypeRef::named_nn_list_nn(&entry.names.update_input)),
    )
}

/// `bulkDeleteProduct(ids: [ID!]!, stopOnError: Boolean = false)`
pub(super) fn delete_field(entry: &ModelEntry, op: WriteOperation) -> Field {
    let field = Field::new(op.descriptor.name.clone(), TypeRef::named_nn(&entry.names.bulk_payload), move |ctx| {
        let op = op.clone();
        FieldFuture::new(async move {
            let items = list_arg(&ctx, "ids")
                .iter()
                .map(|value| validation::id_of(value).map(WriteItem::Delete))
                .collect();
            let outcome = op.run_bulk(&ctx, items, stop_on_error(&ctx)).await?;
            Ok(Some(FieldValue::owned_any(outcome)))
        })
    })
    .description(format!("Delete several {}", entry.names.plural));
    bulk_arguments(field, InputValue::new("ids", TypeRef::named_nn_list_nn(TypeRef::ID)))
}
