//! Root write operations
//!
//! `createProduct`, `updateProduct`, `deleteProduct`, their bulk variants and
//! `invokeProduct<Method>` for invokable mutating methods. Resolvers never
//! fail the GraphQL request for business errors: every outcome is reported
//! through a payload (see [super::payload]).
//!
//! Each unit of work runs in its own [crate::store::StoreTransaction] and moves through
//! [MutationState]:
//!
//! ```text
//! Received -> Validated -> Executed -> Succeeded
//!     \            \           \
//!      +------------+-----------+--> Failed
//! ```

mod bulk;
mod create;
mod delete;
mod invoke;
mod update;
mod write;

use std::fmt;
use std::sync::Arc;

use async_graphql::Value;
use async_graphql::dynamic::{Field, ResolverContext};
use tracing::{debug, warn};

use super::operation::{OperationDescriptor, OperationKind, operations_for};
use super::payload::{ErrorCode, MutationError, MutationOutcome};
use super::validation::Input;
use super::{ModelEntry, SchemaRuntime};
use crate::cache::ChangeEvent;
use crate::error::StoreError;
use crate::models::MethodHandler;
use write::{Applied, WriteFailure, WriteItem};

pub(crate) mod prelude {
    pub(crate) use async_graphql::dynamic::{Field, FieldFuture, FieldValue, InputValue, TypeRef};

    pub(crate) use super::WriteOperation;
    pub(crate) use super::write::WriteItem;
    pub(crate) use crate::graphql::ModelEntry;
}

/// Lifecycle of one mutation (or one bulk item).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Received,
    Validated,
    Executed,
    Succeeded,
    Failed,
}

impl MutationState {
    pub fn can_advance_to(&self, next: MutationState) -> bool {
        use MutationState::*;
        matches!(
            (self, next),
            (Received, Validated) | (Validated, Executed) | (Executed, Succeeded) | (Received | Validated | Executed, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationState::Succeeded | MutationState::Failed)
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationState::Received => "received",
            MutationState::Validated => "validated",
            MutationState::Executed => "executed",
            MutationState::Succeeded => "succeeded",
            MutationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State tracker for one unit of work.
#[derive(Debug)]
pub(crate) struct MutationRun<'a> {
    operation: &'a str,
    index: Option<usize>,
    state: MutationState,
}

impl<'a> MutationRun<'a> {
    pub fn new(operation: &'a str, index: Option<usize>) -> Self {
        debug!(operation, ?index, "Mutation received");
        Self {
            operation,
            index,
            state: MutationState::Received,
        }
    }

    pub fn advance(&mut self, next: MutationState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid mutation transition {} -> {next}",
            self.state
        );
        debug!(operation = self.operation, index = ?self.index, from = %self.state, to = %next, "Mutation state");
        self.state = next;
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.advance(MutationState::Failed);
        }
    }

    pub fn state(&self) -> MutationState {
        self.state
    }
}

/// Everything a root write resolver captures.
#[derive(Clone)]
pub(crate) struct WriteOperation {
    pub runtime: Arc<SchemaRuntime>,
    pub descriptor: OperationDescriptor,
}

impl WriteOperation {
    pub fn entry(&self) -> async_graphql::Result<&ModelEntry> {
        self.runtime.entry(&self.descriptor.model)
    }

    fn denied(&self) -> MutationOutcome {
        warn!(schema = %self.runtime.schema_name, operation = %self.descriptor.name, "Mutation denied");
        MutationOutcome::failed(vec![MutationError::new(
            ErrorCode::Permission,
            format!("You do not have permission to run {}.", self.descriptor.name),
        )])
    }

    /// Payload errors for a failed unit of work.
    fn errors_of(&self, ctx: &ResolverContext<'_>, failure: WriteFailure) -> Vec<MutationError> {
        match failure {
            WriteFailure::Rejected(errors) => errors,
            WriteFailure::Store(StoreError::Conflict(detail)) => {
                debug!(operation = %self.descriptor.name, %detail, "Store reported a conflict");
                vec![MutationError::new(
                    ErrorCode::Duplicate,
                    "The write conflicts with an existing row.",
                )]
            }
            WriteFailure::Store(err) => {
                // logged with the correlation id, surfaced as GENERAL
                let logged = self.runtime.store_failure(ctx, err);
                vec![MutationError::new(ErrorCode::General, logged.message)]
            }
        }
    }

    fn changed(&self, applied: &[Applied]) {
        let mut kinds: Vec<_> = applied.iter().map(|a| a.change).collect();
        kinds.dedup();
        for kind in kinds {
            self.runtime
                .notify(ChangeEvent::row_written(self.descriptor.model.clone(), kind));
        }
    }

    /// Run one unit of work in its own transaction.
    pub async fn run_single(&self, ctx: &ResolverContext<'_>, item: WriteItem<'_>) -> async_graphql::Result<MutationOutcome> {
        let entry = self.entry()?;
        let mut run = MutationRun::new(&self.descriptor.name, None);
        if !self.runtime.permits(ctx, &self.descriptor) {
            run.fail();
            return Ok(self.denied());
        }
        Ok(match self.run_item(ctx, entry, &item, &mut run).await {
            Ok(applied) => {
                self.changed(std::slice::from_ref(&applied));
                applied.into_outcome()
            }
            Err(errors) => MutationOutcome::failed(errors),
        })
    }

    /// Begin, apply and commit one item; the transaction is rolled back on
    /// any failure.
    async fn transact(
        &self,
        entry: &ModelEntry,
        item: &WriteItem<'_>,
        run: &mut MutationRun<'_>,
    ) -> Result<Applied, WriteFailure> {
        let mut tx = self.runtime.store.begin().await?;
        match write::apply(tx.as_mut(), &self.runtime, entry, item, run).await {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(failure) => {
                if let Err(err) = tx.rollback().await {
                    warn!(operation = %self.descriptor.name, error = %err, "Rollback failed");
                }
                Err(failure)
            }
        }
    }

    async fn run_item(
        &self,
        ctx: &ResolverContext<'_>,
        entry: &ModelEntry,
        item: &WriteItem<'_>,
        run: &mut MutationRun<'_>,
    ) -> Result<Applied, Vec<MutationError>> {
        match self.transact(entry, item, run).await {
            Ok(applied) => {
                run.advance(MutationState::Succeeded);
                Ok(applied)
            }
            Err(failure) => {
                debug!(operation = %self.descriptor.name, index = ?run.index, reached = %run.state(), "Unit of work failed");
                run.fail();
                Err(self.errors_of(ctx, failure))
            }
        }
    }
}

/// Object argument of a resolver.
pub(crate) fn object_arg<'a>(ctx: &'a ResolverContext<'_>, name: &str) -> Option<&'a Input> {
    match ctx.args.as_index_map().get(name) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn missing(argument: &str) -> MutationOutcome {
    MutationOutcome::failed(vec![MutationError::on_field(
        ErrorCode::Required,
        argument,
        "This field is required.",
    )])
}

/// Root write fields of every exposed model, paired with their operations.
pub fn root_fields(runtime: &Arc<SchemaRuntime>) -> (Vec<(OperationDescriptor, Field)>, Vec<String>) {
    let mut fields = Vec::new();
    let mut warnings = Vec::new();
    for entry in runtime.models.exposed() {
        for descriptor in operations_for(entry, &runtime.settings)
            .into_iter()
            .filter(|op| !op.kind.is_read())
        {
            let op = WriteOperation {
                runtime: runtime.clone(),
                descriptor: descriptor.clone(),
            };
            let field = match descriptor.kind {
                OperationKind::Create => create::field(entry, op),
                OperationKind::Update => update::field(entry, op),
                OperationKind::Delete => delete::field(entry, op),
                OperationKind::BulkCreate => bulk::create_field(entry, op),
                OperationKind::BulkUpdate => bulk::update_field(entry, op),
                OperationKind::BulkDelete => bulk::delete_field(entry, op),
                OperationKind::MethodInvocation => {
                    let Some(method) = descriptor
                        .method
                        .as_deref()
                        .and_then(|name| entry.descriptor.methods().find(|m| m.name == name))
                    else {
                        continue;
                    };
                    if !matches!(runtime.catalog.method(entry.key(), &method.name), Some(MethodHandler::Mutate(_))) {
                        warn!(model = %entry.key(), method = %method.name, "Invokable method has no handler");
                        warnings.push(format!(
                            "{}: method `{}` has no registered handler, invocations will fail",
                            entry.key(),
                            method.name
                        ));
                    }
                    invoke::field(entry, method, op)
                }
                _ => continue,
            };
            fields.push((descriptor, field));
        }
    }
    (fields, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use MutationState::*;
        assert!(Received.can_advance_to(Validated));
        assert!(Validated.can_advance_to(Executed));
        assert!(Executed.can_advance_to(Succeeded));
        assert!(Received.can_advance_to(Failed));
        assert!(Executed.can_advance_to(Failed));
        assert!(!Received.can_advance_to(Executed));
        assert!(!Succeeded.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Succeeded));
    }

    #[test]
    fn test_fail_is_noop_once_terminal() {
        let mut run = MutationRun::new("createProduct", None);
        run.advance(MutationState::Validated);
        run.advance(MutationState::Executed);
        run.advance(MutationState::Succeeded);
        run.fail();
        assert_eq!(run.state(), MutationState::Succeeded);
    }
}
