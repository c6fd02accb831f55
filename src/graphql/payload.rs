//! Mutation payloads
//!
//! Every write returns a payload object rather than failing the GraphQL
//! request: `ok`, the affected object(s) and `errors: [MutationError!]!`.
//! All payload types are backed by the same [MutationOutcome] value.

use std::fmt;

use async_graphql::dynamic::{Enum, Field, FieldFuture, FieldValue, Object, TypeRef};
use serde_json::Value as JsonValue;

use super::{ModelEntry, scalars};
use crate::error::coded_error;
use crate::store::Record;

pub const MUTATION_ERROR: &str = "MutationError";
pub const ERROR_CODE: &str = "MutationErrorCode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    Duplicate,
    Required,
    InvalidReference,
    Permission,
    General,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 6] = [
        ErrorCode::Validation,
        ErrorCode::Duplicate,
        ErrorCode::Required,
        ErrorCode::InvalidReference,
        ErrorCode::Permission,
        ErrorCode::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Duplicate => "DUPLICATE",
            ErrorCode::Required => "REQUIRED",
            ErrorCode::InvalidReference => "INVALID_REFERENCE",
            ErrorCode::Permission => "PERMISSION",
            ErrorCode::General => "GENERAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a payload's `errors` list.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationError {
    pub field: Option<String>,
    pub code: ErrorCode,
    pub message: String,
    /// Position of the failing item in a bulk input
    pub index: Option<usize>,
}

impl MutationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: None,
            code,
            message: message.into(),
            index: None,
        }
    }

    pub fn on_field(code: ErrorCode, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            ..Self::new(code, message)
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Result of one mutation resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    pub ok: bool,
    pub objects: Vec<Record>,
    pub deleted: Vec<String>,
    /// Return value of an invoked method
    pub result: Option<JsonValue>,
    pub errors: Vec<MutationError>,
    pub success_count: usize,
    pub error_count: usize,
}

impl MutationOutcome {
    pub fn succeeded(objects: Vec<Record>) -> Self {
        Self {
            ok: true,
            success_count: objects.len(),
            objects,
            ..Self::default()
        }
    }

    pub fn failed(errors: Vec<MutationError>) -> Self {
        Self {
            ok: false,
            error_count: usize::from(!errors.is_empty()),
            errors,
            ..Self::default()
        }
    }
}

fn outcome_of<'a>(value: &'a FieldValue<'a>) -> async_graphql::Result<&'a MutationOutcome> {
    value
        .downcast_ref::<MutationOutcome>()
        .ok_or_else(|| coded_error("GENERAL", "parent value is not a mutation payload"))
}

fn outcome_field(
    name: &str,
    ty: TypeRef,
    get: for<'a> fn(&'a MutationOutcome) -> FieldValue<'a>,
) -> Field {
    Field::new(name, ty, move |ctx| {
        FieldFuture::new(async move { Ok(Some(get(outcome_of(ctx.parent_value)?))) })
    })
}

fn error_field(name: &str, ty: TypeRef, get: fn(&MutationError) -> FieldValue<'static>) -> Field {
    Field::new(name, ty, move |ctx| {
        FieldFuture::new(async move {
            let error = ctx
                .parent_value
                .downcast_ref::<MutationError>()
                .ok_or_else(|| coded_error("GENERAL", "parent value is not a mutation error"))?;
            Ok(Some(get(error)))
        })
    })
}

/// `MutationErrorCode` enum and `MutationError` object shared by all payloads.
pub fn shared_types() -> (Enum, Object) {
    let codes = ErrorCode::ALL
        .iter()
        .fold(Enum::new(ERROR_CODE), |e, code| e.item(code.as_str()));
    let object = Object::new(MUTATION_ERROR)
        .description("A validation or execution failure reported by a mutation")
        .field(error_field("field", TypeRef::named(TypeRef::STRING), |e| {
            e.field.clone().map(FieldValue::value).unwrap_or(FieldValue::NULL)
        }))
        .field(error_field("code", TypeRef::named_nn(ERROR_CODE), |e| {
            FieldValue::value(async_graphql::Value::Enum(async_graphql::Name::new(e.code.as_str())))
        }))
        .field(error_field("message", TypeRef::named_nn(TypeRef::STRING), |e| {
            FieldValue::value(e.message.clone())
        }))
        .field(error_field("index", TypeRef::named(TypeRef::INT), |e| {
            e.index.map(|i| FieldValue::value(i as i64)).unwrap_or(FieldValue::NULL)
        }));
    (codes, object)
}

fn ok_field() -> Field {
    outcome_field("ok", TypeRef::named_nn(TypeRef::BOOLEAN), |o| FieldValue::value(o.ok))
}

fn errors_field() -> Field {
    outcome_field("errors", TypeRef::named_nn_list_nn(MUTATION_ERROR), |o| {
        FieldValue::list(o.errors.iter().map(|e| FieldValue::borrowed_any(e)))
    })
}

fn first_object(o: &MutationOutcome) -> FieldValue<'_> {
    o.objects
        .first()
        .map(|row| FieldValue::borrowed_any(row))
        .unwrap_or(FieldValue::NULL)
}

/// `<Model>Payload`: create, update and delete.
pub fn payload_type(entry: &ModelEntry) -> Object {
    Object::new(&entry.names.payload)
        .field(ok_field())
        .field(outcome_field("object", TypeRef::named(&entry.names.object), first_object))
        .field(outcome_field("deletedId", TypeRef::named(TypeRef::ID), |o| {
            o.deleted
                .first()
                .map(|id| FieldValue::value(id.clone()))
                .unwrap_or(FieldValue::NULL)
        }))
        .field(errors_field())
}

/// `<Model>BulkPayload`.
pub fn bulk_payload_type(entry: &ModelEntry) -> Object {
    Object::new(&entry.names.bulk_payload)
        .field(ok_field())
        .field(outcome_field(
            "objects",
            TypeRef::named_nn_list_nn(&entry.names.object),
            |o| FieldValue::list(o.objects.iter().map(|row| FieldValue::borrowed_any(row))),
        ))
        .field(outcome_field("deletedIds", TypeRef::named_nn_list_nn(TypeRef::ID), |o| {
            FieldValue::list(o.deleted.iter().map(|id| FieldValue::value(id.clone())))
        }))
        .field(outcome_field("successCount", TypeRef::named_nn(TypeRef::INT), |o| {
            FieldValue::value(o.success_count as i64)
        }))
        .field(outcome_field("errorCount", TypeRef::named_nn(TypeRef::INT), |o| {
            FieldValue::value(o.error_count as i64)
        }))
        .field(errors_field())
}

/// `<Model>InvokePayload`: method invocations.
pub fn invoke_payload_type(entry: &ModelEntry) -> Object {
    Object::new(&entry.names.invoke_payload)
        .field(ok_field())
        .field(outcome_field("object", TypeRef::named(&entry.names.object), first_object))
        .field(outcome_field("result", TypeRef::named(scalars::JSON), |o| match &o.result {
            Some(result) => FieldValue::value(scalars::json_to_value(result)),
            None => FieldValue::NULL,
        }))
        .field(errors_field())
}
