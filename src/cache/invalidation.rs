//! Structure-change detection.
//!
//! Decides whether a change reported by the persistence layer alters model
//! shape (and must invalidate metadata) or only touches business rows.

use serde::{Deserialize, Serialize};

use crate::models::ModelKey;

/// Context the change was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    Migration,
    SchemaEditor,
    DataMutation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    ModelCreated,
    ModelDeleted,
    FieldAdded,
    FieldRemoved,
    FieldAltered,
    RelationshipChanged,
    RowCreated,
    RowUpdated,
    RowDeleted,
}

impl ChangeKind {
    pub fn alters_shape(&self) -> bool {
        !matches!(
            self,
            ChangeKind::RowCreated | ChangeKind::RowUpdated | ChangeKind::RowDeleted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub model: ModelKey,
    pub origin: ChangeOrigin,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(model: ModelKey, origin: ChangeOrigin, kind: ChangeKind) -> Self {
        Self { model, origin, kind }
    }

    pub fn row_written(model: ModelKey, kind: ChangeKind) -> Self {
        Self::new(model, ChangeOrigin::DataMutation, kind)
    }
}

/// Receives change events reported by generated mutations.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, event: ChangeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    /// Model shape changed: drop metadata and rebuild dependent schemas
    Structural,
    /// Business data only: drop the model's cached metadata, schemas stay
    DataInvalidating,
    /// Business data only: nothing to do
    Data,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StructureChangeDetector {
    invalidate_on_data_write: bool,
}

impl StructureChangeDetector {
    /// `invalidate_on_data_write` switches on the broad policy where every row
    /// write drops the owning model's cached metadata.
    pub fn new(invalidate_on_data_write: bool) -> Self {
        Self {
            invalidate_on_data_write,
        }
    }

    /// `schema_relevant` is the owning model's opt-in flag.
    pub fn classify(&self, event: &ChangeEvent, schema_relevant: bool) -> ChangeClass {
        let schema_context = matches!(
            event.origin,
            ChangeOrigin::Migration | ChangeOrigin::SchemaEditor
        );
        if schema_context || event.kind.alters_shape() || schema_relevant {
            ChangeClass::Structural
        } else if self.invalidate_on_data_write {
            ChangeClass::DataInvalidating
        } else {
            ChangeClass::Data
        }
    }
}
