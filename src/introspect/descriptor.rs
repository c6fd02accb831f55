//! Immutable descriptors produced by introspection.

use serde_json::Value as JsonValue;

use crate::models::{Choice, DefaultValue, ModelKey, OnDelete, ValidatorDefinition};
use crate::store::{Join, ValueClass};

/// Introspected shape of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub key: ModelKey,
    pub table: String,
    /// Name of the primary key field (equal to its column)
    pub primary_key: String,
    pub description: Option<String>,
    pub plural: Option<String>,
    /// Declaration order, inherited members first
    pub members: Vec<Member>,
    pub inheritance: Inheritance,
    pub unique_together: Vec<Vec<String>>,
    pub ordering: Vec<String>,
    pub accessors: Vec<AccessorDescriptor>,
    /// Relationship targets that did not resolve when this descriptor was built
    pub unresolved: Vec<UnresolvedTarget>,
    pub schema_relevant: bool,
    /// Attributes dropped or degraded during classification
    pub warnings: Vec<String>,
}

impl ModelDescriptor {
    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.members.iter().filter_map(|m| match m {
            Member::Field(f) => Some(f),
            _ => None,
        })
    }

    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipDescriptor> {
        self.members.iter().filter_map(|m| match m {
            Member::Relationship(r) => Some(r),
            _ => None,
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.members.iter().filter_map(|m| match m {
            Member::Method(m) => Some(m),
            _ => None,
        })
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name() == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships().find(|r| r.name == name)
    }

    pub fn primary_field(&self) -> Option<&FieldDescriptor> {
        self.field(&self.primary_key)
    }

    pub fn default_accessor(&self) -> Option<&AccessorDescriptor> {
        self.accessors.iter().find(|a| a.is_default)
    }

    /// Storage column for an orderable member name (fields and forward to-one relations).
    pub fn order_column(&self, name: &str) -> Option<&str> {
        match self.member(name)? {
            Member::Field(f) => Some(f.column.as_str()),
            Member::Relationship(r) => r.column.as_deref(),
            Member::Method(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Inheritance {
    pub is_abstract: bool,
    /// Nearest parent first
    pub ancestors: Vec<ModelKey>,
    pub children: Vec<ModelKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedTarget {
    pub member: String,
    pub reference: String,
}

/// A member of a model, matched exhaustively by the synthesizers.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Field(FieldDescriptor),
    Relationship(RelationshipDescriptor),
    Method(MethodDescriptor),
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Member::Field(f) => &f.name,
            Member::Relationship(r) => &r.name,
            Member::Method(m) => &m.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Time,
    Decimal,
    Enumeration(Vec<Choice>),
    Identifier,
    Uuid,
    Json,
    /// Unrecognised host kind, exposed as JSON
    Other(String),
}

impl FieldKind {
    pub fn value_class(&self) -> ValueClass {
        match self {
            FieldKind::Integer | FieldKind::Float => ValueClass::Number,
            FieldKind::Decimal => ValueClass::Decimal,
            FieldKind::Boolean => ValueClass::Boolean,
            FieldKind::Date | FieldKind::DateTime | FieldKind::Time => ValueClass::Temporal,
            FieldKind::Json | FieldKind::Other(_) => ValueClass::Json,
            FieldKind::Text | FieldKind::Enumeration(_) | FieldKind::Identifier | FieldKind::Uuid => {
                ValueClass::Text
            }
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, FieldKind::Text | FieldKind::Uuid | FieldKind::Identifier)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            FieldKind::Integer
                | FieldKind::Float
                | FieldKind::Decimal
                | FieldKind::Date
                | FieldKind::DateTime
                | FieldKind::Time
        )
    }

    /// Human readable kind used in validation messages.
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Text => "a string",
            FieldKind::Integer => "an integer",
            FieldKind::Float => "a number",
            FieldKind::Boolean => "a boolean",
            FieldKind::Date => "a date (YYYY-MM-DD)",
            FieldKind::DateTime => "an ISO-8601 datetime",
            FieldKind::Time => "a time (HH:MM[:SS])",
            FieldKind::Decimal => "a decimal",
            FieldKind::Enumeration(_) => "one of the declared choices",
            FieldKind::Identifier => "an identifier",
            FieldKind::Uuid => "a UUID",
            FieldKind::Json | FieldKind::Other(_) => "JSON",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub column: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    pub unique: bool,
    pub indexed: bool,
    pub primary_key: bool,
    /// Assigned by the store (auto-increment keys)
    pub auto: bool,
    pub editable: bool,
    pub validators: Vec<ValidatorDefinition>,
    pub max_length: Option<u32>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub help_text: Option<String>,
}

impl FieldDescriptor {
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Must be supplied by a create input.
    pub fn required_on_create(&self) -> bool {
        !self.nullable && self.default.is_none() && !self.auto && self.editable
    }

    /// Plain default value suitable for a GraphQL input default.
    pub fn static_default(&self) -> Option<&JsonValue> {
        match &self.default {
            Some(DefaultValue::Value(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    ToOne,
    ToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughTable {
    pub table: String,
    /// Column referencing the owning side's key
    pub source_column: String,
    /// Column referencing the target's key
    pub target_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub kind: RelationKind,
    pub direction: Direction,
    /// Best known target key; see `DescriptorArena::target` for lazy resolution
    pub target: ModelKey,
    /// Reference as declared, kept for retrying resolution
    pub reference: String,
    pub on_delete: OnDelete,
    /// Accessor name on the other side, `None` when suppressed
    pub related_name: Option<String>,
    /// Forward to-one: column on this model's table
    pub column: Option<String>,
    /// Reverse to-one/to-many: column on the target's table pointing back here
    pub remote_column: Option<String>,
    pub through: Option<ThroughTable>,
    pub nullable: bool,
    pub editable: bool,
    pub unique: bool,
    /// Declared default of the referencing column, used by `SET_DEFAULT`
    pub default: Option<DefaultValue>,
    pub help_text: Option<String>,
}

impl RelationshipDescriptor {
    pub fn is_list(&self) -> bool {
        matches!(self.kind, RelationKind::ToMany | RelationKind::ManyToMany)
    }

    /// Join from `owner` rows to `target` rows.
    pub fn join(&self, owner: &ModelDescriptor, target: &ModelDescriptor) -> Join {
        if let Some(through) = &self.through {
            return Join::Through {
                through: through.table.clone(),
                source_column: through.source_column.clone(),
                target_column: through.target_column.clone(),
                key: owner.primary_key.clone(),
                table: target.table.clone(),
                related_key: target.primary_key.clone(),
            };
        }
        match (&self.column, &self.remote_column) {
            (Some(column), _) => Join::Forward {
                column: column.clone(),
                table: target.table.clone(),
                related_key: target.primary_key.clone(),
            },
            (None, Some(remote)) => Join::Reverse {
                table: target.table.clone(),
                column: remote.clone(),
                key: owner.primary_key.clone(),
            },
            (None, None) => Join::Reverse {
                table: target.table.clone(),
                column: format!("{}_id", owner.key.name.to_lowercase()),
                key: owner.primary_key.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    /// Declared kind, or `Json` when the declaration names none
    pub returns: FieldKind,
    pub params: Vec<ParamDescriptor>,
    pub read_only: bool,
    pub property: bool,
    pub invokable: bool,
    pub help_text: Option<String>,
}

/// One named read scope (manager) of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessorDescriptor {
    pub name: String,
    pub is_default: bool,
    /// Filter tree restricting every read through this accessor
    pub scope: Option<JsonValue>,
    pub description: Option<String>,
}

impl AccessorDescriptor {
    /// Operation name suffix; empty for the default accessor.
    pub fn suffix(&self) -> Option<&str> {
        (!self.is_default).then_some(self.name.as_str())
    }
}
