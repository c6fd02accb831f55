//! Raw model declarations as the host mapping layer states them.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Declarative description of one entity.
///
/// Attribute kinds stay raw strings here; classification into fields,
/// relationships and methods happens during introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub namespace: String,
    /// Storage table, defaults to `<namespace>_<name>` in snake case
    #[serde(default)]
    pub table: Option<String>,
    /// Override for the generated plural (list query) name
    #[serde(default)]
    pub plural: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    /// Parent model references (`"ns.Name"` or `"Name"`)
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,
    #[serde(default)]
    pub managers: Vec<ManagerDefinition>,
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    /// Default ordering tokens (`"name"`, `"-created_at"`)
    #[serde(default)]
    pub ordering: Vec<String>,
    /// Data writes to this model are treated as structural changes
    #[serde(default)]
    pub schema_relevant: bool,
}

impl ModelDefinition {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            table: None,
            plural: None,
            description: None,
            is_abstract: false,
            parents: Vec::new(),
            attributes: Vec::new(),
            managers: Vec::new(),
            unique_together: Vec::new(),
            ordering: Vec::new(),
            schema_relevant: false,
        }
    }

    pub fn attribute(mut self, attribute: AttributeDefinition) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn parent(mut self, reference: impl Into<String>) -> Self {
        self.parents.push(reference.into());
        self
    }

    pub fn manager(mut self, manager: ManagerDefinition) -> Self {
        self.managers.push(manager);
        self
    }

    pub fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn ordering(mut self, tokens: &[&str]) -> Self {
        self.ordering = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn unique_together(mut self, columns: &[&str]) -> Self {
        self.unique_together
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn schema_relevant(mut self) -> Self {
        self.schema_relevant = true;
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// One declared attribute.
///
/// `type_name` carries the host kind: scalar kinds (`string`, `integer`,
/// `datetime`, ...), relationship kinds (`foreign_key`, `one_to_one`,
/// `many_to_many`) or callable kinds (`method`, `property`). Options that do
/// not apply to the kind are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub null: bool,
    #[serde(default)]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub db_index: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub validators: Vec<ValidatorDefinition>,
    #[serde(default)]
    pub help_text: Option<String>,
    /// Storage column override (defaults to `name`, or `<name>_id` for foreign keys)
    #[serde(default)]
    pub column: Option<String>,

    #[serde(default)]
    pub target: Option<String>,
    /// Reverse accessor name on the target; `"+"` suppresses the reverse side
    #[serde(default)]
    pub related_name: Option<String>,
    #[serde(default)]
    pub on_delete: Option<OnDelete>,
    /// Join table for many-to-many (defaults to `<table>_<name>`)
    #[serde(default)]
    pub through: Option<String>,

    /// Declared return kind for methods and properties
    #[serde(default)]
    pub returns: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamDefinition>,
    #[serde(default)]
    pub mutating: bool,
    #[serde(default)]
    pub invokable: bool,
}

fn default_true() -> bool {
    true
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            null: false,
            default: None,
            unique: false,
            db_index: false,
            primary_key: false,
            editable: true,
            choices: Vec::new(),
            max_length: None,
            min_value: None,
            max_value: None,
            validators: Vec::new(),
            help_text: None,
            column: None,
            target: None,
            related_name: None,
            on_delete: None,
            through: None,
            returns: None,
            params: Vec::new(),
            mutating: false,
            invokable: false,
        }
    }

    pub fn field(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(name, type_name)
    }

    pub fn foreign_key(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut attr = Self::new(name, "foreign_key");
        attr.target = Some(target.into());
        attr.on_delete = Some(OnDelete::Cascade);
        attr
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut attr = Self::new(name, "many_to_many");
        attr.target = Some(target.into());
        attr
    }

    pub fn method(name: impl Into<String>, returns: impl Into<String>) -> Self {
        let mut attr = Self::new(name, "method");
        attr.returns = Some(returns.into());
        attr
    }

    pub fn property(name: impl Into<String>, returns: impl Into<String>) -> Self {
        let mut attr = Self::new(name, "property");
        attr.returns = Some(returns.into());
        attr
    }

    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.db_index = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.editable = false;
        self
    }

    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default = Some(DefaultValue::Value(value));
        self
    }

    pub fn computed_default(mut self, generator: impl Into<String>) -> Self {
        self.default = Some(DefaultValue::Computed {
            computed: generator.into(),
        });
        self
    }

    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    pub fn choices(mut self, values: &[&str]) -> Self {
        self.choices = values.iter().map(|v| Choice::new(*v)).collect();
        self
    }

    pub fn validator(mut self, validator: ValidatorDefinition) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    pub fn on_delete(mut self, behaviour: OnDelete) -> Self {
        self.on_delete = Some(behaviour);
        self
    }

    pub fn param(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.params.push(ParamDefinition {
            name: name.into(),
            type_name: type_name.into(),
            required: true,
        });
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn invokable(mut self) -> Self {
        self.invokable = true;
        self
    }

    pub fn help_text(mut self, text: impl Into<String>) -> Self {
        self.help_text = Some(text.into());
        self
    }
}

/// Default applied on create when the input omits the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    /// Generated at write time: `now`, `today` or `uuid`
    Computed { computed: String },
    Value(JsonValue),
}

/// One allowed value of an enumeration field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "ChoiceRepr")]
pub struct Choice {
    pub value: String,
    pub label: Option<String>,
}

impl Choice {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChoiceRepr {
    Bare(String),
    Labelled { value: String, label: Option<String> },
}

impl From<ChoiceRepr> for Choice {
    fn from(repr: ChoiceRepr) -> Self {
        match repr {
            ChoiceRepr::Bare(value) => Choice { value, label: None },
            ChoiceRepr::Labelled { value, label } => Choice { value, label },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatorDefinition {
    Regex {
        pattern: String,
        #[serde(default)]
        message: Option<String>,
    },
    Email,
    Url,
    MinLength {
        value: u32,
    },
    MaxLength {
        value: u32,
    },
    MinValue {
        value: f64,
    },
    MaxValue {
        value: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    SetNull,
    SetDefault,
    Protect,
    Restrict,
    DoNothing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
}

/// A named read scope over a model's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerDefinition {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    /// Filter tree (same shape as the generated filter input) restricting the scope
    #[serde(default)]
    pub scope: Option<JsonValue>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ManagerDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: false,
            scope: None,
            description: None,
        }
    }

    pub fn default_manager(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn scope(mut self, filter: JsonValue) -> Self {
        self.scope = Some(filter);
        self
    }
}

/// Implemented by `#[derive(Model)]`.
pub trait DescribeModel {
    fn model_definition() -> ModelDefinition;
}
