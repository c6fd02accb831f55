//! Procedural macros for modelql
//!
//! - `#[derive(Model)]` - describe a struct as a model definition

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    Attribute, Data, DeriveInput, Expr, Fields, GenericArgument, Lit, LitStr, PathArguments, Type,
    parse_macro_input, spanned::Spanned,
};

/// Implement `modelql::models::DescribeModel` for a struct.
///
/// # Usage
///
/// ```ignore
/// /// Things we sell
/// #[derive(Model)]
/// #[model(namespace = "catalog", ordering = "name,-price")]
/// struct Product {
///     #[model(primary_key)]
///     id: i64,
///     #[model(max_length = 120)]
///     name: String,
///     price: rust_decimal::Decimal,
///     #[model(foreign_key = "Category", on_delete = "protect")]
///     category_id: i64,
///     #[model(choices = "draft,published")]
///     status: String,
///     note: Option<String>,
/// }
/// ```
///
/// Struct options: `namespace` (required), `name`, `table`, `plural`,
/// `ordering` (comma separated), `parents` (comma separated), `abstract`,
/// `schema_relevant`. Doc comments become the description.
///
/// Field options: `primary_key`, `unique`, `db_index`, `read_only`, `skip`,
/// `kind = "..."` (overrides the kind inferred from the Rust type),
/// `max_length`, `min_value`, `max_value`, `default`, `choices`, `column`,
/// `help_text`, and for relationships `foreign_key`, `one_to_one` or
/// `many_to_many` with `related_name`, `on_delete` and `through`.
/// `Option<T>` fields are nullable. A `foreign_key` field named `x_id` is
/// declared as relationship `x` stored in column `x_id`.
#[proc_macro_derive(Model, attributes(model))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Default)]
struct ModelOptions {
    namespace: Option<String>,
    name: Option<String>,
    table: Option<String>,
    plural: Option<String>,
    ordering: Vec<String>,
    parents: Vec<String>,
    is_abstract: bool,
    schema_relevant: bool,
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    primary_key: bool,
    unique: bool,
    db_index: bool,
    read_only: bool,
    kind: Option<String>,
    max_length: Option<u32>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    default: Option<Lit>,
    choices: Vec<String>,
    column: Option<String>,
    help_text: Option<String>,
    relation: Option<(&'static str, String)>,
    related_name: Option<String>,
    on_delete: Option<String>,
    through: Option<String>,
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn number(lit: &Lit) -> syn::Result<f64> {
    match lit {
        Lit::Int(i) => i.base10_parse::<f64>(),
        Lit::Float(f) => f.base10_parse::<f64>(),
        other => Err(syn::Error::new(other.span(), "expected a number")),
    }
}

fn docs(attrs: &[Attribute]) -> Option<String> {
    let lines: Vec<String> = attrs
        .iter()
        .filter(|a| a.path().is_ident("doc"))
        .filter_map(|a| match &a.meta {
            syn::Meta::NameValue(nv) => match &nv.value {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Str(s) => Some(s.value().trim().to_string()),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
        .collect();
    let text = lines.join(" ").trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn model_options(attrs: &[Attribute]) -> syn::Result<ModelOptions> {
    let mut opts = ModelOptions::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("model")) {
        attr.parse_nested_meta(|meta| {
            let string = |meta: &syn::meta::ParseNestedMeta| -> syn::Result<String> {
                Ok(meta.value()?.parse::<LitStr>()?.value())
            };
            if meta.path.is_ident("namespace") {
                opts.namespace = Some(string(&meta)?);
            } else if meta.path.is_ident("name") {
                opts.name = Some(string(&meta)?);
            } else if meta.path.is_ident("table") {
                opts.table = Some(string(&meta)?);
            } else if meta.path.is_ident("plural") {
                opts.plural = Some(string(&meta)?);
            } else if meta.path.is_ident("ordering") {
                opts.ordering = list(&string(&meta)?);
            } else if meta.path.is_ident("parents") {
                opts.parents = list(&string(&meta)?);
            } else if meta.path.is_ident("abstract") {
                opts.is_abstract = true;
            } else if meta.path.is_ident("schema_relevant") {
                opts.schema_relevant = true;
            } else {
                return Err(meta.error("unknown model option"));
            }
            Ok(())
        })?;
    }
    Ok(opts)
}

fn field_options(attrs: &[Attribute]) -> syn::Result<FieldOptions> {
    let mut opts = FieldOptions::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("model")) {
        attr.parse_nested_meta(|meta| {
            let string = |meta: &syn::meta::ParseNestedMeta| -> syn::Result<String> {
                Ok(meta.value()?.parse::<LitStr>()?.value())
            };
            let path = &meta.path;
            if path.is_ident("skip") {
                opts.skip = true;
            } else if path.is_ident("primary_key") {
                opts.primary_key = true;
            } else if path.is_ident("unique") {
                opts.unique = true;
            } else if path.is_ident("db_index") {
                opts.db_index = true;
            } else if path.is_ident("read_only") {
                opts.read_only = true;
            } else if path.is_ident("kind") {
                opts.kind = Some(string(&meta)?);
            } else if path.is_ident("max_length") {
                opts.max_length = Some(meta.value()?.parse::<syn::LitInt>()?.base10_parse()?);
            } else if path.is_ident("min_value") {
                opts.min_value = Some(number(&meta.value()?.parse::<Lit>()?)?);
            } else if path.is_ident("max_value") {
                opts.max_value = Some(number(&meta.value()?.parse::<Lit>()?)?);
            } else if path.is_ident("default") {
                opts.default = Some(meta.value()?.parse::<Lit>()?);
            } else if path.is_ident("choices") {
                opts.choices = list(&string(&meta)?);
            } else if path.is_ident("column") {
                opts.column = Some(string(&meta)?);
            } else if path.is_ident("help_text") {
                opts.help_text = Some(string(&meta)?);
            } else if path.is_ident("foreign_key") {
                opts.relation = Some(("foreign_key", string(&meta)?));
            } else if path.is_ident("one_to_one") {
                opts.relation = Some(("one_to_one", string(&meta)?));
            } else if path.is_ident("many_to_many") {
                opts.relation = Some(("many_to_many", string(&meta)?));
            } else if path.is_ident("related_name") {
                opts.related_name = Some(string(&meta)?);
            } else if path.is_ident("on_delete") {
                opts.on_delete = Some(string(&meta)?);
            } else if path.is_ident("through") {
                opts.through = Some(string(&meta)?);
            } else {
                return Err(meta.error("unknown field option"));
            }
            Ok(())
        })?;
    }
    Ok(opts)
}

/// `Option<T>` -> (`T`, true)
fn unwrap_option(ty: &Type) -> (&Type, bool) {
    if let Type::Path(path) = ty {
        if let Some(segment) = path.path.segments.last() {
            if segment.ident == "Option" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return (inner, true);
                    }
                }
            }
        }
    }
    (ty, false)
}

fn inferred_kind(ty: &Type, primary_key: bool) -> Option<&'static str> {
    let ident = match ty {
        Type::Path(path) => path.path.segments.last()?.ident.to_string(),
        Type::Reference(reference) => return inferred_kind(&reference.elem, primary_key),
        _ => return None,
    };
    Some(match ident.as_str() {
        "i8" | "i16" | "i32" | "i64" | "u8" | "u16" | "u32" | "u64" | "isize" | "usize" if primary_key => "auto",
        "i8" | "i16" | "i32" | "i64" | "u8" | "u16" | "u32" | "u64" | "isize" | "usize" => "integer",
        "f32" | "f64" => "float",
        "bool" => "boolean",
        "String" | "str" | "char" => "string",
        "Decimal" => "decimal",
        "NaiveDate" => "date",
        "NaiveTime" => "time",
        "DateTime" | "NaiveDateTime" => "datetime",
        "Uuid" => "uuid",
        "Value" | "JsonValue" => "json",
        _ => return None,
    })
}

fn on_delete_variant(value: &str, span: proc_macro2::Span) -> syn::Result<TokenStream2> {
    let variant = match value {
        "cascade" => "Cascade",
        "set_null" => "SetNull",
        "set_default" => "SetDefault",
        "protect" => "Protect",
        "restrict" => "Restrict",
        "do_nothing" => "DoNothing",
        other => {
            return Err(syn::Error::new(
                span,
                format!("unknown on_delete `{other}`, expected cascade, set_null, set_default, protect, restrict or do_nothing"),
            ));
        }
    };
    let variant = format_ident!("{}", variant);
    Ok(quote!(::modelql::models::OnDelete::#variant))
}

fn attribute(field: &syn::Field) -> syn::Result<Option<TokenStream2>> {
    let opts = field_options(&field.attrs)?;
    if opts.skip {
        return Ok(None);
    }
    let Some(ident) = &field.ident else {
        return Err(syn::Error::new(field.span(), "Model fields must be named"));
    };
    let rust_name = ident.to_string();
    let (inner, nullable) = unwrap_option(&field.ty);

    let mut name = rust_name.clone();
    let mut column = opts.column.clone();
    let type_name = match &opts.relation {
        Some(("foreign_key", _)) if rust_name.ends_with("_id") => {
            name = rust_name.trim_end_matches("_id").to_string();
            column.get_or_insert(rust_name.clone());
            "foreign_key".to_string()
        }
        Some((kind, _)) => kind.to_string(),
        None => match (&opts.kind, inferred_kind(inner, opts.primary_key)) {
            (Some(kind), _) => kind.clone(),
            (None, Some(kind)) => kind.to_string(),
            (None, None) => {
                return Err(syn::Error::new(
                    field.ty.span(),
                    "cannot infer the model kind of this type, add #[model(kind = \"...\")]",
                ));
            }
        },
    };

    let mut settings = Vec::new();
    if nullable {
        settings.push(quote!(attr.null = true;));
    }
    if opts.primary_key {
        settings.push(quote!(attr.primary_key = true;));
    }
    if opts.unique {
        settings.push(quote!(attr.unique = true;));
    }
    if opts.db_index {
        settings.push(quote!(attr.db_index = true;));
    }
    if opts.read_only {
        settings.push(quote!(attr.editable = false;));
    }
    if let Some(max) = opts.max_length {
        settings.push(quote!(attr.max_length = Some(#max);));
    }
    if let Some(min) = opts.min_value {
        settings.push(quote!(attr.min_value = Some(#min);));
    }
    if let Some(max) = opts.max_value {
        settings.push(quote!(attr.max_value = Some(#max);));
    }
    if let Some(lit) = &opts.default {
        settings.push(quote!(
            attr.default = Some(::modelql::models::DefaultValue::Value(::core::convert::Into::into(#lit)));
        ));
    }
    if !opts.choices.is_empty() {
        let choices = &opts.choices;
        settings.push(quote!(
            attr.choices = vec![#(::modelql::models::Choice::new(#choices)),*];
        ));
    }
    if let Some(column) = &column {
        settings.push(quote!(attr.column = Some(#column.to_string());));
    }
    if let Some(text) = opts.help_text.clone().or_else(|| docs(&field.attrs)) {
        settings.push(quote!(attr.help_text = Some(#text.to_string());));
    }
    if let Some((_, target)) = &opts.relation {
        settings.push(quote!(attr.target = Some(#target.to_string());));
    }
    if let Some(related) = &opts.related_name {
        settings.push(quote!(attr.related_name = Some(#related.to_string());));
    }
    if let Some(on_delete) = &opts.on_delete {
        let variant = on_delete_variant(on_delete, field.span())?;
        settings.push(quote!(attr.on_delete = Some(#variant);));
    } else if matches!(opts.relation, Some(("foreign_key" | "one_to_one", _))) {
        settings.push(quote!(attr.on_delete = Some(::modelql::models::OnDelete::Cascade);));
    }
    if let Some(through) = &opts.through {
        settings.push(quote!(attr.through = Some(#through.to_string());));
    }

    Ok(Some(quote! {
        def.attributes.push({
            let mut attr = ::modelql::models::AttributeDefinition::new(#name, #type_name);
            #(#settings)*
            attr
        });
    }))
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let opts = model_options(&input.attrs)?;
    let ident = &input.ident;
    let Some(namespace) = opts.namespace.clone() else {
        return Err(syn::Error::new(
            ident.span(),
            "#[derive(Model)] needs #[model(namespace = \"...\")]",
        ));
    };
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => return Err(syn::Error::new(ident.span(), "Model can only be derived for structs with named fields")),
        },
        _ => return Err(syn::Error::new(ident.span(), "Model can only be derived for structs")),
    };

    let name = opts.name.clone().unwrap_or_else(|| ident.to_string());
    let mut meta = Vec::new();
    if let Some(table) = &opts.table {
        meta.push(quote!(def.table = Some(#table.to_string());));
    }
    if let Some(plural) = &opts.plural {
        meta.push(quote!(def.plural = Some(#plural.to_string());));
    }
    if let Some(text) = docs(&input.attrs) {
        meta.push(quote!(def.description = Some(#text.to_string());));
    }
    if opts.is_abstract {
        meta.push(quote!(def.is_abstract = true;));
    }
    if opts.schema_relevant {
        meta.push(quote!(def.schema_relevant = true;));
    }
    let ordering = &opts.ordering;
    let parents = &opts.parents;

    let mut attributes = Vec::new();
    for field in fields {
        if let Some(tokens) = attribute(field)? {
            attributes.push(tokens);
        }
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::modelql::models::DescribeModel for #ident #ty_generics #where_clause {
            fn model_definition() -> ::modelql::models::ModelDefinition {
                let mut def = ::modelql::models::ModelDefinition::new(#namespace, #name);
                #(#meta)*
                def.ordering = vec![#(#ordering.to_string()),*];
                def.parents = vec![#(#parents.to_string()),*];
                #(#attributes)*
                def
            }
        }
    })
}
