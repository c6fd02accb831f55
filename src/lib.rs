//! modelql: GraphQL schemas generated from declarative data models
//!
//! Models are described once (in code, YAML or with `#[derive(Model)]`),
//! introspected into descriptors and turned into executable async-graphql
//! schemas with filters, pagination, mutations and payload errors. The
//! [Engine] ties the catalog, metadata cache, schema registry and query
//! safety analyzer together.

extern crate self as modelql;

pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graphql;
pub mod introspect;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod safety;
pub mod schema;
pub mod store;

pub use engine::{Engine, EngineBuilder, HealthSnapshot, MetricsSnapshot};
pub use error::{EngineError, Result};
pub use graphql::{AllowAll, Authorizer, CapabilityAuthorizer, Identity};
pub use modelql_macros::Model;
pub use schema::{SchemaRegistry, SchemaSettings, SchemaSpec};
