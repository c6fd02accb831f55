//! Schema specs, assembly and the process-wide registry.

mod assembler;
mod discovery;
mod registry;
mod spec;

pub use assembler::{BuiltSchema, SchemaAssembler, TypeInventory};
pub use discovery::{DiscoveryReport, DiscoveryService};
pub use registry::{RegistrySnapshot, SchemaEntry, SchemaRegistry, SchemaSummary};
pub use spec::{SchemaSettings, SchemaSpec, SchemaUpdate, load_specs};
