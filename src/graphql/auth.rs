//! Request identity and the authorization extension point
//!
//! The engine does not authenticate anybody. Callers attach an [Identity] to
//! each request; every generated operation carries a capability tag and the
//! configured [Authorizer] decides whether the identity may run it.
//!
//! ```ignore
//! let engine = Engine::builder(catalog, store)
//!     .authorizer(Arc::new(CapabilityAuthorizer::default()))
//!     .build();
//! let identity = Identity::new("u-17").with_capability("catalog.view_product");
//! ```

use std::collections::BTreeSet;

use async_graphql::Context;
use serde::{Deserialize, Serialize};

use super::OperationDescriptor;

/// Who is making the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub superuser: bool,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn superuser(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            superuser: true,
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn has(&self, capability: &str) -> bool {
        self.superuser || self.capabilities.contains(capability)
    }

    /// Stable string used to key identity-scoped cache entries.
    pub fn fingerprint(&self) -> String {
        let caps: Vec<&str> = self.capabilities.iter().map(String::as_str).collect();
        format!("{}|{}|{}", self.id, self.superuser, caps.join(","))
    }
}

/// Permission hook consulted before every generated operation.
pub trait Authorizer: Send + Sync {
    fn allows(&self, identity: Option<&Identity>, operation: &OperationDescriptor) -> bool;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allows(&self, _identity: Option<&Identity>, _operation: &OperationDescriptor) -> bool {
        true
    }
}

/// Grants an operation when the identity holds its capability tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityAuthorizer {
    /// Let requests without an identity run read operations
    pub anonymous_reads: bool,
}

impl Authorizer for CapabilityAuthorizer {
    fn allows(&self, identity: Option<&Identity>, operation: &OperationDescriptor) -> bool {
        match identity {
            Some(identity) => identity.has(&operation.capability),
            None => self.anonymous_reads && operation.kind.is_read(),
        }
    }
}

/// Per-request data attached by `Engine::execute`.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub correlation_id: String,
    pub identity: Option<Identity>,
}

/// Extension trait to read request data from a resolver context
pub trait AuthExt {
    fn identity(&self) -> Option<&Identity>;

    fn correlation_id(&self) -> &str;
}

impl<'a> AuthExt for Context<'a> {
    fn identity(&self) -> Option<&Identity> {
        self.data_opt::<RequestMeta>()
            .and_then(|meta| meta.identity.as_ref())
    }

    fn correlation_id(&self) -> &str {
        self.data_opt::<RequestMeta>()
            .map(|meta| meta.correlation_id.as_str())
            .unwrap_or("-")
    }
}
