//! Tenant scoping for multi-tenant snapshots.
//!
//! In a multi-tenant document store every document carries the owning tenant
//! in `_tenantId`, and its `id` is stored as `{tenantId}|{id}` with the
//! canonical id kept in `_id`. References between documents are always written
//! in canonical form, so ids must be restored before any reference comparison.

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

/// Attribute holding the owning tenant.
pub const TENANT_ID_FIELD: &str = "_tenantId";

/// Attribute holding the canonical (tenant-local) id.
pub const CANONICAL_ID_FIELD: &str = "_id";

/// Separator between tenant and id in stored multi-tenant ids.
pub const TENANT_ID_SEPARATOR: char = '|';

/// An opaque tenant identifier.
///
/// # Examples
///
/// ```
/// use helios_bulk_export::tenant::TenantId;
///
/// let tenant = TenantId::new("t1");
/// assert_eq!(tenant.as_str(), "t1");
/// assert_eq!(tenant.key_prefix(), "t1/");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new tenant ID from the given string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the object-key prefix for this tenant's output (`{tenantId}/`).
    pub fn key_prefix(&self) -> String {
        format!("{}/", self.0.trim_matches('/'))
    }

    /// Restores the canonical id of a document stored for this tenant.
    ///
    /// Prefers the `_id` attribute; otherwise strips the `{tenantId}|` prefix.
    /// An id without the prefix is returned unchanged.
    pub fn canonical_id<'a>(&self, document: &'a Document) -> &'a str {
        if let Some(id) = document.str_attr(CANONICAL_ID_FIELD) {
            return id;
        }
        let stored = document.id();
        stored
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix(TENANT_ID_SEPARATOR))
            .unwrap_or(stored)
    }

    /// Returns true if the document belongs to this tenant.
    pub fn owns(&self, document: &Document) -> bool {
        document.str_attr(TENANT_ID_FIELD) == Some(self.0.as_str())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({})", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId::new(s)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Isolates one tenant's documents from a snapshot.
///
/// Without a tenant the snapshot passes through unchanged. With a tenant, only
/// the tenant's documents are kept, each with its canonical id restored into
/// `id` and the stored `_id` copy removed. An
/// empty result is valid and means there is nothing to export.
pub fn scope_to_tenant(documents: Vec<Document>, tenant: Option<&TenantId>) -> Vec<Document> {
    let Some(tenant) = tenant else {
        return documents;
    };

    documents
        .into_par_iter()
        .filter(|document| tenant.owns(document))
        .map(|document| {
            let id = tenant.canonical_id(&document).to_string();
            let restored = document.with_attr("id", Value::String(id));
            // A string `_id` is the stored canonical id; an object is the
            // resource's own extension on `id` and stays.
            if restored.str_attr(CANONICAL_ID_FIELD).is_some() {
                restored.without_attrs(&[CANONICAL_ID_FIELD])
            } else {
                restored
            }
        })
        .collect()
}
