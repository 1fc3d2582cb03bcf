//! # Helios Bulk Export
//!
//! The group-and-compartment export engine of the Helios FHIR Server.
//!
//! Given a point-in-time snapshot of the document store, an export run
//! selects the documents a bulk data request asks for and writes them as
//! NDJSON objects, one per resource type, under the job's prefix in an object
//! store.
//!
//! ## Pipeline
//!
//! ```text
//! snapshot ─► tenant scoping ─► export window ─┬─────────────────────────────► projection ─► shards ─► rename
//!                                              └─► group ─► compartment ─► transitive ─┘
//! ```
//!
//! - [`tenant`] isolates one tenant of a multi-tenant snapshot and restores
//!   canonical ids
//! - [`filter`] applies the `(since, transactionTime]` window and the
//!   exportable statuses
//! - [`group`] resolves the active members of the requested group
//! - [`compartment`] includes members and documents in a member's compartment
//! - [`transitive`] follows one further hop of configured references
//! - [`projection`] applies the type allow-list and strips bookkeeping fields
//! - [`output`] writes partitioned shards and renames them to their final keys
//!
//! The filter stages are pure functions over [`document::Document`] values
//! and run data-parallel. Object-store access goes through
//! [`store::ObjectStoreApi`]; an AWS S3 implementation is available behind the
//! `s3` feature and an in-memory one is always available.
//!
//! ## Example
//!
//! ```rust
//! use helios_bulk_export::filter::ExportWindow;
//! use helios_bulk_export::pipeline::ExportPlan;
//! use helios_bulk_export::document::Document;
//! use serde_json::json;
//!
//! let window = ExportWindow::parse("2024-01-01T00:00:00.000Z", "2024-02-01T00:00:00.000Z").unwrap();
//! let snapshot = vec![Document::from_value(json!({
//!     "resourceType": "Patient",
//!     "id": "p1",
//!     "documentStatus": "AVAILABLE",
//!     "meta": {"lastUpdated": "2024-01-15T00:00:00.000Z"}
//! }))
//! .unwrap()];
//!
//! let selected = ExportPlan::system(window).select(snapshot).unwrap();
//! assert_eq!(selected.len(), 1);
//! ```

#![warn(missing_docs)]

pub mod compartment;
pub mod config;
pub mod document;
pub mod error;
pub mod filter;
pub mod group;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod projection;
pub mod reference;
pub mod rulesets;
pub mod snapshot;
pub mod store;
pub mod tenant;
pub mod transitive;

pub use config::{ExportJobConfig, ExportType, FhirVersion};
pub use document::{Document, VersionOrdering};
pub use error::{ExportError, ExportResult};
pub use job::{ExportJob, ExportOutcome};
pub use pipeline::{ExportPlan, GroupScope};
pub use store::{MemoryObjectStore, ObjectStoreApi};
#[cfg(feature = "s3")]
pub use store::AwsS3Client;
pub use tenant::TenantId;

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("helios_bulk_export={},hfs_export={}", level, level))
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
