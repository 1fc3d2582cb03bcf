//! Error types for the bulk export engine.
//!
//! Every fatal condition of an export run maps to one variant of [`ExportError`].
//! Errors are grouped by category so callers can decide how to report a failed
//! job without inspecting messages:
//!
//! - [`ConfigError`] - invalid run parameters, raised before any read
//! - [`ParseError`] - timestamps or snapshot lines that break the schema contract
//! - [`LookupError`] - the requested group does not exist
//! - [`ObjectStoreError`] - failures reported by the object-store client
//! - [`OutputError`] - failures while emitting or renaming output objects

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ExportResult<T> = Result<T, ExportError>;

/// The primary error type for an export run.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Invalid or missing run configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Schema contract violations in inputs
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Missing entities that the run depends on
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// Object-store client failures
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    /// Output emission failures
    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Errors in the run parameters or externally supplied configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("worker type {worker_type} not supported, choose either G.1X or G.2X")]
    UnsupportedWorkerType { worker_type: String },

    #[error("number of workers must be at least 2 and yield a split count that fits in u32, got {number_workers}")]
    InvalidWorkerCount { number_workers: u32 },

    #[error("missing required run parameter: {parameter}")]
    MissingParameter { parameter: String },

    #[error("unsupported output format: {format}")]
    UnsupportedFormat { format: String },

    #[error("invalid ruleset {name}: {message}")]
    InvalidRuleset { name: String, message: String },

    #[error("invalid configuration: {}", .errors.join("; "))]
    Invalid { errors: Vec<String> },
}

/// Errors raised when inputs do not honour the expected schema.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid timestamp for {field}: '{value}' (expected YYYY-MM-DDTHH:MM:SS.ffffffZ)")]
    InvalidTimestamp { field: String, value: String },

    #[error("document {resource_type}/{id} has no meta.lastUpdated")]
    MissingLastUpdated { resource_type: String, id: String },

    #[error("invalid snapshot line {line} in {key}: {message}")]
    InvalidSnapshotLine {
        key: String,
        line: usize,
        message: String,
    },
}

/// Errors raised when an entity required by the run is absent.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("group not found: {group_id}")]
    GroupNotFound { group_id: String },
}

/// Errors reported by the object-store client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("precondition failed for {bucket}/{key}")]
    PreconditionFailed { bucket: String, key: String },

    #[error("object store throttled: {0}")]
    Throttled(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid object store input: {0}")]
    InvalidInput(String),

    #[error("object store internal error: {0}")]
    Internal(String),
}

/// Errors while writing or renaming output objects.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("shard key does not match the output naming scheme: {key}")]
    UnrecognizedShard { key: String },

    #[error("failed to serialize output line: {message}")]
    Serialization { message: String },

    #[error("invalid shard key pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ExportError {
    /// Returns true if the error was raised before any data was read.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if the run failed because the requested group is missing.
    pub fn is_group_not_found(&self) -> bool {
        matches!(self, Self::Lookup(LookupError::GroupNotFound { .. }))
    }
}
