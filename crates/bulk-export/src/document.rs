//! Snapshot document model.
//!
//! A [`Document`] is one item of the document-store snapshot: a FHIR resource
//! plus the bookkeeping attributes the store keeps next to it. The attribute
//! tree is held as a [`serde_json::Value`] map so that path-based extraction can
//! walk arbitrary shapes uniformly (see [`crate::reference::deep_get`]).
//!
//! Documents are never mutated in place by the filter stages; every stage
//! produces a derived collection.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{ExportResult, ParseError};

/// Timestamp format used by the document store (`2024-01-31T10:00:00.000000Z`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Attribute holding the lifecycle status of a document.
pub const DOCUMENT_STATUS_FIELD: &str = "documentStatus";

/// Lifecycle status of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    /// Current and readable.
    Available,
    /// Locked by an in-flight write; the stored body is still the last committed one.
    Locked,
    /// Being written; not yet committed.
    Pending,
    /// Marked for deletion but not yet removed.
    PendingDelete,
    /// Deleted.
    Deleted,
}

impl DocumentStatus {
    /// Returns true if documents in this state may be exported.
    pub fn is_exportable(&self) -> bool {
        matches!(self, Self::Available | Self::Locked | Self::PendingDelete)
    }

    /// Returns the stored representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Locked => "LOCKED",
            Self::Pending => "PENDING",
            Self::PendingDelete => "PENDING_DELETE",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "LOCKED" => Ok(Self::Locked),
            "PENDING" => Ok(Self::Pending),
            "PENDING_DELETE" => Ok(Self::PendingDelete),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(format!("unknown document status: {}", s)),
        }
    }
}

/// Parses a timestamp in the document store's format.
///
/// `field` names the parameter or attribute being parsed and is only used for
/// the error message.
pub fn parse_timestamp(field: &str, value: &str) -> ExportResult<DateTime<Utc>> {
    // chrono treats the fractional part as optional; the store never omits it.
    if !value.contains('.') {
        return Err(invalid_timestamp(field, value));
    }
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| invalid_timestamp(field, value))
}

/// Formats a timestamp in the document store's format with microsecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn invalid_timestamp(field: &str, value: &str) -> crate::error::ExportError {
    ParseError::InvalidTimestamp {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

/// One record of the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    body: Map<String, Value>,
}

impl Document {
    /// Wraps a JSON value. Returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(body) => Some(Self { body }),
            _ => None,
        }
    }

    /// Returns the document id as stored (possibly tenant-prefixed).
    pub fn id(&self) -> &str {
        self.str_attr("id").unwrap_or_default()
    }

    /// Returns the FHIR resource type.
    pub fn resource_type(&self) -> &str {
        self.str_attr("resourceType").unwrap_or_default()
    }

    /// Returns the lifecycle status, if present and recognized.
    pub fn status(&self) -> Option<DocumentStatus> {
        self.str_attr(DOCUMENT_STATUS_FIELD)?.parse().ok()
    }

    /// Returns the raw `meta.lastUpdated` string.
    pub fn last_updated_raw(&self) -> Option<&str> {
        self.body.get("meta")?.get("lastUpdated")?.as_str()
    }

    /// Parses `meta.lastUpdated`.
    ///
    /// A missing or malformed value is a fatal parse error: it means the
    /// upstream schema contract is broken.
    pub fn last_updated(&self) -> ExportResult<DateTime<Utc>> {
        let raw = self.last_updated_raw().ok_or_else(|| ParseError::MissingLastUpdated {
            resource_type: self.resource_type().to_string(),
            id: self.id().to_string(),
        })?;
        parse_timestamp("meta.lastUpdated", raw)
    }

    /// Returns the version identifier of this document.
    ///
    /// Prefers `meta.versionId`, falling back to the store's `vid` attribute.
    pub fn version_id(&self) -> Option<String> {
        if let Some(v) = self.body.get("meta").and_then(|m| m.get("versionId")) {
            if let Some(version) = scalar_to_string(v) {
                return Some(version);
            }
        }
        self.body.get("vid").and_then(scalar_to_string)
    }

    /// Returns the attribute with the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// Returns a string attribute.
    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.body.get(name).and_then(Value::as_str)
    }

    /// Returns the attribute tree as a JSON value.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Returns a copy with `name` set to `value`.
    pub fn with_attr(&self, name: &str, value: Value) -> Self {
        let mut body = self.body.clone();
        body.insert(name.to_string(), value);
        Self { body }
    }

    /// Returns a copy without the given attributes.
    pub fn without_attrs(&self, names: &[&str]) -> Self {
        let mut body = self.body.clone();
        for name in names {
            body.remove(*name);
        }
        Self { body }
    }

    /// Consumes the document and returns its attribute tree.
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(body: Map<String, Value>) -> Self {
        Self { body }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// How version identifiers are compared when picking the latest version of a
/// document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VersionOrdering {
    /// Compare as unsigned integers. Identifiers that do not parse sort before
    /// all numeric ones and are compared lexically among themselves.
    #[default]
    Numeric,
    /// Compare as plain strings.
    Lexical,
}

impl VersionOrdering {
    /// Total order over version identifiers. A missing identifier sorts first.
    pub fn compare(&self, a: Option<&str>, b: Option<&str>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => match self {
                Self::Lexical => a.cmp(b),
                Self::Numeric => match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Greater,
                    (Err(_), Ok(_)) => Ordering::Less,
                    (Err(_), Err(_)) => a.cmp(b),
                },
            },
        }
    }
}

impl fmt::Display for VersionOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric => write!(f, "numeric"),
            Self::Lexical => write!(f, "lexical"),
        }
    }
}
