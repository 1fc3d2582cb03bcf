//! Temporal and status filtering.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::debug;

use crate::document::{Document, parse_timestamp};
use crate::error::ExportResult;

/// The export window: `(since, transaction_time]` plus an optional type allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportWindow {
    /// Exclusive lower bound. Documents updated exactly at `since` were
    /// exported by the previous run.
    pub since: DateTime<Utc>,
    /// Inclusive upper bound, the snapshot point of the run.
    pub transaction_time: DateTime<Utc>,
    /// Allowed resource types. `None` allows every type.
    pub types: Option<BTreeSet<String>>,
}

impl ExportWindow {
    /// Creates a window from the run's string parameters.
    pub fn parse(since: &str, transaction_time: &str) -> ExportResult<Self> {
        Ok(Self {
            since: parse_timestamp("since", since)?,
            transaction_time: parse_timestamp("transactionTime", transaction_time)?,
            types: None,
        })
    }

    /// Restricts the window to the given resource types.
    ///
    /// An empty list leaves the window unrestricted.
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: BTreeSet<String> = types.into_iter().map(Into::into).collect();
        self.types = (!types.is_empty()).then_some(types);
        self
    }

    /// Returns a copy of the window without the type allow-list.
    pub fn without_types(&self) -> Self {
        Self {
            types: None,
            ..self.clone()
        }
    }

    /// Returns true if the timestamp falls within `(since, transaction_time]`.
    pub fn contains_time(&self, ts: &DateTime<Utc>) -> bool {
        *ts > self.since && *ts <= self.transaction_time
    }

    /// Returns true if the resource type passes the allow-list.
    pub fn allows_type(&self, resource_type: &str) -> bool {
        self.types
            .as_ref()
            .is_none_or(|types| types.contains(resource_type))
    }

    /// Tests one document.
    ///
    /// A malformed `meta.lastUpdated` is an error, not a rejection.
    pub fn matches(&self, document: &Document) -> ExportResult<bool> {
        let last_updated = document.last_updated()?;
        Ok(self.contains_time(&last_updated)
            && document.status().is_some_and(|s| s.is_exportable())
            && self.allows_type(document.resource_type()))
    }

    /// Applies the window to a collection.
    ///
    /// Fails on the first document whose timestamp cannot be parsed.
    pub fn apply(&self, documents: Vec<Document>) -> ExportResult<Vec<Document>> {
        let total = documents.len();
        let flagged: Vec<(Document, bool)> = documents
            .into_par_iter()
            .map(|document| {
                let keep = self.matches(&document)?;
                Ok((document, keep))
            })
            .collect::<ExportResult<_>>()?;

        let kept: Vec<Document> = flagged
            .into_iter()
            .filter_map(|(document, keep)| keep.then_some(document))
            .collect();
        debug!(total, kept = kept.len(), "Applied export window");
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExportError, ParseError};
    use serde_json::json;

    fn doc(resource_type: &str, id: &str, status: &str, last_updated: &str) -> Document {
        Document::from_value(json!({
            "resourceType": resource_type,
            "id": id,
            "documentStatus": status,
            "meta": {"lastUpdated": last_updated}
        }))
        .unwrap()
    }

    fn window() -> ExportWindow {
        ExportWindow::parse("2024-01-01T00:00:00.000000Z", "2024-02-01T00:00:00.000000Z").unwrap()
    }

    #[test]
    fn test_bounds() {
        let w = window();
        let at_since = doc("Patient", "1", "AVAILABLE", "2024-01-01T00:00:00.000Z");
        let inside = doc("Patient", "2", "AVAILABLE", "2024-01-15T00:00:00.000Z");
        let at_tx = doc("Patient", "3", "AVAILABLE", "2024-02-01T00:00:00.000Z");
        let after = doc("Patient", "4", "AVAILABLE", "2024-02-01T00:00:00.001Z");

        assert!(!w.matches(&at_since).unwrap());
        assert!(w.matches(&inside).unwrap());
        assert!(w.matches(&at_tx).unwrap());
        assert!(!w.matches(&after).unwrap());
    }

    #[test]
    fn test_status() {
        let w = window();
        for (status, expected) in [
            ("AVAILABLE", true),
            ("LOCKED", true),
            ("PENDING_DELETE", true),
            ("PENDING", false),
            ("DELETED", false),
            ("SOMETHING_ELSE", false),
        ] {
            let d = doc("Patient", "1", status, "2024-01-15T00:00:00.000Z");
            assert_eq!(w.matches(&d).unwrap(), expected, "status {status}");
        }
    }

    #[test]
    fn test_type_list() {
        let w = window().with_types(["Patient", "Observation"]);
        let patient = doc("Patient", "1", "AVAILABLE", "2024-01-15T00:00:00.000Z");
        let encounter = doc("Encounter", "2", "AVAILABLE", "2024-01-15T00:00:00.000Z");
        assert!(w.matches(&patient).unwrap());
        assert!(!w.matches(&encounter).unwrap());

        assert!(w.without_types().matches(&encounter).unwrap());
        assert!(window().with_types(Vec::<String>::new()).types.is_none());
    }

    #[test]
    fn test_bad_timestamp_fails_whole_run() {
        let docs = vec![
            doc("Patient", "1", "AVAILABLE", "2024-01-15T00:00:00.000Z"),
            doc("Patient", "2", "AVAILABLE", "15/01/2024"),
        ];
        let err = window().apply(docs).unwrap_err();
        assert!(matches!(err, ExportError::Parse(ParseError::InvalidTimestamp { .. })));
    }

    #[test]
    fn test_bad_run_parameter() {
        assert!(ExportWindow::parse("2024-01-01", "2024-02-01T00:00:00.000Z").is_err());
    }

    #[test]
    fn test_apply_keeps_order() {
        let docs = vec![
            doc("Patient", "1", "AVAILABLE", "2024-01-15T00:00:00.000Z"),
            doc("Patient", "2", "DELETED", "2024-01-15T00:00:00.000Z"),
            doc("Patient", "3", "AVAILABLE", "2024-01-16T00:00:00.000Z"),
        ];
        let ids: Vec<String> = window()
            .apply(docs)
            .unwrap()
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
    }
}
