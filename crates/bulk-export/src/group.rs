//! Group membership resolution.
//!
//! A group export starts from the `Group` document. Only the member list of the
//! latest version of that document is authoritative; the latest version is
//! chosen with an explicit [`VersionOrdering`], and among versions that compare
//! equal the one seen last in the snapshot wins.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::document::{Document, VersionOrdering, parse_timestamp};
use crate::error::{ExportResult, LookupError};
use crate::reference::{ResourceKey, ServerBase};

/// Resource type of group documents.
pub const GROUP_RESOURCE_TYPE: &str = "Group";

/// Default resource type the compartment model is anchored on.
pub const DEFAULT_SUBJECT_TYPE: &str = "Patient";

/// The resolved membership of a group as of the transaction time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMembership {
    /// Every active internal member.
    pub members: BTreeSet<ResourceKey>,
    /// Active members whose type is the subject type.
    pub patients: BTreeSet<ResourceKey>,
}

impl GroupMembership {
    /// Returns true if the key is an active member.
    pub fn is_member(&self, key: &ResourceKey) -> bool {
        self.members.contains(key)
    }

    /// Returns true if the key is an active subject member.
    pub fn is_patient(&self, key: &ResourceKey) -> bool {
        self.patients.contains(key)
    }
}

/// Resolves the active members of groups.
#[derive(Debug, Clone)]
pub struct GroupResolver {
    server: ServerBase,
    ordering: VersionOrdering,
    subject_type: String,
}

impl GroupResolver {
    /// Creates a resolver.
    pub fn new(server: ServerBase, ordering: VersionOrdering) -> Self {
        Self {
            server,
            ordering,
            subject_type: DEFAULT_SUBJECT_TYPE.to_string(),
        }
    }

    /// Sets the subject type the patient set is built from.
    pub fn with_subject_type(mut self, subject_type: impl Into<String>) -> Self {
        self.subject_type = subject_type.into();
        self
    }

    /// Finds the latest version of the group with the given id.
    pub fn latest_group<'a>(&self, documents: &'a [Document], group_id: &str) -> Option<&'a Document> {
        documents
            .iter()
            .filter(|d| d.resource_type() == GROUP_RESOURCE_TYPE && d.id() == group_id)
            .fold(None, |best: Option<&Document>, candidate| match best {
                Some(current)
                    if self
                        .ordering
                        .compare(
                            candidate.version_id().as_deref(),
                            current.version_id().as_deref(),
                        )
                        .is_lt() =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            })
    }

    /// Resolves the active membership of `group_id` as of `transaction_time`.
    ///
    /// Fails with [`LookupError::GroupNotFound`] when no group document with that
    /// id is among `documents`.
    pub fn resolve(
        &self,
        documents: &[Document],
        group_id: &str,
        transaction_time: &DateTime<Utc>,
    ) -> ExportResult<GroupMembership> {
        let group = self
            .latest_group(documents, group_id)
            .ok_or_else(|| LookupError::GroupNotFound {
                group_id: group_id.to_string(),
            })?;

        let mut membership = GroupMembership::default();
        let members = group.get("member").and_then(Value::as_array);
        for member in members.into_iter().flatten() {
            if !is_active_member(member, transaction_time)? {
                continue;
            }
            let Some(reference) = member
                .get("entity")
                .and_then(|e| e.get("reference"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let Some(key) = self.server.internal_target(reference) else {
                warn!(group_id, reference, "Skipping non-internal group member");
                continue;
            };
            if key.resource_type == self.subject_type {
                membership.patients.insert(key.clone());
            }
            membership.members.insert(key);
        }

        info!(
            group_id,
            version = %group.version_id().unwrap_or_default(),
            members = membership.members.len(),
            patients = membership.patients.len(),
            "Resolved group membership"
        );
        Ok(membership)
    }
}

/// A member is active unless it is flagged inactive or its period ended before
/// the transaction time. A period ending exactly at the transaction time is
/// still active.
pub fn is_active_member(member: &Value, transaction_time: &DateTime<Utc>) -> ExportResult<bool> {
    if member.get("inactive").and_then(Value::as_bool) == Some(true) {
        return Ok(false);
    }
    match member
        .get("period")
        .and_then(|p| p.get("end"))
        .and_then(Value::as_str)
    {
        Some(end) => Ok(parse_timestamp("member.period.end", end)? >= *transaction_time),
        None => Ok(true),
    }
}
