//! The export filter pipeline.
//!
//! Stages run in this order:
//!
//! 1. tenant scoping
//! 2. export window (time bounds, status and the type allow-list)
//! 3. group membership resolution (group exports only)
//! 4. compartment inclusion (group exports only)
//! 5. transitive closure, re-running 4 once with the extracted targets (group exports only)
//! 6. de-duplication and field projection
//!
//! Stages 4 and 5 read the output of stage 2, so a document of an excluded
//! type never contributes transitive targets. Stage 3 looks the group up in the
//! window without the type allow-list, since `Group` is rarely a requested
//! type. The pipeline is synchronous and pure: it never touches the object
//! store.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::compartment::{CompartmentEngine, CompartmentRuleset};
use crate::document::{Document, VersionOrdering};
use crate::error::ExportResult;
use crate::filter::ExportWindow;
use crate::group::{DEFAULT_SUBJECT_TYPE, GroupResolver};
use crate::projection::project_all;
use crate::reference::ServerBase;
use crate::tenant::{TenantId, scope_to_tenant};
use crate::transitive::{ClosurePass, TransitiveRuleset, run_closure};

/// Group-export parameters.
#[derive(Debug, Clone)]
pub struct GroupScope {
    /// Id of the group document.
    pub group_id: String,
    /// Base URL of the export server.
    pub server: ServerBase,
    /// Compartment inclusion rules.
    pub compartment: CompartmentRuleset,
    /// Transitive extraction rules.
    pub transitive: TransitiveRuleset,
    /// Ordering used to pick the latest group version.
    pub version_ordering: VersionOrdering,
    /// Resource type the compartment is anchored on.
    pub subject_type: String,
}

impl GroupScope {
    /// Creates group parameters with the default subject type and numeric
    /// version ordering.
    pub fn new(
        group_id: impl Into<String>,
        server: ServerBase,
        compartment: CompartmentRuleset,
        transitive: TransitiveRuleset,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            server,
            compartment,
            transitive,
            version_ordering: VersionOrdering::default(),
            subject_type: DEFAULT_SUBJECT_TYPE.to_string(),
        }
    }

    /// Sets the version ordering.
    pub fn with_version_ordering(mut self, ordering: VersionOrdering) -> Self {
        self.version_ordering = ordering;
        self
    }

    /// Sets the subject type.
    pub fn with_subject_type(mut self, subject_type: impl Into<String>) -> Self {
        self.subject_type = subject_type.into();
        self
    }
}

/// Everything the pipeline needs to select the documents of one run.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    /// Tenant to scope to; `None` for single-tenant snapshots.
    pub tenant: Option<TenantId>,
    /// Time bounds and type allow-list.
    pub window: ExportWindow,
    /// Group parameters; `None` for system exports.
    pub group: Option<GroupScope>,
}

impl ExportPlan {
    /// Creates a system export plan.
    pub fn system(window: ExportWindow) -> Self {
        Self {
            tenant: None,
            window,
            group: None,
        }
    }

    /// Creates a group export plan.
    pub fn group(window: ExportWindow, group: GroupScope) -> Self {
        Self {
            tenant: None,
            window,
            group: Some(group),
        }
    }

    /// Scopes the plan to a tenant.
    pub fn with_tenant(mut self, tenant: Option<TenantId>) -> Self {
        self.tenant = tenant;
        self
    }

    /// Returns the transaction time of the run.
    pub fn transaction_time(&self) -> &DateTime<Utc> {
        &self.window.transaction_time
    }

    /// Runs every stage and returns the projected documents, ordered by
    /// `(resource type, id, version)`.
    pub fn select(&self, snapshot: Vec<Document>) -> ExportResult<Vec<Document>> {
        let scanned = snapshot.len();
        let scoped = scope_to_tenant(snapshot, self.tenant.as_ref());
        info!(
            scanned,
            scoped = scoped.len(),
            tenant_id = self.tenant.as_ref().map(TenantId::as_str),
            "Start filtering by transactionTime and since"
        );

        let selected = match &self.group {
            None => self.window.apply(scoped)?,
            Some(group) => {
                let in_window = self.window.without_types().apply(scoped)?;
                self.select_group(in_window, group)?
            }
        };

        let projected = project_all(selected, &self.window);
        info!(selected = projected.len(), "Finished filtering");
        Ok(projected)
    }

    fn select_group(&self, in_window: Vec<Document>, group: &GroupScope) -> ExportResult<Vec<Document>> {
        let membership = GroupResolver::new(group.server.clone(), group.version_ordering)
            .with_subject_type(group.subject_type.clone())
            .resolve(&in_window, &group.group_id, self.transaction_time())?;

        let filtered: Vec<Document> = in_window
            .into_iter()
            .filter(|document| self.window.allows_type(document.resource_type()))
            .collect();
        let engine = CompartmentEngine::new(&membership, &group.compartment, &group.server);
        let closure = run_closure(&filtered, &engine, &group.transitive, &group.server);
        if closure.last_pass == ClosurePass::Second {
            info!(
                group_id = %group.group_id,
                transitive = closure.transitive_keys.len(),
                "Included transitive references"
            );
        }
        Ok(closure.documents)
    }
}
