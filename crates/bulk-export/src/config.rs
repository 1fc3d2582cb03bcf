//! Run parameters of an export job.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HFS_EXPORT_JOB_ID` | | Job id, also the output key prefix |
//! | `HFS_EXPORT_JOB_OWNER_ID` | | Requesting user, tagged on output objects |
//! | `HFS_EXPORT_TYPE` | system | `system` or `group` |
//! | `HFS_EXPORT_TRANSACTION_TIME` | | Snapshot point, inclusive |
//! | `HFS_EXPORT_SINCE` | 1970-01-01T00:00:00.000Z | Lower bound, exclusive |
//! | `HFS_EXPORT_OUTPUT_FORMAT` | application/fhir+ndjson | Requested output format |
//! | `HFS_EXPORT_TENANT_ID` | | Tenant of a multi-tenant snapshot |
//! | `HFS_EXPORT_GROUP_ID` | | Group to export |
//! | `HFS_EXPORT_RESOURCE_TYPES` | | Comma-separated resource type allow-list |
//! | `HFS_EXPORT_SERVER_URL` | | Base URL of the FHIR server |
//! | `HFS_EXPORT_WORKER_TYPE` | G.2X | `G.1X` or `G.2X` |
//! | `HFS_EXPORT_NUMBER_WORKERS` | 5 | Workers including the driver |
//! | `HFS_EXPORT_READ_THROUGHPUT_PERCENT` | 0.5 | Share of source read throughput |
//! | `HFS_EXPORT_SNAPSHOT_BUCKET` | | Bucket holding the table snapshot |
//! | `HFS_EXPORT_SNAPSHOT_PREFIX` | | Key prefix of the table snapshot |
//! | `HFS_EXPORT_OUTPUT_BUCKET` | | Bucket receiving the output |
//! | `HFS_EXPORT_CONFIG_BUCKET` | | Bucket holding the rulesets |
//! | `HFS_EXPORT_COMPARTMENT_RULESET_KEY` | by FHIR version | Compartment ruleset key |
//! | `HFS_EXPORT_TRANSITIVE_RULESET_KEY` | transitiveReferenceParams.json | Transitive ruleset key |
//! | `HFS_EXPORT_FHIR_VERSION` | 4.0.1 | `3.0.1` or `4.0.1` |
//! | `HFS_EXPORT_SUBJECT_TYPE` | Patient | Compartment anchor type |
//! | `HFS_EXPORT_GROUP_VERSION_ORDERING` | numeric | `numeric` or `lexical` |
//! | `HFS_EXPORT_REGION` | | Object-store region |
//! | `HFS_EXPORT_ENDPOINT_URL` | | Object-store endpoint override |
//! | `HFS_EXPORT_LOG_LEVEL` | info | Log level |

use std::fmt;

use clap::{Parser, ValueEnum};

use crate::document::{VersionOrdering, parse_timestamp};
use crate::error::{ConfigError, ExportResult};
use crate::filter::ExportWindow;
use crate::group::DEFAULT_SUBJECT_TYPE;
use crate::reference::ServerBase;
use crate::rulesets::{DEFAULT_TRANSITIVE_RULESET_KEY, default_compartment_ruleset_key};
use crate::snapshot::{DEFAULT_READ_THROUGHPUT_PERCENT, ScanOptions};
use crate::tenant::TenantId;

/// Output formats accepted for an NDJSON export.
pub const SUPPORTED_OUTPUT_FORMATS: &[&str] = &["application/fhir+ndjson", "application/ndjson", "ndjson"];

/// Lower bound used when no `since` is given.
pub const DEFAULT_SINCE: &str = "1970-01-01T00:00:00.000Z";

/// Scope of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExportType {
    /// Every exportable document in the window.
    #[default]
    System,
    /// One group's members and their compartments.
    Group,
}

impl fmt::Display for ExportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// FHIR version of the stored resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FhirVersion {
    /// STU3.
    #[value(name = "3.0.1")]
    Stu3,
    /// R4.
    #[default]
    #[value(name = "4.0.1")]
    R4,
}

impl fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stu3 => write!(f, "3.0.1"),
            Self::R4 => write!(f, "4.0.1"),
        }
    }
}

/// Parameters of one export run.
#[derive(Debug, Clone, Parser)]
#[command(name = "hfs-export")]
#[command(about = "Helios FHIR Server bulk export job")]
pub struct ExportJobConfig {
    /// Job id; output is written under this prefix.
    #[arg(long, env = "HFS_EXPORT_JOB_ID", default_value = "")]
    pub job_id: String,

    /// Id of the user who requested the export.
    #[arg(long, env = "HFS_EXPORT_JOB_OWNER_ID")]
    pub job_owner_id: Option<String>,

    /// Export scope.
    #[arg(long, env = "HFS_EXPORT_TYPE", value_enum, default_value_t = ExportType::System)]
    pub export_type: ExportType,

    /// Snapshot point of the run, inclusive.
    #[arg(long, env = "HFS_EXPORT_TRANSACTION_TIME", default_value = "")]
    pub transaction_time: String,

    /// Only documents updated after this time are exported.
    #[arg(long, env = "HFS_EXPORT_SINCE", default_value = DEFAULT_SINCE)]
    pub since: String,

    /// Requested output format.
    #[arg(long, env = "HFS_EXPORT_OUTPUT_FORMAT", default_value = "application/fhir+ndjson")]
    pub output_format: String,

    /// Tenant to export from a multi-tenant snapshot.
    #[arg(long, env = "HFS_EXPORT_TENANT_ID")]
    pub tenant_id: Option<String>,

    /// Group to export.
    #[arg(long, env = "HFS_EXPORT_GROUP_ID")]
    pub group_id: Option<String>,

    /// Comma-separated resource types to export.
    #[arg(long = "type", env = "HFS_EXPORT_RESOURCE_TYPES")]
    pub resource_types: Option<String>,

    /// Base URL of the FHIR server, used to classify absolute references.
    #[arg(long, env = "HFS_EXPORT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Worker type (G.1X or G.2X).
    #[arg(long, env = "HFS_EXPORT_WORKER_TYPE", default_value = "G.2X")]
    pub worker_type: String,

    /// Number of workers, including the driver.
    #[arg(long, env = "HFS_EXPORT_NUMBER_WORKERS", default_value = "5")]
    pub number_workers: u32,

    /// Fraction of the source read throughput the scan may use.
    #[arg(long, env = "HFS_EXPORT_READ_THROUGHPUT_PERCENT", default_value_t = DEFAULT_READ_THROUGHPUT_PERCENT)]
    pub read_throughput_percent: f64,

    /// Bucket holding the document-store snapshot.
    #[arg(long, env = "HFS_EXPORT_SNAPSHOT_BUCKET", default_value = "")]
    pub snapshot_bucket: String,

    /// Key prefix of the document-store snapshot.
    #[arg(long, env = "HFS_EXPORT_SNAPSHOT_PREFIX", default_value = "")]
    pub snapshot_prefix: String,

    /// Bucket receiving the output objects.
    #[arg(long, env = "HFS_EXPORT_OUTPUT_BUCKET", default_value = "")]
    pub output_bucket: String,

    /// Bucket holding the group-export rulesets.
    #[arg(long, env = "HFS_EXPORT_CONFIG_BUCKET")]
    pub config_bucket: Option<String>,

    /// Key of the compartment ruleset; defaults by FHIR version.
    #[arg(long, env = "HFS_EXPORT_COMPARTMENT_RULESET_KEY")]
    pub compartment_ruleset_key: Option<String>,

    /// Key of the transitive ruleset.
    #[arg(long, env = "HFS_EXPORT_TRANSITIVE_RULESET_KEY", default_value = DEFAULT_TRANSITIVE_RULESET_KEY)]
    pub transitive_ruleset_key: String,

    /// FHIR version of the stored resources.
    #[arg(long, env = "HFS_EXPORT_FHIR_VERSION", value_enum, default_value_t = FhirVersion::R4)]
    pub fhir_version: FhirVersion,

    /// Resource type the compartment is anchored on.
    #[arg(long, env = "HFS_EXPORT_SUBJECT_TYPE", default_value = DEFAULT_SUBJECT_TYPE)]
    pub subject_type: String,

    /// How group version ids are compared.
    #[arg(long, env = "HFS_EXPORT_GROUP_VERSION_ORDERING", value_enum, default_value_t = VersionOrdering::Numeric)]
    pub group_version_ordering: VersionOrdering,

    /// Object-store region.
    #[arg(long, env = "HFS_EXPORT_REGION")]
    pub region: Option<String>,

    /// Object-store endpoint override.
    #[arg(long, env = "HFS_EXPORT_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "HFS_EXPORT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for ExportJobConfig {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            job_owner_id: None,
            export_type: ExportType::System,
            transaction_time: String::new(),
            since: DEFAULT_SINCE.to_string(),
            output_format: "application/fhir+ndjson".to_string(),
            tenant_id: None,
            group_id: None,
            resource_types: None,
            server_url: None,
            worker_type: "G.2X".to_string(),
            number_workers: 5,
            read_throughput_percent: DEFAULT_READ_THROUGHPUT_PERCENT,
            snapshot_bucket: String::new(),
            snapshot_prefix: String::new(),
            output_bucket: String::new(),
            config_bucket: None,
            compartment_ruleset_key: None,
            transitive_ruleset_key: DEFAULT_TRANSITIVE_RULESET_KEY.to_string(),
            fhir_version: FhirVersion::R4,
            subject_type: DEFAULT_SUBJECT_TYPE.to_string(),
            group_version_ordering: VersionOrdering::Numeric,
            region: None,
            endpoint_url: None,
            log_level: "info".to_string(),
        }
    }
}

impl ExportJobConfig {
    /// Validates the configuration and returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.job_id.trim().is_empty() {
            errors.push(missing("jobId"));
        }
        if self.transaction_time.trim().is_empty() {
            errors.push(missing("transactionTime"));
        }
        if let Err(e) = ScanOptions::from_worker_shape(
            &self.worker_type,
            self.number_workers,
            self.read_throughput_percent,
        ) {
            errors.push(e.to_string());
        }
        if !(self.read_throughput_percent > 0.0 && self.read_throughput_percent <= 1.5) {
            errors.push(format!(
                "read throughput percent must be in (0, 1.5], got {}",
                self.read_throughput_percent
            ));
        }
        if !SUPPORTED_OUTPUT_FORMATS.contains(&self.output_format.as_str()) {
            errors.push(
                ConfigError::UnsupportedFormat {
                    format: self.output_format.clone(),
                }
                .to_string(),
            );
        }
        if !self.transaction_time.trim().is_empty() {
            match (
                parse_timestamp("since", &self.since),
                parse_timestamp("transactionTime", &self.transaction_time),
            ) {
                (Ok(since), Ok(tx)) if since >= tx => {
                    errors.push("since must be earlier than transactionTime".to_string());
                }
                (Err(e), _) | (_, Err(e)) => errors.push(e.to_string()),
                _ => {}
            }
        }
        if self.snapshot_bucket.is_empty() {
            errors.push(missing("snapshotBucket"));
        }
        if self.output_bucket.is_empty() {
            errors.push(missing("outputBucket"));
        }
        if self.tenant_id.as_deref().is_some_and(|t| t.trim().is_empty()) {
            errors.push("tenantId cannot be empty".to_string());
        }

        if self.export_type == ExportType::Group {
            if self.group_id.as_deref().is_none_or(str::is_empty) {
                errors.push(missing("groupId"));
            }
            if self.server_url.as_deref().is_none_or(str::is_empty) {
                errors.push(missing("serverUrl"));
            }
            if self.config_bucket.as_deref().is_none_or(str::is_empty) {
                errors.push(missing("configBucket"));
            }
            if self.subject_type.is_empty() {
                errors.push(missing("subjectType"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validates the configuration, folding every problem into one error.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        self.validate().map_err(|errors| ConfigError::Invalid { errors })
    }

    /// Derives the snapshot scan options from the worker shape.
    pub fn scan_options(&self) -> Result<ScanOptions, ConfigError> {
        ScanOptions::from_worker_shape(&self.worker_type, self.number_workers, self.read_throughput_percent)
    }

    /// Returns the requested resource types, trimmed, without empties.
    pub fn resource_type_list(&self) -> Vec<String> {
        self.resource_types
            .as_deref()
            .map(|types| {
                types
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Builds the export window.
    pub fn window(&self) -> ExportResult<ExportWindow> {
        Ok(ExportWindow::parse(&self.since, &self.transaction_time)?.with_types(self.resource_type_list()))
    }

    /// Returns the tenant, if the snapshot is multi-tenant.
    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant_id.as_deref().map(TenantId::new)
    }

    /// Returns the server base used to classify references.
    pub fn server_base(&self) -> ServerBase {
        match self.server_url.as_deref() {
            Some(url) if !url.is_empty() => ServerBase::new(url),
            _ => ServerBase::relative_only(),
        }
    }

    /// Returns the compartment ruleset key, defaulting by FHIR version.
    pub fn compartment_ruleset_key(&self) -> &str {
        self.compartment_ruleset_key
            .as_deref()
            .unwrap_or_else(|| default_compartment_ruleset_key(self.fhir_version))
    }

    /// Creates a valid system-export configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            job_id: "test-job".to_string(),
            transaction_time: "2024-02-01T00:00:00.000Z".to_string(),
            since: "2024-01-01T00:00:00.000Z".to_string(),
            worker_type: "G.1X".to_string(),
            number_workers: 2,
            snapshot_bucket: "snapshot".to_string(),
            snapshot_prefix: "table/".to_string(),
            output_bucket: "output".to_string(),
            config_bucket: Some("config".to_string()),
            server_url: Some("https://fhir.example.org".to_string()),
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }
}

fn missing(parameter: &str) -> String {
    ConfigError::MissingParameter {
        parameter: parameter.to_string(),
    }
    .to_string()
}
