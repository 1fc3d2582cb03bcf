//! Helios FHIR Server bulk export job.
//!
//! Runs one export with parameters taken from the command line or
//! `HFS_EXPORT_*` environment variables, and exits non-zero if it fails.

use std::sync::Arc;

use clap::Parser;
use helios_bulk_export::{AwsS3Client, ExportJob, ExportJobConfig, init_logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ExportJobConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    info!(
        job_id = %config.job_id,
        export_type = %config.export_type,
        tenant_id = config.tenant_id.as_deref(),
        group_id = config.group_id.as_deref(),
        transaction_time = %config.transaction_time,
        since = %config.since,
        "Starting export job"
    );

    let sdk_config =
        AwsS3Client::load_sdk_config(config.region.as_deref(), config.endpoint_url.as_deref()).await;
    let client = Arc::new(AwsS3Client::from_sdk_config(&sdk_config));

    match ExportJob::new(config, client).run().await {
        Ok(outcome) => {
            info!(
                job_id = %outcome.job_id,
                objects = outcome.output_keys.len(),
                resources = outcome.total(),
                outcome = %serde_json::to_string(&outcome)?,
                "Export job succeeded"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Export job failed");
            Err(anyhow::anyhow!("export job failed: {}", e))
        }
    }
}
