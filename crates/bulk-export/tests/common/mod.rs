//! Shared fixtures for the export integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use helios_bulk_export::config::ExportType;
use helios_bulk_export::{ExportJob, ExportJobConfig, ExportOutcome, ExportResult, MemoryObjectStore};
use serde_json::{Value, json};

pub const SNAPSHOT_BUCKET: &str = "snapshot";
pub const SNAPSHOT_PREFIX: &str = "table/";
pub const OUTPUT_BUCKET: &str = "output";
pub const CONFIG_BUCKET: &str = "config";
pub const SERVER_URL: &str = "https://fhir.example.org";

pub const SINCE: &str = "2024-01-01T00:00:00.000000Z";
pub const TRANSACTION_TIME: &str = "2024-02-01T00:00:00.000000Z";
pub const IN_WINDOW: &str = "2024-01-15T08:30:00.000Z";

/// Builds a stored document with an exportable status, updated inside the window.
pub fn resource(resource_type: &str, id: &str, body: Value) -> Value {
    let mut value = json!({
        "resourceType": resource_type,
        "id": id,
        "documentStatus": "AVAILABLE",
        "vid": 1,
        "lockEndTs": 1705300000000u64,
        "meta": {"lastUpdated": IN_WINDOW, "versionId": "1"}
    });
    if let (Some(target), Value::Object(extra)) = (value.as_object_mut(), body) {
        for (k, v) in extra {
            target.insert(k, v);
        }
    }
    value
}

/// Sets `meta.lastUpdated`.
pub fn updated_at(mut value: Value, ts: &str) -> Value {
    value["meta"]["lastUpdated"] = json!(ts);
    value
}

/// Sets `documentStatus`.
pub fn with_status(mut value: Value, status: &str) -> Value {
    value["documentStatus"] = json!(status);
    value
}

/// Creates a store holding the snapshot split over `parts` objects, plus the
/// group-export rulesets.
pub fn seeded_store(documents: &[Value], parts: usize) -> MemoryObjectStore {
    let store = MemoryObjectStore::new().with_page_size(2);
    let parts = parts.max(1);
    for part in 0..parts {
        let body: String = documents
            .iter()
            .skip(part)
            .step_by(parts)
            .map(|d| format!("{d}\n"))
            .collect();
        store.insert(SNAPSHOT_BUCKET, &format!("{SNAPSHOT_PREFIX}part-{part:05}.json"), body);
    }
    store.insert(
        CONFIG_BUCKET,
        "patientCompartmentSearchParams.4.0.1.json",
        json!({
            "Observation": ["subject", "performer"],
            "Encounter": ["subject", "participant.individual"],
            "Condition": ["subject", "asserter"]
        })
        .to_string(),
    );
    store.insert(
        CONFIG_BUCKET,
        "transitiveReferenceParams.json",
        json!({
            "Patient": {"generalPractitioner": "Practitioner", "managingOrganization": "Organization"},
            "Encounter": {"serviceProvider": "Organization"},
            "Practitioner": {"qualification.issuer": "Organization"}
        })
        .to_string(),
    );
    store
}

pub fn system_config() -> ExportJobConfig {
    ExportJobConfig {
        job_id: "job-1".to_string(),
        since: SINCE.to_string(),
        transaction_time: TRANSACTION_TIME.to_string(),
        worker_type: "G.1X".to_string(),
        number_workers: 3,
        snapshot_bucket: SNAPSHOT_BUCKET.to_string(),
        snapshot_prefix: SNAPSHOT_PREFIX.to_string(),
        output_bucket: OUTPUT_BUCKET.to_string(),
        ..Default::default()
    }
}

pub fn group_config(group_id: &str) -> ExportJobConfig {
    ExportJobConfig {
        export_type: ExportType::Group,
        group_id: Some(group_id.to_string()),
        server_url: Some(SERVER_URL.to_string()),
        config_bucket: Some(CONFIG_BUCKET.to_string()),
        ..system_config()
    }
}

pub async fn run(store: &MemoryObjectStore, config: ExportJobConfig) -> ExportResult<ExportOutcome> {
    ExportJob::new(config, Arc::new(store.clone())).run().await
}

/// Reads every output object as `(key, lines)`.
pub fn output(store: &MemoryObjectStore) -> Vec<(String, Vec<Value>)> {
    store
        .keys(OUTPUT_BUCKET)
        .into_iter()
        .map(|key| {
            let body = store.object(OUTPUT_BUCKET, &key).unwrap().body;
            let lines = String::from_utf8(body)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect();
            (key, lines)
        })
        .collect()
}

/// Returns `Type/id` of every exported document, sorted.
pub fn exported_ids(store: &MemoryObjectStore) -> Vec<String> {
    let mut ids: Vec<String> = output(store)
        .into_iter()
        .flat_map(|(_, lines)| lines)
        .map(|line| format!("{}/{}", line["resourceType"].as_str().unwrap(), line["id"].as_str().unwrap()))
        .collect();
    ids.sort();
    ids
}
