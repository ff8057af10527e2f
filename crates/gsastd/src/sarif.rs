//! SARIF gate: structural/local validation (no remote schema fetch) plus
//! standardization that stamps plugin provenance onto each run's driver.
//!
//! Mirrors `SarifValidator` exactly: required shape is `$schema`,
//! `version == "2.1.0"`, non-empty `runs`, each run has a non-empty
//! `tool.driver.name` and a `results` array whose entries carry a non-empty
//! `message.text` and a non-empty `locations` array, each location carrying
//! a non-empty `physicalLocation.artifactLocation.uri`.

use crate::registry::PluginMetadata;
use chrono::Utc;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

pub const SARIF_VERSION: &str = "2.1.0";

#[derive(Debug, Error)]
pub enum SarifError {
    #[error("io error reading sarif file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing $schema")]
    MissingSchema,
    #[error("unsupported version: expected {SARIF_VERSION}, got {0}")]
    UnsupportedVersion(String),
    #[error("runs must be a non-empty array")]
    EmptyRuns,
    #[error("run {0}: tool.driver.name must be a non-empty string")]
    MissingDriverName(usize),
    #[error("run {0}: results must be an array")]
    MissingResults(usize),
    #[error("run {run}, result {result}: message.text must be non-empty")]
    MissingMessageText { run: usize, result: usize },
    #[error("run {run}, result {result}: locations must be a non-empty array")]
    MissingLocations { run: usize, result: usize },
    #[error("run {run}, result {result}, location {location}: physicalLocation.artifactLocation.uri must be non-empty")]
    MissingArtifactUri {
        run: usize,
        result: usize,
        location: usize,
    },
}

pub type Result<T> = std::result::Result<T, SarifError>;

/// Validate the structural shape of a SARIF document.
pub fn validate(doc: &Value) -> Result<()> {
    if doc.get("$schema").and_then(Value::as_str).is_none() {
        return Err(SarifError::MissingSchema);
    }
    match doc.get("version").and_then(Value::as_str) {
        Some(SARIF_VERSION) => {}
        Some(other) => return Err(SarifError::UnsupportedVersion(other.to_string())),
        None => return Err(SarifError::UnsupportedVersion(String::new())),
    }

    let runs = doc
        .get("runs")
        .and_then(Value::as_array)
        .filter(|r| !r.is_empty())
        .ok_or(SarifError::EmptyRuns)?;

    for (run_idx, run) in runs.iter().enumerate() {
        validate_run(run_idx, run)?;
    }

    Ok(())
}

fn validate_run(run_idx: usize, run: &Value) -> Result<()> {
    let driver_name = run
        .get("tool")
        .and_then(|t| t.get("driver"))
        .and_then(|d| d.get("name"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    if driver_name.is_none() {
        return Err(SarifError::MissingDriverName(run_idx));
    }

    let results = run
        .get("results")
        .and_then(Value::as_array)
        .ok_or(SarifError::MissingResults(run_idx))?;

    for (result_idx, result) in results.iter().enumerate() {
        validate_result(run_idx, result_idx, result)?;
    }

    Ok(())
}

fn validate_result(run_idx: usize, result_idx: usize, result: &Value) -> Result<()> {
    let text = result
        .get("message")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    if text.is_none() {
        return Err(SarifError::MissingMessageText {
            run: run_idx,
            result: result_idx,
        });
    }

    let locations = result
        .get("locations")
        .and_then(Value::as_array)
        .filter(|l| !l.is_empty())
        .ok_or(SarifError::MissingLocations {
            run: run_idx,
            result: result_idx,
        })?;

    for (loc_idx, location) in locations.iter().enumerate() {
        let uri = location
            .get("physicalLocation")
            .and_then(|p| p.get("artifactLocation"))
            .and_then(|a| a.get("uri"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        if uri.is_none() {
            return Err(SarifError::MissingArtifactUri {
                run: run_idx,
                result: result_idx,
                location: loc_idx,
            });
        }
    }

    Ok(())
}

/// Stamp `driver.name`/`version`/`informationUri` from plugin metadata (if
/// not already present) and insert `driver.properties.gsast` provenance.
/// Findings are left unaltered. Idempotent: running this twice over the same
/// document produces the same output.
pub fn standardize(doc: &mut Value, metadata: &PluginMetadata) {
    let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let gsast_version = env!("CARGO_PKG_VERSION");

    let Some(runs) = doc.get_mut("runs").and_then(Value::as_array_mut) else {
        return;
    };

    for run in runs {
        let driver = run
            .as_object_mut()
            .and_then(|r| r.entry("tool").or_insert_with(|| serde_json::json!({})).as_object_mut())
            .and_then(|t| t.entry("driver").or_insert_with(|| serde_json::json!({})).as_object_mut());

        let Some(driver) = driver else { continue };

        driver.insert("name".to_string(), Value::String(metadata.name.clone()));
        driver.insert("version".to_string(), Value::String(metadata.version.clone()));
        driver
            .entry("informationUri")
            .or_insert_with(|| Value::String(String::new()));

        let properties = driver
            .entry("properties")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(props) = properties.as_object_mut() {
            props.insert(
                "gsast".to_string(),
                serde_json::json!({
                    "pluginId": metadata.plugin_id,
                    "pluginAuthor": metadata.author,
                    "scanTimestamp": now,
                    "gsastVersion": gsast_version,
                }),
            );
        }
    }
}

/// Read, validate, and standardize a SARIF file in place. The standardized
/// document is written back to the same path, matching the reference
/// implementation's in-place rewrite.
pub fn validate_and_standardize_file(path: &Path, metadata: &PluginMetadata) -> Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let mut doc: Value = serde_json::from_str(&raw)?;
    validate(&doc)?;
    standardize(&mut doc, metadata);
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

/// A minimal valid empty-results SARIF document for a plugin that ran but
/// found nothing.
pub fn empty_sarif(metadata: &PluginMetadata) -> Value {
    let mut doc = serde_json::json!({
        "$schema": "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/master/Schemata/sarif-schema-2.1.0.json",
        "version": SARIF_VERSION,
        "runs": [{
            "tool": { "driver": { "name": metadata.name } },
            "results": []
        }]
    });
    standardize(&mut doc, metadata);
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> PluginMetadata {
        PluginMetadata {
            plugin_id: "semgrep".to_string(),
            name: "Semgrep".to_string(),
            version: "1.0".to_string(),
            author: "acme".to_string(),
            description: String::new(),
        }
    }

    fn valid_doc() -> Value {
        serde_json::json!({
            "$schema": "https://example.com/sarif-2.1.0.json",
            "version": "2.1.0",
            "runs": [{
                "tool": { "driver": { "name": "Semgrep" } },
                "results": [{
                    "message": { "text": "found a thing" },
                    "locations": [{
                        "physicalLocation": { "artifactLocation": { "uri": "src/main.rs" } }
                    }]
                }]
            }]
        })
    }

    #[test]
    fn valid_document_passes() {
        assert!(validate(&valid_doc()).is_ok());
    }

    #[test]
    fn missing_schema_rejected() {
        let mut doc = valid_doc();
        doc.as_object_mut().unwrap().remove("$schema");
        assert!(matches!(validate(&doc), Err(SarifError::MissingSchema)));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut doc = valid_doc();
        doc["version"] = Value::String("2.0.0".to_string());
        assert!(matches!(validate(&doc), Err(SarifError::UnsupportedVersion(_))));
    }

    #[test]
    fn empty_runs_rejected() {
        let mut doc = valid_doc();
        doc["runs"] = serde_json::json!([]);
        assert!(matches!(validate(&doc), Err(SarifError::EmptyRuns)));
    }

    #[test]
    fn missing_driver_name_rejected() {
        let mut doc = valid_doc();
        doc["runs"][0]["tool"]["driver"]["name"] = Value::String(String::new());
        assert!(matches!(validate(&doc), Err(SarifError::MissingDriverName(0))));
    }

    #[test]
    fn missing_location_uri_rejected() {
        let mut doc = valid_doc();
        doc["runs"][0]["results"][0]["locations"][0]["physicalLocation"]["artifactLocation"]
            ["uri"] = Value::String(String::new());
        assert!(matches!(
            validate(&doc),
            Err(SarifError::MissingArtifactUri { .. })
        ));
    }

    #[test]
    fn standardize_stamps_gsast_properties() {
        let mut doc = valid_doc();
        standardize(&mut doc, &metadata());
        let props = &doc["runs"][0]["tool"]["driver"]["properties"]["gsast"];
        assert_eq!(props["pluginId"], "semgrep");
        assert_eq!(props["pluginAuthor"], "acme");
        assert!(props["scanTimestamp"].is_string());
    }

    #[test]
    fn standardize_is_idempotent() {
        let mut doc = valid_doc();
        standardize(&mut doc, &metadata());
        let first = doc.clone();
        standardize(&mut doc, &metadata());
        assert_eq!(doc["runs"][0]["tool"]["driver"]["name"], first["runs"][0]["tool"]["driver"]["name"]);
        assert_eq!(
            doc["runs"][0]["tool"]["driver"]["properties"]["gsast"]["pluginId"],
            first["runs"][0]["tool"]["driver"]["properties"]["gsast"]["pluginId"]
        );
    }

    #[test]
    fn empty_sarif_is_valid() {
        let doc = empty_sarif(&metadata());
        assert!(validate(&doc).is_ok());
    }
}
