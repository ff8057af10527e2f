//! Results store: write merges per-rule SARIF files into a single envelope
//! per scanner id, last-writer-wins across scanners for a project; read
//! applies project/scanner/path-query filters.

use crate::store::SharedStore;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("io error reading sarif file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json in sarif file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed path query: {0}")]
    MalformedQuery(String),
}

pub type Result<T> = std::result::Result<T, ResultsError>;

fn results_key(scan_id: &str, project_url: &str) -> String {
    format!("{scan_id}:results:{project_url}")
}

fn projects_key(scan_id: &str) -> String {
    format!("{scan_id}:projects")
}

/// Merge multiple rule-keyed SARIF documents into a single envelope for one
/// scanner by concatenating their `runs` arrays. A scanner that returned a
/// single rule file's SARIF document is passed through unchanged.
fn merge_rule_sarifs(paths: &HashMap<String, PathBuf>) -> Result<Value> {
    let mut merged_runs = Vec::new();
    let mut base: Option<Value> = None;

    // Deterministic order keeps merges reproducible across runs.
    let mut ordered: Vec<_> = paths.iter().collect();
    ordered.sort_by_key(|(rule, _)| rule.clone());

    for (_, path) in ordered {
        let raw = std::fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&raw).map_err(|source| ResultsError::Json {
            path: path.clone(),
            source,
        })?;
        if let Some(runs) = doc.get("runs").and_then(Value::as_array) {
            merged_runs.extend(runs.iter().cloned());
        }
        if base.is_none() {
            base = Some(doc);
        }
    }

    let mut merged = base.unwrap_or_else(|| serde_json::json!({}));
    merged["runs"] = Value::Array(merged_runs);
    Ok(merged)
}

/// Write a scanner's results for one project. Reads and merges the
/// per-rule SARIF files, merges into the existing stored map for this
/// `(scan_id, project_url)` (new scanner entries overwrite same-keyed
/// entries, others are retained), writes atomically, and adds the project
/// URL to the scan's project set.
pub async fn store(
    store: &SharedStore,
    scan_id: &str,
    project_url: &str,
    scanner_id: &str,
    sarif_paths: &HashMap<String, PathBuf>,
) -> Result<()> {
    let merged_sarif = merge_rule_sarifs(sarif_paths)?;

    let key = results_key(scan_id, project_url);
    let existing = store.hgetall(&key).await?;

    let mut results_map: HashMap<String, Value> = existing
        .get("results")
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    results_map.insert(scanner_id.to_string(), merged_sarif);

    let results_json = serde_json::to_string(&results_map)?;
    let updated_at = Utc::now().timestamp();

    store
        .hset_many(
            &key,
            &[
                ("results", &results_json),
                ("project_url", project_url),
                ("scanner_type", scanner_id),
                ("updated_at", &updated_at.to_string()),
            ],
        )
        .await?;

    store.sadd(&projects_key(scan_id), project_url).await?;

    Ok(())
}

#[derive(Debug, serde::Serialize)]
pub struct ProjectEnvelope {
    pub results: HashMap<String, Value>,
    pub updated_at: i64,
}

#[derive(Debug, serde::Serialize)]
pub struct ResultsEnvelope {
    pub scan_id: String,
    pub projects: HashMap<String, ProjectEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Read results for a scan, applying optional project/scanner/path-query
/// filters, matching `get_scan_results` exactly:
/// - `project_filter`: keeps URLs containing the substring, or ending in
///   `/<filter>.git` or `:<filter>.git`.
/// - `scanner_filter`: keeps scanner entries whose id contains the
///   substring; drops the project entirely if none remain.
/// - `path_query`: a JSONPath expression applied per scanner payload; a
///   project is dropped if every scanner's matches are empty. A malformed
///   expression is a caller error; a runtime evaluation error on a
///   particular payload falls back to the unfiltered payload for that
///   scanner.
pub async fn get(
    store: &SharedStore,
    scan_id: &str,
    project_filter: Option<&str>,
    scanner_filter: Option<&str>,
    path_query: Option<&str>,
) -> Result<ResultsEnvelope> {
    let all_projects = store.smembers(&projects_key(scan_id)).await?;
    if all_projects.is_empty() {
        return Ok(ResultsEnvelope {
            scan_id: scan_id.to_string(),
            projects: HashMap::new(),
            message: Some("No projects found for scan".to_string()),
        });
    }

    let survivors: Vec<&String> = match project_filter {
        None => all_projects.iter().collect(),
        Some(filter) => all_projects
            .iter()
            .filter(|url| matches_project_filter(url, filter))
            .collect(),
    };

    if survivors.is_empty() {
        return Ok(ResultsEnvelope {
            scan_id: scan_id.to_string(),
            projects: HashMap::new(),
            message: Some(format!("No projects found matching filter '{}'", project_filter.unwrap_or(""))),
        });
    }

    // Validate the query once, up front, so a malformed expression is a
    // single error rather than silently failing per-project.
    if let Some(query) = path_query {
        if jsonpath_lib::Compiled::compile(query).is_err() {
            return Err(ResultsError::MalformedQuery(query.to_string()));
        }
    }

    let mut projects = HashMap::new();
    for url in survivors {
        let key = results_key(scan_id, url);
        let hash = store.hgetall(&key).await?;
        let Some(results_json) = hash.get("results") else {
            continue;
        };
        let mut results_map: HashMap<String, Value> =
            serde_json::from_str(results_json).unwrap_or_default();

        if let Some(filter) = scanner_filter {
            results_map.retain(|scanner_id, _| scanner_id.contains(filter));
            if results_map.is_empty() {
                continue;
            }
        }

        if let Some(query) = path_query {
            results_map = apply_path_query(&results_map, query);
            if results_map.values().all(|v| is_empty_match(v)) {
                continue;
            }
        }

        let updated_at = hash
            .get("updated_at")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        projects.insert(
            url.clone(),
            ProjectEnvelope {
                results: results_map,
                updated_at,
            },
        );
    }

    Ok(ResultsEnvelope {
        scan_id: scan_id.to_string(),
        projects,
        message: None,
    })
}

fn matches_project_filter(url: &str, filter: &str) -> bool {
    url.contains(filter)
        || url.ends_with(&format!("/{filter}.git"))
        || url.ends_with(&format!(":{filter}.git"))
}

/// Apply a JSONPath expression to each scanner's payload independently. A
/// runtime evaluation error for a given payload falls back to the original,
/// unfiltered payload for that scanner rather than propagating.
fn apply_path_query(results_map: &HashMap<String, Value>, query: &str) -> HashMap<String, Value> {
    results_map
        .iter()
        .map(|(scanner_id, payload)| {
            let filtered = jsonpath_lib::select(payload, query)
                .map(|matches| Value::Array(matches.into_iter().cloned().collect()))
                .unwrap_or_else(|_| payload.clone());
            (scanner_id.clone(), filtered)
        })
        .collect()
}

fn is_empty_match(value: &Value) -> bool {
    matches!(value, Value::Array(a) if a.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStore {
        store: SharedStore,
        _dir: TempDir,
    }

    async fn create_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = SharedStore::new(&dir.path().join("test.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();
        TestStore { store, _dir: dir }
    }

    fn write_sarif(dir: &std::path::Path, name: &str, uri: &str) -> PathBuf {
        let path = dir.join(name);
        let doc = serde_json::json!({
            "$schema": "https://example.com/sarif-2.1.0.json",
            "version": "2.1.0",
            "runs": [{
                "tool": { "driver": { "name": "Semgrep" } },
                "results": [{
                    "message": { "text": "issue" },
                    "locations": [{ "physicalLocation": { "artifactLocation": { "uri": uri } } }],
                    "level": "warning"
                }]
            }]
        });
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn store_then_get_round_trips_last_written_payload() {
        let t = create_test_store().await;
        let dir = TempDir::new().unwrap();
        let path = write_sarif(dir.path(), "r1.sarif", "src/a.rs");
        let mut paths = HashMap::new();
        paths.insert("rule1".to_string(), path);

        store(&t.store, "SCAN-1", "https://git/org/repo.git", "semgrep", &paths)
            .await
            .unwrap();

        let envelope = get(&t.store, "SCAN-1", None, None, None).await.unwrap();
        let project = envelope.projects.get("https://git/org/repo.git").unwrap();
        assert!(project.results.contains_key("semgrep"));
    }

    #[tokio::test]
    async fn project_filter_matches_substring_and_suffix() {
        let t = create_test_store().await;
        let dir = TempDir::new().unwrap();
        let path = write_sarif(dir.path(), "r1.sarif", "src/a.rs");
        let mut paths = HashMap::new();
        paths.insert("rule1".to_string(), path);

        store(&t.store, "SCAN-1", "https://git/org/my-app.git", "semgrep", &paths)
            .await
            .unwrap();

        let envelope = get(&t.store, "SCAN-1", Some("my-app"), None, None).await.unwrap();
        assert_eq!(envelope.projects.len(), 1);
    }

    #[tokio::test]
    async fn scanner_filter_drops_project_if_empty_after_filter() {
        let t = create_test_store().await;
        let dir = TempDir::new().unwrap();
        let path = write_sarif(dir.path(), "r1.sarif", "src/a.rs");
        let mut paths = HashMap::new();
        paths.insert("rule1".to_string(), path);

        store(&t.store, "SCAN-1", "https://git/org/repo.git", "semgrep", &paths)
            .await
            .unwrap();

        let envelope = get(&t.store, "SCAN-1", None, Some("trufflehog"), None)
            .await
            .unwrap();
        assert!(envelope.projects.is_empty());
    }

    #[tokio::test]
    async fn empty_project_set_returns_message_not_error() {
        let t = create_test_store().await;
        let envelope = get(&t.store, "SCAN-EMPTY", None, None, None).await.unwrap();
        assert!(envelope.message.is_some());
        assert!(envelope.projects.is_empty());
    }

    #[tokio::test]
    async fn malformed_query_is_rejected() {
        let t = create_test_store().await;
        let dir = TempDir::new().unwrap();
        let path = write_sarif(dir.path(), "r1.sarif", "src/a.rs");
        let mut paths = HashMap::new();
        paths.insert("rule1".to_string(), path);
        store(&t.store, "SCAN-1", "https://git/org/repo.git", "semgrep", &paths)
            .await
            .unwrap();

        let result = get(&t.store, "SCAN-1", None, None, Some("$[")).await;
        assert!(matches!(result, Err(ResultsError::MalformedQuery(_))));
    }

    #[test]
    fn project_filter_suffix_disambiguation() {
        assert!(matches_project_filter("https://gitlab.com/org/my-app.git", "my-app"));
        assert!(matches_project_filter("git@gitlab.com:org/my-app.git", "my-app"));
        assert!(!matches_project_filter("https://gitlab.com/org/my-app-2.git", "my-app.git"));
    }
}
