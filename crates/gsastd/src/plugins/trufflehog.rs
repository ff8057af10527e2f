//! TruffleHog secret-scanning plugin. Requires full git history (it scans
//! commit contents, not just the working tree), so the worker must clone
//! non-shallow when this plugin is selected.

use super::{ensure_installed, run_command};
use crate::registry::{anyhow_like::PluginError, Plugin, PluginMetadata, Requirement, RunArgs};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct TrufflehogPlugin {
    gitlab_url: String,
    timeout_secs: u64,
}

impl TrufflehogPlugin {
    pub fn new(gitlab_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            gitlab_url: gitlab_url.into(),
            timeout_secs,
        }
    }
}

#[async_trait::async_trait]
impl Plugin for TrufflehogPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            plugin_id: "trufflehog".to_string(),
            name: "Trufflehog".to_string(),
            version: "1.0.0".to_string(),
            author: "GSAST Team".to_string(),
            description: "Git-history secret scanner".to_string(),
        }
    }

    fn requirements(&self) -> Vec<Requirement> {
        vec![Requirement {
            name: "full_git_history",
            required: true,
            description: "TruffleHog scans commit history, so the clone must not be shallow",
        }]
    }

    fn validate(&self, _args: &RunArgs) -> Result<(), String> {
        Ok(())
    }

    async fn run(
        &self,
        project_sources_dir: &Path,
        scan_cwd: &Path,
        _args: &RunArgs,
    ) -> Result<Option<HashMap<String, PathBuf>>, PluginError> {
        ensure_installed("trufflehog").await?;

        let source_arg = format!("file://{}", project_sources_dir.display());
        let verifier_arg = format!("gitlab={}", self.gitlab_url);
        let args = [
            "git",
            source_arg.as_str(),
            "--only-verified",
            "-j",
            "--verifier",
            verifier_arg.as_str(),
            "--no-update",
        ];

        let stdout = run_command("trufflehog", &args, scan_cwd, self.timeout_secs).await?;
        if stdout.trim().is_empty() {
            return Ok(None);
        }

        convert_and_split(project_sources_dir, &stdout).await
    }
}

async fn convert_and_split(
    dir: &Path,
    ndjson: &str,
) -> Result<Option<HashMap<String, PathBuf>>, PluginError> {
    let mut detector_counts: HashMap<String, u32> = HashMap::new();
    let mut rule_id_by_hash: HashMap<String, u32> = HashMap::new();
    let mut grouped: HashMap<String, Value> = HashMap::new();

    for line in ndjson.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(line) else {
            tracing::warn!("skipping invalid trufflehog json line");
            continue;
        };

        let source_name = data["SourceName"].as_str().unwrap_or("unknown-source");
        let detector_name = data["DetectorName"].as_str().unwrap_or("UnknownDetector");
        let detector_desc = data["DetectorDescription"].as_str().unwrap_or("");
        let raw_secret = data["Raw"].as_str().unwrap_or("");
        let verified = data["Verified"].as_bool().unwrap_or(false);

        let git = &data["SourceMetadata"]["Data"]["Git"];
        let commit_id = git["commit"].as_str().unwrap_or("");
        let file_path = git["file"].as_str().unwrap_or("unknown-file");
        let line_number = git["line"].as_i64().unwrap_or(1);
        let repository = git["repository"].as_str().unwrap_or("");

        let mut hasher = Sha256::new();
        hasher.update(detector_name.as_bytes());
        hasher.update(detector_desc.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let seq = if let Some(&seq) = rule_id_by_hash.get(&hash) {
            seq
        } else {
            let count = detector_counts.entry(detector_name.to_string()).or_insert(0);
            *count += 1;
            rule_id_by_hash.insert(hash, *count);
            *count
        };
        let rule_id = format!("{source_name} {}", seq + 1);

        let short_msg = format!("Hard Coded {detector_name} Secret - {file_path}");

        let group = grouped.entry(rule_id.clone()).or_insert_with(|| {
            serde_json::json!({
                "$schema": "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/master/Schemata/sarif-schema-2.1.0.json",
                "version": "2.1.0",
                "runs": [{
                    "tool": {
                        "driver": {
                            "name": "Trufflehog",
                            "informationUri": "https://github.com/trufflesecurity/trufflehog",
                            "rules": []
                        }
                    },
                    "results": []
                }]
            })
        });

        group["runs"][0]["results"]
            .as_array_mut()
            .expect("results is an array")
            .push(serde_json::json!({
                "ruleId": rule_id,
                "message": { "text": short_msg },
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": { "uri": file_path },
                        "region": { "startLine": line_number }
                    }
                }],
                "properties": {
                    "commit": commit_id,
                    "repository": repository,
                    "verified": verified
                }
            }));
    }

    if grouped.is_empty() {
        return Ok(None);
    }

    let mut out = HashMap::new();
    for (rule_id, doc) in grouped {
        out.insert(rule_id, super::write_sarif_to_temp(dir, &doc).await?);
    }
    Ok(Some(out))
}
