//! Semgrep static analysis plugin. Requires a materialized rules directory;
//! symlinks each rule entry into the scan's working directory so Semgrep's
//! SARIF output reports rule-relative paths instead of a temp-dir prefix.

use super::{ensure_installed, run_command, split_sarif_by_rules, write_sarif_to_temp};
use crate::registry::{anyhow_like::PluginError, Plugin, PluginMetadata, Requirement, RunArgs};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct SemgrepPlugin {
    timeout_secs: u64,
}

impl SemgrepPlugin {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

impl Default for SemgrepPlugin {
    fn default() -> Self {
        Self::new(900)
    }
}

#[async_trait::async_trait]
impl Plugin for SemgrepPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            plugin_id: "semgrep".to_string(),
            name: "Semgrep".to_string(),
            version: "1.0.0".to_string(),
            author: "GSAST Team".to_string(),
            description: "Static analysis security scanner using custom and community rules".to_string(),
        }
    }

    fn requirements(&self) -> Vec<Requirement> {
        vec![
            Requirement {
                name: "rule_files",
                required: true,
                description: "YAML/JSON rule files for Semgrep static analysis",
            },
            Requirement {
                name: "rules_dir",
                required: true,
                description: "Directory containing extracted rule files",
            },
        ]
    }

    fn validate(&self, args: &RunArgs) -> Result<(), String> {
        if args.rule_files.is_empty() {
            return Err("Rule files are required for Semgrep scanner".to_string());
        }
        if args.rules_dir.is_none() {
            return Err("Rules directory is required for Semgrep scanner".to_string());
        }
        for (name, _) in &args.rule_files {
            let ok = name.ends_with(".yaml") || name.ends_with(".yml") || name.ends_with(".json");
            if !ok {
                return Err(format!("Rule file {name} must be in .yaml or .json format"));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        project_sources_dir: &Path,
        scan_cwd: &Path,
        args: &RunArgs,
    ) -> Result<Option<HashMap<String, PathBuf>>, PluginError> {
        let Some(rules_dir) = &args.rules_dir else {
            return Err(PluginError("semgrep plugin requires rules_dir argument".to_string()));
        };

        ensure_installed("semgrep").await?;

        let mut rule_names = Vec::new();
        let mut entries = tokio::fs::read_dir(rules_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let link = scan_cwd.join(&name);
            #[cfg(unix)]
            {
                let _ = std::os::unix::fs::symlink(entry.path(), &link);
            }
            #[cfg(not(unix))]
            {
                let _ = std::fs::copy(entry.path(), &link);
            }
            rule_names.push(name.to_string_lossy().into_owned());
        }

        let relative_target = project_sources_dir
            .strip_prefix(scan_cwd)
            .unwrap_or(project_sources_dir)
            .to_string_lossy()
            .into_owned();

        let mut args_vec: Vec<String> = vec![
            "scan".to_string(),
            "--sarif".to_string(),
            "--metrics".to_string(),
            "off".to_string(),
            "--max-target-bytes".to_string(),
            "10000000".to_string(),
            "--exclude=*.html".to_string(),
            "--timeout=900".to_string(),
        ];
        for rule_name in &rule_names {
            args_vec.push(format!("--config={rule_name}"));
        }
        args_vec.push(relative_target);

        let arg_refs: Vec<&str> = args_vec.iter().map(String::as_str).collect();
        let stdout = run_command("semgrep", &arg_refs, scan_cwd, self.timeout_secs).await?;

        let doc: Value = serde_json::from_str(&stdout)
            .map_err(|e| PluginError(format!("semgrep produced invalid sarif: {e}")))?;

        let split = split_sarif_by_rules(project_sources_dir, &doc).await?;
        if split.is_none() {
            // Still persist the unsplit, empty-results document so callers can
            // tell "ran cleanly, no findings" apart from "crashed".
            let _ = write_sarif_to_temp(project_sources_dir, &doc).await?;
        }
        Ok(split)
    }
}
