//! Dependency confusion scanner. Walks package manifests for npm/PyPI
//! dependency declarations and flags any package name that isn't claimed on
//! the corresponding public registry — an internal package name an attacker
//! could register publicly and have resolved instead of the intended one.
//!
//! The reference implementation delegates to a vendored `confusion_hunter`
//! package; no equivalent crate exists in this corpus's lineage, so this
//! plugin re-implements the "find manifests, check registry claim status"
//! behavior directly against the npm and PyPI HTTP APIs.

use super::write_sarif_to_temp;
use crate::registry::{anyhow_like::PluginError, Plugin, PluginMetadata, Requirement, RunArgs};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub struct DependencyConfusionPlugin {
    client: reqwest::Client,
}

impl DependencyConfusionPlugin {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DependencyConfusionPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Declared {
    ecosystem: &'static str,
    name: String,
    manifest: PathBuf,
}

#[async_trait::async_trait]
impl Plugin for DependencyConfusionPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            plugin_id: "dependency-confusion".to_string(),
            name: "Dependency Confusion Scanner".to_string(),
            version: "1.0.0".to_string(),
            author: "GSAST Team".to_string(),
            description: "Detects potential dependency confusion vulnerabilities in package manifests".to_string(),
        }
    }

    fn requirements(&self) -> Vec<Requirement> {
        vec![]
    }

    fn validate(&self, _args: &RunArgs) -> Result<(), String> {
        Ok(())
    }

    async fn run(
        &self,
        project_sources_dir: &Path,
        _scan_cwd: &Path,
        _args: &RunArgs,
    ) -> Result<Option<HashMap<String, PathBuf>>, PluginError> {
        let declared = find_config_files(project_sources_dir)
            .await
            .map_err(|e| PluginError(e.to_string()))?;

        let mut unclaimed = Vec::new();
        let mut seen = HashSet::new();
        for dep in &declared {
            if !seen.insert((dep.ecosystem, dep.name.clone())) {
                continue;
            }
            if !self.is_claimed(dep).await {
                unclaimed.push(dep.clone());
            }
        }

        if unclaimed.is_empty() {
            return Ok(None);
        }

        let doc = to_sarif(&unclaimed, project_sources_dir);
        let path = write_sarif_to_temp(project_sources_dir, &doc).await?;
        let mut out = HashMap::new();
        out.insert("dependency-confusion".to_string(), path);
        Ok(Some(out))
    }
}

impl DependencyConfusionPlugin {
    async fn is_claimed(&self, dep: &Declared) -> bool {
        let url = match dep.ecosystem {
            "npm" => format!("https://registry.npmjs.org/{}", dep.name.replace('/', "%2F")),
            "pypi" => format!("https://pypi.org/pypi/{}/json", dep.name),
            _ => return true,
        };
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            // A network failure shouldn't manufacture a false positive.
            Err(_) => true,
        }
    }
}

async fn find_config_files(root: &Path) -> std::io::Result<Vec<Declared>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if entry.file_name() != ".git" && entry.file_name() != "node_modules" {
                    stack.push(path);
                }
                continue;
            }
            match entry.file_name().to_str() {
                Some("package.json") => found.extend(parse_package_json(&path).await?),
                Some("requirements.txt") => found.extend(parse_requirements_txt(&path).await?),
                _ => {}
            }
        }
    }
    Ok(found)
}

async fn parse_package_json(path: &Path) -> std::io::Result<Vec<Declared>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let Ok(doc) = serde_json::from_str::<Value>(&raw) else {
        return Ok(vec![]);
    };
    let mut out = Vec::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(deps) = doc.get(section).and_then(Value::as_object) {
            for name in deps.keys() {
                out.push(Declared {
                    ecosystem: "npm",
                    name: name.clone(),
                    manifest: path.to_path_buf(),
                });
            }
        }
    }
    Ok(out)
}

async fn parse_requirements_txt(path: &Path) -> std::io::Result<Vec<Declared>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        let name = line
            .split(|c: char| ['=', '<', '>', '~', '!', '[', ';'].contains(&c))
            .next()
            .unwrap_or(line)
            .trim();
        if name.is_empty() {
            continue;
        }
        out.push(Declared {
            ecosystem: "pypi",
            name: name.to_string(),
            manifest: path.to_path_buf(),
        });
    }
    Ok(out)
}

fn to_sarif(unclaimed: &[Declared], project_sources_dir: &Path) -> Value {
    let results: Vec<Value> = unclaimed
        .iter()
        .map(|dep| {
            let relative = dep
                .manifest
                .strip_prefix(project_sources_dir)
                .unwrap_or(&dep.manifest)
                .to_string_lossy()
                .into_owned();
            serde_json::json!({
                "ruleId": format!("unclaimed-{}-package", dep.ecosystem),
                "message": {
                    "text": format!(
                        "Package '{}' declared in {} is not claimed on the public {} registry and could be hijacked via dependency confusion",
                        dep.name, relative, dep.ecosystem
                    )
                },
                "locations": [{
                    "physicalLocation": { "artifactLocation": { "uri": relative } }
                }],
                "properties": { "package": dep.name, "ecosystem": dep.ecosystem }
            })
        })
        .collect();

    serde_json::json!({
        "$schema": "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/master/Schemata/sarif-schema-2.1.0.json",
        "version": "2.1.0",
        "runs": [{
            "tool": { "driver": { "name": "Dependency Confusion Scanner" } },
            "results": results
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn finds_package_json_dependencies() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"left-pad": "1.0.0"}, "devDependencies": {"jest": "29.0.0"}}"#,
        )
        .unwrap();
        let declared = find_config_files(dir.path()).await.unwrap();
        assert_eq!(declared.len(), 2);
        assert!(declared.iter().any(|d| d.name == "left-pad" && d.ecosystem == "npm"));
    }

    #[tokio::test]
    async fn finds_requirements_txt_dependencies() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "requests==2.31.0\n# comment\nflask>=2.0\n").unwrap();
        let declared = find_config_files(dir.path()).await.unwrap();
        assert_eq!(declared.len(), 2);
        assert!(declared.iter().any(|d| d.name == "requests"));
        assert!(declared.iter().any(|d| d.name == "flask"));
    }

    #[tokio::test]
    async fn skips_node_modules_and_git_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/nested")).unwrap();
        std::fs::write(dir.path().join("node_modules/nested/package.json"), r#"{"dependencies": {"x": "1"}}"#).unwrap();
        let declared = find_config_files(dir.path()).await.unwrap();
        assert!(declared.is_empty());
    }
}
