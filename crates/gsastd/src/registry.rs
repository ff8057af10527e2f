//! Plugin registry: `plugin_id`-keyed scanner plugins and the requirement
//! negotiation / SARIF-gating contract they're invoked through.
//!
//! The reference implementation discovers plugins via Python entry points
//! (`gsast.scanners`); that mechanism has no portable Rust equivalent, so
//! this registry uses explicit static registration instead — a
//! redesign decision, not a behavior change (the contract each plugin
//! satisfies is identical).

use crate::sarif;
use gsast_core::ScannerId;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown plugin id: {0}")]
    UnknownPlugin(String),
    #[error("plugin {plugin_id} requirement unmet: {reason}")]
    RequirementUnmet { plugin_id: String, reason: String },
    #[error("plugin {plugin_id} crashed: {source}")]
    PluginCrashed {
        plugin_id: String,
        #[source]
        source: anyhow_like::PluginError,
    },
}

/// A minimal stand-in for `anyhow::Error` scoped to this module, so plugin
/// bodies can surface arbitrary failure causes without a new workspace
/// dependency: plugin execution failures are I/O or subprocess errors, which
/// `std::io::Error` already represents.
pub mod anyhow_like {
    use std::fmt;

    #[derive(Debug)]
    pub struct PluginError(pub String);

    impl fmt::Display for PluginError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for PluginError {}

    impl From<std::io::Error> for PluginError {
        fn from(e: std::io::Error) -> Self {
            Self(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A named precondition a plugin declares, driving kwarg assembly and clone
/// strategy (e.g. `rule_files`, `rules_dir`, `full_git_history`).
#[derive(Debug, Clone)]
pub struct Requirement {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginMetadata {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
}

/// Keyword arguments assembled by the worker for a single plugin invocation.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub rules_dir: Option<std::path::PathBuf>,
    pub rule_files: Vec<(String, Vec<u8>)>,
}

/// The capability set every scanner plugin implements.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;
    fn requirements(&self) -> Vec<Requirement>;

    /// Pure precondition check; does not execute the scanner.
    fn validate(&self, args: &RunArgs) -> std::result::Result<(), String> {
        for req in self.requirements() {
            if req.required && req.name == "rules_dir" && args.rules_dir.is_none() {
                return Err(format!("missing required rules_dir for {}", req.name));
            }
        }
        Ok(())
    }

    /// Execute the scanner, returning a mapping of rule id to SARIF file path,
    /// or `None` if the scanner produced no results.
    async fn run(
        &self,
        project_sources_dir: &Path,
        scan_cwd: &Path,
        args: &RunArgs,
    ) -> std::result::Result<Option<HashMap<String, std::path::PathBuf>>, anyhow_like::PluginError>;
}

/// Registry of plugins keyed by stable `plugin_id`. First registration wins
/// on an id collision; later attempts are rejected with a warning, matching
/// `PluginManager._load_plugins`.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Returns `false` (and logs a warning) if a plugin
    /// with the same id is already registered.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> bool {
        let id = plugin.metadata().plugin_id;
        if self.plugins.contains_key(&id) {
            tracing::warn!(plugin_id = %id, "duplicate plugin registration ignored, first wins");
            return false;
        }
        self.plugins.insert(id, plugin);
        true
    }

    pub fn list(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&dyn Plugin> {
        self.plugins.get(id).map(|b| b.as_ref())
    }

    pub fn metadata(&self, id: &str) -> Result<PluginMetadata> {
        self.get(id)
            .map(|p| p.metadata())
            .ok_or_else(|| RegistryError::UnknownPlugin(id.to_string()))
    }

    pub fn requirements(&self, ids: &[ScannerId]) -> HashMap<String, Vec<Requirement>> {
        ids.iter()
            .filter_map(|id| self.get(id.as_str()).map(|p| (id.to_string(), p.requirements())))
            .collect()
    }

    /// `true` if any of the given plugins declares a required `full_git_history`.
    pub fn needs_full_git_history(&self, ids: &[ScannerId]) -> bool {
        ids.iter().any(|id| {
            self.get(id.as_str())
                .map(|p| {
                    p.requirements()
                        .iter()
                        .any(|r| r.name == "full_git_history" && r.required)
                })
                .unwrap_or(false)
        })
    }

    /// `true` if any of the given plugins declares a required `rules_dir`.
    pub fn needs_rules(&self, ids: &[ScannerId]) -> bool {
        ids.iter().any(|id| {
            self.get(id.as_str())
                .map(|p| {
                    p.requirements()
                        .iter()
                        .any(|r| r.name == "rules_dir" && r.required)
                })
                .unwrap_or(false)
        })
    }

    /// Validate requirements for a set of plugins against shared args. Fails
    /// on the first failing plugin, matching `validate_plugin_requirements`.
    pub fn validate(&self, ids: &[ScannerId], args: &RunArgs) -> Result<()> {
        for id in ids {
            let plugin = self
                .get(id.as_str())
                .ok_or_else(|| RegistryError::UnknownPlugin(id.to_string()))?;
            if let Err(reason) = plugin.validate(args) {
                return Err(RegistryError::RequirementUnmet {
                    plugin_id: id.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Run a plugin, then gate + standardize every returned SARIF file.
    /// Files that fail the gate are dropped (logged), not fatal; a plugin
    /// crash (propagated `Err`) is surfaced to the caller as-is, becoming a
    /// job-aborting `PluginCrashed` condition at the worker layer.
    pub async fn run(
        &self,
        id: &ScannerId,
        project_sources_dir: &Path,
        scan_cwd: &Path,
        args: &RunArgs,
    ) -> Result<Option<HashMap<String, std::path::PathBuf>>> {
        let plugin = self
            .get(id.as_str())
            .ok_or_else(|| RegistryError::UnknownPlugin(id.to_string()))?;

        if let Err(reason) = plugin.validate(args) {
            return Err(RegistryError::RequirementUnmet {
                plugin_id: id.to_string(),
                reason,
            });
        }

        let raw = plugin
            .run(project_sources_dir, scan_cwd, args)
            .await
            .map_err(|source| RegistryError::PluginCrashed {
                plugin_id: id.to_string(),
                source,
            })?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let metadata = plugin.metadata();
        let attempted = raw.len();
        let mut validated = HashMap::new();
        for (rule_name, path) in raw {
            match sarif::validate_and_standardize_file(&path, &metadata) {
                Ok(()) => {
                    validated.insert(rule_name, path);
                }
                Err(e) => {
                    tracing::warn!(
                        plugin_id = %id,
                        rule_name = %rule_name,
                        error = %e,
                        "dropping rule result: sarif gate rejected output"
                    );
                }
            }
        }

        if validated.len() != attempted {
            tracing::warn!(
                plugin_id = %id,
                kept = validated.len(),
                attempted,
                "some rule results were dropped by the sarif gate"
            );
        }

        Ok(Some(validated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubPlugin {
        id: &'static str,
        reqs: Vec<Requirement>,
    }

    #[async_trait::async_trait]
    impl Plugin for StubPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                plugin_id: self.id.to_string(),
                name: self.id.to_string(),
                version: "0".to_string(),
                author: "test".to_string(),
                description: String::new(),
            }
        }

        fn requirements(&self) -> Vec<Requirement> {
            self.reqs.clone()
        }

        async fn run(
            &self,
            _project_sources_dir: &Path,
            _scan_cwd: &Path,
            _args: &RunArgs,
        ) -> std::result::Result<Option<HashMap<String, std::path::PathBuf>>, anyhow_like::PluginError>
        {
            Ok(None)
        }
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let mut registry = PluginRegistry::new();
        assert!(registry.register(Box::new(StubPlugin { id: "semgrep", reqs: vec![] })));
        assert!(!registry.register(Box::new(StubPlugin { id: "semgrep", reqs: vec![] })));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn needs_full_git_history_true_when_required() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(StubPlugin {
            id: "trufflehog",
            reqs: vec![Requirement {
                name: "full_git_history",
                required: true,
                description: "",
            }],
        }));
        assert!(registry.needs_full_git_history(&[ScannerId::Trufflehog]));
    }

    #[test]
    fn needs_full_git_history_false_when_absent() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(StubPlugin { id: "semgrep", reqs: vec![] }));
        assert!(!registry.needs_full_git_history(&[ScannerId::Semgrep]));
    }

    #[test]
    fn unknown_plugin_errors_on_metadata_lookup() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.metadata("nope"),
            Err(RegistryError::UnknownPlugin(_))
        ));
    }
}
