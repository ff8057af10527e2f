//! `GSASTConfig`: the per-scan request payload parsed from `POST /scan`.
//!
//! Validation mirrors the original dataclass `__post_init__` checks exactly,
//! including the asymmetry between providers: GitHub requires at least one of
//! `organizations`/`repositories`, GitLab has no equivalent minimum.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("base_url must be a non-empty http:// or https:// URL")]
    InvalidBaseUrl,
    #[error("missing required field: target")]
    MissingTarget,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("gitlab target must not specify organizations")]
    GitLabForbidsOrganizations,
    #[error("github target must not specify groups")]
    GitHubForbidsGroups,
    #[error("github target requires at least one of organizations or repositories")]
    GitHubRequiresTarget,
    #[error("max_repo_mb_size must be non-negative")]
    NegativeMaxRepoSize,
    #[error("last_commit_max_age must be non-negative")]
    NegativeCommitAge,
    #[error("invalid regex {pattern}: {error}")]
    InvalidRegex { pattern: String, error: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Github,
    Gitlab,
}

/// Scan target, tagged by provider. Constructed only through [`Target::validated`],
/// so an in-memory `Target` is always internally consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum Target {
    Github {
        #[serde(skip_serializing_if = "Option::is_none")]
        organizations: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repositories: Option<Vec<String>>,
    },
    Gitlab {
        #[serde(skip_serializing_if = "Option::is_none")]
        groups: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        repositories: Option<Vec<String>>,
    },
}

/// Raw wire shape of the `target` object, matched against the original's
/// flat dataclass fields before the provider-specific variant is built.
#[derive(Debug, Clone, Deserialize)]
struct RawTarget {
    provider: String,
    #[serde(default)]
    organizations: Option<Vec<String>>,
    #[serde(default)]
    groups: Option<Vec<String>>,
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

fn clean(list: Option<Vec<String>>) -> Option<Vec<String>> {
    match list {
        Some(v) if v.is_empty() => None,
        other => other,
    }
}

impl Target {
    fn from_raw(raw: RawTarget) -> Result<Self> {
        let organizations = clean(raw.organizations);
        let groups = clean(raw.groups);
        let repositories = clean(raw.repositories);

        match raw.provider.as_str() {
            "github" => {
                if groups.is_some() {
                    return Err(ConfigError::GitHubForbidsGroups);
                }
                if organizations.is_none() && repositories.is_none() {
                    return Err(ConfigError::GitHubRequiresTarget);
                }
                Ok(Target::Github {
                    organizations,
                    repositories,
                })
            }
            "gitlab" => {
                if organizations.is_some() {
                    return Err(ConfigError::GitLabForbidsOrganizations);
                }
                // Note: unlike GitHub, GitLab has no "must specify at least one of
                // groups/repositories" requirement. This asymmetry is intentional,
                // preserved from the reference implementation.
                Ok(Target::Gitlab {
                    groups,
                    repositories,
                })
            }
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Target::Github { .. } => Provider::Github,
            Target::Gitlab { .. } => Provider::Gitlab,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default)]
    pub is_archived: Option<bool>,
    #[serde(default)]
    pub is_fork: Option<bool>,
    #[serde(default)]
    pub is_personal_project: Option<bool>,
    #[serde(default)]
    pub max_repo_mb_size: Option<i64>,
    #[serde(default)]
    pub last_commit_max_age: Option<i64>,
    #[serde(default)]
    pub ignore_path_regexes: Option<Vec<String>>,
    #[serde(default)]
    pub must_path_regexes: Option<Vec<String>>,
}

impl FiltersConfig {
    fn validate(&self) -> Result<()> {
        if let Some(size) = self.max_repo_mb_size {
            if size < 0 {
                return Err(ConfigError::NegativeMaxRepoSize);
            }
        }
        if let Some(age) = self.last_commit_max_age {
            if age < 0 {
                return Err(ConfigError::NegativeCommitAge);
            }
        }
        for pattern in self
            .ignore_path_regexes
            .iter()
            .chain(self.must_path_regexes.iter())
            .flatten()
        {
            if let Err(e) = regex_lite_check(pattern) {
                return Err(ConfigError::InvalidRegex {
                    pattern: pattern.clone(),
                    error: e,
                });
            }
        }
        Ok(())
    }
}

/// Validate a regex pattern compiles, without pulling the `regex` crate into
/// `gsast-core` purely for a validity check; the daemon's filter evaluation
/// uses the `regex` crate directly where it actually matches paths.
fn regex_lite_check(pattern: &str) -> std::result::Result<(), String> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScannerName {
    Semgrep,
    Trufflehog,
    #[serde(rename = "dependency-confusion")]
    DependencyConfusion,
}

#[derive(Debug, Clone, Deserialize)]
struct RawGsastConfig {
    base_url: String,
    #[serde(default)]
    api_secret_key: Option<String>,
    target: RawTarget,
    #[serde(default)]
    filters: Option<FiltersConfig>,
    #[serde(default)]
    scanners: Option<Vec<ScannerName>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GsastConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret_key: Option<String>,
    pub target: Target,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<FiltersConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanners: Option<Vec<ScannerName>>,
}

impl GsastConfig {
    /// Parse and validate a config payload from JSON, matching
    /// `GSASTConfig.from_dict` semantics exactly (missing `target` is an
    /// error, not a default).
    pub fn from_json(data: &serde_json::Value) -> Result<Self> {
        let raw: RawGsastConfig =
            serde_json::from_value(data.clone()).map_err(|_| ConfigError::MissingTarget)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawGsastConfig) -> Result<Self> {
        let base_url = raw.base_url.trim().to_string();
        if base_url.is_empty()
            || !(base_url.starts_with("http://") || base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidBaseUrl);
        }

        let target = Target::from_raw(raw.target)?;

        if let Some(filters) = &raw.filters {
            filters.validate()?;
        }

        let scanners = match raw.scanners {
            Some(v) if v.is_empty() => None,
            other => other,
        };

        Ok(Self {
            base_url,
            api_secret_key: raw.api_secret_key,
            target,
            filters: raw.filters,
            scanners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn github_requires_organizations_or_repositories() {
        let payload = json!({
            "base_url": "https://gsast.example.com",
            "target": { "provider": "github" }
        });
        let err = GsastConfig::from_json(&payload).unwrap_err();
        assert_eq!(err, ConfigError::GitHubRequiresTarget);
    }

    #[test]
    fn github_forbids_groups() {
        let payload = json!({
            "base_url": "https://gsast.example.com",
            "target": { "provider": "github", "organizations": ["acme"], "groups": ["x"] }
        });
        let err = GsastConfig::from_json(&payload).unwrap_err();
        assert_eq!(err, ConfigError::GitHubForbidsGroups);
    }

    #[test]
    fn gitlab_forbids_organizations() {
        let payload = json!({
            "base_url": "https://gsast.example.com",
            "target": { "provider": "gitlab", "organizations": ["acme"] }
        });
        let err = GsastConfig::from_json(&payload).unwrap_err();
        assert_eq!(err, ConfigError::GitLabForbidsOrganizations);
    }

    #[test]
    fn gitlab_has_no_minimum_target_requirement() {
        // Unlike GitHub, an empty GitLab target (no groups, no repositories) is valid.
        let payload = json!({
            "base_url": "https://gsast.example.com",
            "target": { "provider": "gitlab" }
        });
        assert!(GsastConfig::from_json(&payload).is_ok());
    }

    #[test]
    fn base_url_must_have_scheme() {
        let payload = json!({
            "base_url": "gsast.example.com",
            "target": { "provider": "gitlab", "groups": ["g"] }
        });
        let err = GsastConfig::from_json(&payload).unwrap_err();
        assert_eq!(err, ConfigError::InvalidBaseUrl);
    }

    #[test]
    fn negative_filter_values_rejected() {
        let payload = json!({
            "base_url": "https://gsast.example.com",
            "target": { "provider": "github", "repositories": ["a/b"] },
            "filters": { "max_repo_mb_size": -1 }
        });
        let err = GsastConfig::from_json(&payload).unwrap_err();
        assert_eq!(err, ConfigError::NegativeMaxRepoSize);
    }

    #[test]
    fn invalid_regex_rejected() {
        let payload = json!({
            "base_url": "https://gsast.example.com",
            "target": { "provider": "github", "repositories": ["a/b"] },
            "filters": { "ignore_path_regexes": ["["] }
        });
        assert!(matches!(
            GsastConfig::from_json(&payload),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn empty_scanners_list_becomes_none() {
        let payload = json!({
            "base_url": "https://gsast.example.com",
            "target": { "provider": "github", "repositories": ["a/b"] },
            "scanners": []
        });
        let cfg = GsastConfig::from_json(&payload).unwrap();
        assert!(cfg.scanners.is_none());
    }
}
