//! Core data model shared between the daemon and the CLI client.
//!
//! These types mirror the GSAST data model: scan identity, repository
//! descriptors, rule files, scan records, jobs, and stored results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A scan identifier, e.g. `SCAN-2026-07-27-14-03-21`.
///
/// Sortable and immutable once minted: the timestamp encoding keeps
/// lexicographic order equal to chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub String);

impl ScanId {
    /// Mint a new scan id from the current time.
    pub fn new() -> Self {
        Self(Utc::now().format("SCAN-%Y-%m-%d-%H-%M-%S").to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ScanId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Scan lifecycle status. Monotone: `started -> {completed | failed}`, never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Started,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle status, as surfaced by the tasks queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Deferred,
    Scheduled,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Deferred => "deferred",
            Self::Scheduled => "scheduled",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal states: `finished`, `failed`, `canceled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable scanner plugin identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScannerId {
    Semgrep,
    Trufflehog,
    DependencyConfusion,
}

impl ScannerId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semgrep => "semgrep",
            Self::Trufflehog => "trufflehog",
            Self::DependencyConfusion => "dependency-confusion",
        }
    }
}

impl fmt::Display for ScannerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ScannerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semgrep" => Ok(Self::Semgrep),
            "trufflehog" => Ok(Self::Trufflehog),
            "dependency-confusion" => Ok(Self::DependencyConfusion),
            other => Err(format!("unknown scanner id: {other}")),
        }
    }
}

/// Descriptor for a repository yielded by a repository source, in the uniform
/// shape the coordinator and worker consume regardless of provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    pub auth_clone_url: String,
    pub web_url: String,
    pub size_mb: u64,
    pub archived: bool,
    pub is_fork: bool,
    pub personal: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub owner: String,
    pub private: bool,
}

/// A rule file uploaded for a scan. Stored under `RULE(scan_id, relative_path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFile {
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

impl RuleFile {
    pub const ALLOWED_EXTENSIONS: [&'static str; 3] = ["yaml", "yml", "json"];

    pub fn has_allowed_extension(&self) -> bool {
        std::path::Path::new(&self.relative_path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| Self::ALLOWED_EXTENSIONS.contains(&ext))
    }
}

/// Build a rule key of the form `<scan_id>:<relative_path>`.
pub fn rule_key(scan_id: &ScanId, relative_path: &str) -> String {
    format!("{scan_id}:{relative_path}")
}

/// Split a rule key back into `(scan_id, relative_path)`.
///
/// Splits only on the first colon: a relative path may itself legitimately
/// contain colons, so naively splitting on every colon would reject those keys.
pub fn split_rule_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// The single-owner-writer scan record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan_id: ScanId,
    pub message: String,
    pub jobs: HashMap<String, u64>,
    pub status: ScanStatus,
}

impl ScanRecord {
    pub fn new(scan_id: ScanId) -> Self {
        Self {
            scan_id,
            message: "Scan initiated successfully".to_string(),
            jobs: HashMap::new(),
            status: ScanStatus::Started,
        }
    }
}

/// A unit of work dispatched to the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub scan_id: ScanId,
    pub clone_url_auth: String,
    pub clone_url_web: String,
    pub rule_keys: Vec<String>,
    pub scanner_ids: Vec<ScannerId>,
    pub timeout_secs: u64,
    pub result_ttl_secs: u64,
    pub description: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Results for a single project, keyed by scanner id, stored under
/// `scan_id:results:<project_url>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectResults {
    pub results: HashMap<String, serde_json::Value>,
    pub project_url: String,
    pub scanner_type: String,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_id_format_is_sortable() {
        let id = ScanId::from_string("SCAN-2026-07-27-14-03-21");
        assert_eq!(id.as_str(), "SCAN-2026-07-27-14-03-21");
        let earlier = ScanId::from_string("SCAN-2026-07-27-09-00-00");
        assert!(earlier < id);
    }

    #[test]
    fn scan_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ScanStatus::Started).unwrap(),
            "\"started\""
        );
        assert_eq!(
            serde_json::to_string(&ScanStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn scanner_id_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ScannerId::DependencyConfusion).unwrap(),
            "\"dependency-confusion\""
        );
    }

    #[test]
    fn job_status_terminal_states() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
    }

    #[test]
    fn rule_key_round_trips() {
        let scan_id = ScanId::from_string("SCAN-2026-07-27-00-00-00");
        let key = rule_key(&scan_id, "rules/secrets.yaml");
        assert_eq!(key, "SCAN-2026-07-27-00-00-00:rules/secrets.yaml");
        assert_eq!(
            split_rule_key(&key),
            Some(("SCAN-2026-07-27-00-00-00", "rules/secrets.yaml"))
        );
    }

    #[test]
    fn rule_key_with_colon_in_path_splits_on_first_colon_only() {
        // A relative path containing a colon must not break key decoding.
        let key = "SCAN-2026-07-27-00-00-00:weird:path/rule.yaml";
        assert_eq!(
            split_rule_key(key),
            Some(("SCAN-2026-07-27-00-00-00", "weird:path/rule.yaml"))
        );
    }

    #[test]
    fn rule_file_extension_check() {
        let yaml = RuleFile {
            relative_path: "rules/a.yaml".into(),
            bytes: vec![],
        };
        let txt = RuleFile {
            relative_path: "rules/a.txt".into(),
            bytes: vec![],
        };
        assert!(yaml.has_allowed_extension());
        assert!(!txt.has_allowed_extension());
    }
}
