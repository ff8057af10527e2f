//! Repository sources: enumerate repositories for a scan target and realize
//! them onto disk. GitHub/GitLab enumeration talks to each provider's REST
//! API directly (no vendored SDK); `download` always funnels through
//! `git::clone`.

use crate::git::{self, GitError};
use chrono::{DateTime, Utc};
use gsast_core::{FiltersConfig, RepositoryDescriptor, Target};
use regex::Regex;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoSourceError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0} requires the {1} environment variable")]
    MissingToken(&'static str, &'static str),
    #[error("no repositories specified in the target configuration")]
    NoTarget,
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("invalid filter regex {pattern}: {error}")]
    InvalidRegex { pattern: String, error: String },
}

pub type Result<T> = std::result::Result<T, RepoSourceError>;

/// A uniform contract over GitHub/GitLab enumeration and cloning, so the
/// coordinator and worker don't need to know which provider a scan targets.
#[async_trait::async_trait]
pub trait RepositorySource: Send + Sync {
    async fn fetch_repositories(&self, target: &Target, filters: Option<&FiltersConfig>) -> Result<Vec<RepositoryDescriptor>>;

    /// Clone a previously-fetched repository into `dest`.
    async fn download(&self, repo: &RepositoryDescriptor, dest: &Path, shallow: bool, timeout_secs: u64) -> Result<()> {
        git::clone(&repo.auth_clone_url, dest, shallow, timeout_secs).await?;
        Ok(())
    }
}

/// Apply the comprehensive filter set, matching `_should_include_repo`
/// exactly: archived/fork/personal/size/age are hard excludes, `ignore_path_regexes`
/// excludes a match, `must_path_regexes` requires at least one match when present.
pub fn should_include(filters: Option<&FiltersConfig>, repo: &RepositoryDescriptor) -> Result<bool> {
    let Some(filters) = filters else {
        return Ok(true);
    };

    if let Some(want) = filters.is_archived {
        if repo.archived != want {
            return Ok(false);
        }
    }
    if let Some(want) = filters.is_fork {
        if repo.is_fork != want {
            return Ok(false);
        }
    }
    if let Some(want) = filters.is_personal_project {
        if repo.personal != want {
            return Ok(false);
        }
    }
    if let Some(max_mb) = filters.max_repo_mb_size {
        if repo.size_mb as i64 > max_mb {
            return Ok(false);
        }
    }
    if let Some(max_age_days) = filters.last_commit_max_age {
        if let Some(last_activity) = repo.last_activity {
            let days_since = (Utc::now() - last_activity).num_days();
            if days_since > max_age_days {
                return Ok(false);
            }
        }
    }
    if let Some(patterns) = &filters.ignore_path_regexes {
        for pattern in patterns {
            let re = compile(pattern)?;
            if re.is_match(&repo.full_name) {
                return Ok(false);
            }
        }
    }
    if let Some(patterns) = &filters.must_path_regexes {
        let mut matched = false;
        for pattern in patterns {
            let re = compile(pattern)?;
            if re.is_match(&repo.full_name) {
                matched = true;
                break;
            }
        }
        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| RepoSourceError::InvalidRegex {
        pattern: pattern.to_string(),
        error: e.to_string(),
    })
}

pub struct GitHubSource {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubSource {
    pub fn new() -> Result<Self> {
        let token = std::env::var("GITHUB_API_TOKEN")
            .map_err(|_| RepoSourceError::MissingToken("GitHub provider", "GITHUB_API_TOKEN"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: "https://api.github.com".to_string(),
            token,
        })
    }

    async fn list_org_repos(&self, org: &str) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/orgs/{}/repos?per_page=100", self.api_base, org);
        self.paginate(&url).await
    }

    async fn get_repo(&self, full_name: &str) -> Result<Option<serde_json::Value>> {
        let url = format!("{}/repos/{}", self.api_base, full_name);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("User-Agent", "gsastd")
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    async fn paginate(&self, url: &str) -> Result<Vec<serde_json::Value>> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(page_url) = next {
            let resp = self
                .client
                .get(&page_url)
                .bearer_auth(&self.token)
                .header("User-Agent", "gsastd")
                .send()
                .await?
                .error_for_status()?;
            next = next_page_link(resp.headers());
            let page: Vec<serde_json::Value> = resp.json().await?;
            items.extend(page);
        }
        Ok(items)
    }

    fn convert(&self, repo: &serde_json::Value) -> RepositoryDescriptor {
        let clone_url = repo["clone_url"].as_str().unwrap_or_default().to_string();
        let auth_clone_url = if clone_url.starts_with("https://github.com/") {
            clone_url.replacen("https://github.com/", &format!("https://{}@github.com/", self.token), 1)
        } else {
            clone_url.clone()
        };
        RepositoryDescriptor {
            name: repo["name"].as_str().unwrap_or_default().to_string(),
            full_name: repo["full_name"].as_str().unwrap_or_default().to_string(),
            clone_url,
            auth_clone_url,
            web_url: repo["html_url"].as_str().unwrap_or_default().to_string(),
            size_mb: repo["size"].as_u64().unwrap_or(0) / 1024,
            archived: repo["archived"].as_bool().unwrap_or(false),
            is_fork: repo["fork"].as_bool().unwrap_or(false),
            personal: repo["owner"]["type"].as_str() == Some("User"),
            last_activity: repo["pushed_at"].as_str().and_then(parse_timestamp),
            created_at: repo["created_at"].as_str().and_then(parse_timestamp),
            owner: repo["owner"]["login"].as_str().unwrap_or_default().to_string(),
            private: repo["private"].as_bool().unwrap_or(false),
        }
    }
}

#[async_trait::async_trait]
impl RepositorySource for GitHubSource {
    async fn fetch_repositories(&self, target: &Target, filters: Option<&FiltersConfig>) -> Result<Vec<RepositoryDescriptor>> {
        let Target::Github { organizations, repositories } = target else {
            return Err(RepoSourceError::NoTarget);
        };

        let mut raw = Vec::new();
        if let Some(orgs) = organizations {
            for org in orgs {
                raw.extend(self.list_org_repos(org).await?);
            }
        }
        if let Some(repos) = repositories {
            for full_name in repos {
                match self.get_repo(full_name).await {
                    Ok(Some(repo)) => raw.push(repo),
                    Ok(None) => tracing::warn!(repo = %full_name, "repository not found"),
                    Err(e) => tracing::warn!(repo = %full_name, error = %e, "could not fetch repository"),
                }
            }
        }
        if organizations.is_none() && repositories.is_none() {
            return Err(RepoSourceError::NoTarget);
        }

        let mut out = Vec::new();
        for item in &raw {
            let descriptor = self.convert(item);
            if should_include(filters, &descriptor)? {
                out.push(descriptor);
            }
        }
        Ok(out)
    }
}

pub struct GitLabSource {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitLabSource {
    pub fn new() -> Result<Self> {
        let token = std::env::var("GITLAB_API_TOKEN")
            .map_err(|_| RepoSourceError::MissingToken("GitLab provider", "GITLAB_API_TOKEN"))?;
        let api_base = std::env::var("GITLAB_URL").unwrap_or_else(|_| "https://gitlab.com".to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            api_base,
            token,
        })
    }

    async fn list_group_repos(&self, group: &str) -> Result<Vec<serde_json::Value>> {
        let url = format!(
            "{}/api/v4/groups/{}/projects?per_page=100&include_subgroups=true",
            self.api_base,
            urlencoding_encode(group)
        );
        self.paginate(&url).await
    }

    async fn get_project(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let url = format!("{}/api/v4/projects/{}", self.api_base, urlencoding_encode(path));
        let resp = self
            .client
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    async fn paginate(&self, url: &str) -> Result<Vec<serde_json::Value>> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(page_url) = next {
            let resp = self
                .client
                .get(&page_url)
                .header("PRIVATE-TOKEN", &self.token)
                .send()
                .await?
                .error_for_status()?;
            next = next_page_link(resp.headers());
            let page: Vec<serde_json::Value> = resp.json().await?;
            items.extend(page);
        }
        Ok(items)
    }

    fn convert(&self, repo: &serde_json::Value) -> RepositoryDescriptor {
        let clone_url = repo["http_url_to_repo"].as_str().unwrap_or_default().to_string();
        let auth_clone_url = if clone_url.starts_with("https://") {
            clone_url.replacen("https://", &format!("https://oauth2:{}@", self.token), 1)
        } else {
            clone_url.clone()
        };
        RepositoryDescriptor {
            name: repo["name"].as_str().unwrap_or_default().to_string(),
            full_name: repo["path_with_namespace"].as_str().unwrap_or_default().to_string(),
            clone_url,
            auth_clone_url,
            web_url: repo["web_url"].as_str().unwrap_or_default().to_string(),
            size_mb: repo["statistics"]["repository_size"].as_u64().unwrap_or(0) / (1024 * 1024),
            archived: repo["archived"].as_bool().unwrap_or(false),
            is_fork: repo["forked_from_project"].is_object(),
            personal: repo["namespace"]["kind"].as_str() == Some("user"),
            last_activity: repo["last_activity_at"].as_str().and_then(parse_timestamp),
            created_at: repo["created_at"].as_str().and_then(parse_timestamp),
            owner: repo["namespace"]["full_path"].as_str().unwrap_or_default().to_string(),
            private: repo["visibility"].as_str() != Some("public"),
        }
    }
}

#[async_trait::async_trait]
impl RepositorySource for GitLabSource {
    async fn fetch_repositories(&self, target: &Target, filters: Option<&FiltersConfig>) -> Result<Vec<RepositoryDescriptor>> {
        let Target::Gitlab { groups, repositories } = target else {
            return Err(RepoSourceError::NoTarget);
        };

        let mut raw = Vec::new();
        if let Some(groups) = groups {
            for group in groups {
                raw.extend(self.list_group_repos(group).await?);
            }
        }
        if let Some(repos) = repositories {
            for path in repos {
                match self.get_project(path).await {
                    Ok(Some(repo)) => raw.push(repo),
                    Ok(None) => tracing::warn!(repo = %path, "project not found"),
                    Err(e) => tracing::warn!(repo = %path, error = %e, "could not fetch project"),
                }
            }
        }

        let mut out = Vec::new();
        for item in &raw {
            let descriptor = self.convert(item);
            if should_include(filters, &descriptor)? {
                out.push(descriptor);
            }
        }
        Ok(out)
    }
}

fn urlencoding_encode(s: &str) -> String {
    s.replace('/', "%2F")
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn next_page_link(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    for part in link.split(',') {
        let mut pieces = part.split(';');
        let url_part = pieces.next()?.trim();
        let rel_part = pieces.next()?.trim();
        if rel_part.contains("rel=\"next\"") {
            return Some(url_part.trim_start_matches('<').trim_end_matches('>').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(archived: bool, is_fork: bool, size_mb: u64, full_name: &str) -> RepositoryDescriptor {
        RepositoryDescriptor {
            name: "x".into(),
            full_name: full_name.into(),
            clone_url: "https://github.com/acme/x.git".into(),
            auth_clone_url: "https://github.com/acme/x.git".into(),
            web_url: "https://github.com/acme/x".into(),
            size_mb,
            archived,
            is_fork,
            personal: false,
            last_activity: None,
            created_at: None,
            owner: "acme".into(),
            private: false,
        }
    }

    #[test]
    fn no_filters_includes_everything() {
        let r = repo(true, true, 1000, "acme/x");
        assert!(should_include(None, &r).unwrap());
    }

    #[test]
    fn archived_filter_excludes_mismatch() {
        let r = repo(true, false, 10, "acme/x");
        let filters = FiltersConfig {
            is_archived: Some(false),
            ..Default::default()
        };
        assert!(!should_include(Some(&filters), &r).unwrap());
    }

    #[test]
    fn max_size_filter_excludes_oversized_repo() {
        let r = repo(false, false, 500, "acme/x");
        let filters = FiltersConfig {
            max_repo_mb_size: Some(100),
            ..Default::default()
        };
        assert!(!should_include(Some(&filters), &r).unwrap());
    }

    #[test]
    fn ignore_path_regex_excludes_match() {
        let r = repo(false, false, 10, "acme/legacy-archive");
        let filters = FiltersConfig {
            ignore_path_regexes: Some(vec![".*-archive$".to_string()]),
            ..Default::default()
        };
        assert!(!should_include(Some(&filters), &r).unwrap());
    }

    #[test]
    fn must_path_regex_requires_a_match() {
        let r = repo(false, false, 10, "acme/go-service");
        let filters = FiltersConfig {
            must_path_regexes: Some(vec![".*python.*".to_string()]),
            ..Default::default()
        };
        assert!(!should_include(Some(&filters), &r).unwrap());

        let r2 = repo(false, false, 10, "acme/python-service");
        assert!(should_include(Some(&filters), &r2).unwrap());
    }

    #[test]
    fn next_page_link_parses_github_style_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::LINK,
            "<https://api.github.com/orgs/acme/repos?page=2>; rel=\"next\", <https://api.github.com/orgs/acme/repos?page=5>; rel=\"last\""
                .parse()
                .unwrap(),
        );
        assert_eq!(
            next_page_link(&headers),
            Some("https://api.github.com/orgs/acme/repos?page=2".to_string())
        );
    }

    #[test]
    fn next_page_link_absent_returns_none() {
        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(next_page_link(&headers), None);
    }
}
