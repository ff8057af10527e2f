//! Scan coordinator: the single-owner-writer pipeline that turns a
//! `POST /scan` request into an enumerated repository set and a batch of
//! enqueued jobs, and tracks their completion.
//!
//! Unlike the reference implementation's RQ-worker polling loop, the worker
//! pool here lives in this same daemon process and is normally always
//! running — but it's still a separate set of tokio tasks, started
//! independently in `Daemon::new`, and a misconfigured or still-starting
//! pool can genuinely have zero live workers. The coordinator polls the
//! worker registry at one-second granularity after repositories are
//! enumerated and before jobs are enqueued, failing the scan with
//! `CoordinatorError::NoWorkers` if `worker_wait_timeout_secs` elapses with
//! no worker heartbeat recorded.

use crate::registry::PluginRegistry;
use crate::reposource::{GitHubSource, GitLabSource, RepositorySource};
use crate::store::{Namespace, SharedStore};
use gsast_core::{rule_key, GsastConfig, RuleFile, ScanId, ScannerId, ScannerName, Target};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("repository source error: {0}")]
    RepoSource(#[from] crate::reposource::RepoSourceError),
    #[error("worker-wait timeout reached; no worker registered for the tasks queue")]
    NoWorkers,
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

fn scanner_name_to_id(name: &ScannerName) -> ScannerId {
    match name {
        ScannerName::Semgrep => ScannerId::Semgrep,
        ScannerName::Trufflehog => ScannerId::Trufflehog,
        ScannerName::DependencyConfusion => ScannerId::DependencyConfusion,
    }
}

pub struct CoordinatorConfig {
    pub job_timeout_secs: u64,
    pub job_result_ttl_secs: u64,
    pub check_jobs_status_interval_secs: u64,
    /// How long to wait for at least one worker to be registered before
    /// failing the scan with `NoWorkers`. Default 120s.
    pub worker_wait_timeout_secs: u64,
    /// Granularity of the worker-readiness poll. Default 1s.
    pub worker_wait_poll_interval_secs: u64,
    /// A worker is considered live if its heartbeat is newer than this many
    /// seconds ago. Must comfortably exceed the worker pool's own poll
    /// interval so a worker between claims isn't mistaken for dead.
    pub worker_stale_after_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 3600,
            job_result_ttl_secs: 86400,
            check_jobs_status_interval_secs: 5,
            worker_wait_timeout_secs: 120,
            worker_wait_poll_interval_secs: 1,
            worker_stale_after_secs: 15,
        }
    }
}

pub struct Coordinator {
    store: Arc<SharedStore>,
    registry: Arc<PluginRegistry>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(store: Arc<SharedStore>, registry: Arc<PluginRegistry>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Begin a scan: writes the initial scan record, then detaches a
    /// background task that drives the rest of the pipeline. Returns the
    /// minted scan id immediately, matching the reference implementation's
    /// `Process(target=tracked_scan.run_scan).start()` fire-and-forget.
    ///
    /// The spawned task outlives this call and is not joined on daemon
    /// shutdown: an in-flight scan persists its last-written status across a
    /// restart rather than being marked failed, matching the reference
    /// implementation's behavior of leaking the scan subprocess on SIGTERM.
    pub async fn start_scan(&self, config: GsastConfig, rule_files: Vec<RuleFile>) -> Result<ScanId> {
        let scan_id = ScanId::new();
        self.update_status(&scan_id, "Scan initiated successfully", false, false).await?;

        let store = self.store.clone();
        let registry = self.registry.clone();
        let job_timeout_secs = self.config.job_timeout_secs;
        let job_result_ttl_secs = self.config.job_result_ttl_secs;
        let check_interval = self.config.check_jobs_status_interval_secs;
        let worker_wait_timeout_secs = self.config.worker_wait_timeout_secs;
        let worker_wait_poll_interval_secs = self.config.worker_wait_poll_interval_secs;
        let worker_stale_after_secs = self.config.worker_stale_after_secs;
        let scan_id_task = scan_id.clone();

        tokio::spawn(async move {
            let coordinator = Coordinator {
                store,
                registry,
                config: CoordinatorConfig {
                    job_timeout_secs,
                    job_result_ttl_secs,
                    check_jobs_status_interval_secs: check_interval,
                    worker_wait_timeout_secs,
                    worker_wait_poll_interval_secs,
                    worker_stale_after_secs,
                },
            };
            coordinator.run_scan(scan_id_task, config, rule_files).await;
        });

        Ok(scan_id)
    }

    async fn run_scan(&self, scan_id: ScanId, config: GsastConfig, rule_files: Vec<RuleFile>) {
        if let Err(e) = self.run_scan_inner(&scan_id, config, rule_files).await {
            tracing::error!(scan_id = %scan_id, error = %e, "scan failed");
            let _ = self
                .update_status(&scan_id, &format!("Scan failed: {e}"), true, false)
                .await;
        }
    }

    async fn run_scan_inner(&self, scan_id: &ScanId, config: GsastConfig, rule_files: Vec<RuleFile>) -> Result<()> {
        self.update_status(scan_id, "Starting scan", false, false).await?;

        self.update_status(scan_id, "Uploading provided rules", false, false).await?;
        let rule_keys = self.upload_rules(scan_id, &rule_files).await?;

        let scanner_names = config.scanners.clone().unwrap_or(vec![ScannerName::Semgrep]);
        let scanner_ids: Vec<ScannerId> = scanner_names.iter().map(scanner_name_to_id).collect();
        let needs_rules = self.registry.needs_rules(&scanner_ids);

        if rule_keys.is_empty() && needs_rules {
            self.update_status(scan_id, "Error in uploading rules", true, false).await?;
            return Ok(());
        }

        self.update_status(scan_id, "Fetching projects", false, false).await?;
        let descriptors = match self.fetch_repositories(&config).await {
            Ok(d) => d,
            Err(e) => {
                self.update_status(scan_id, &format!("Failed to fetch projects: {e}"), true, false)
                    .await?;
                return Ok(());
            }
        };
        self.update_status(
            scan_id,
            &format!("Fetched {} projects", descriptors.len()),
            false,
            false,
        )
        .await?;

        if descriptors.is_empty() {
            self.update_status(scan_id, "No projects found", true, false).await?;
            return Ok(());
        }

        self.update_status(scan_id, "Waiting for available workers", false, false).await?;
        if let Err(e) = self.wait_for_workers().await {
            self.update_status(scan_id, &format!("Scan failed: {e}"), true, false).await?;
            return Ok(());
        }

        self.update_status(scan_id, "Processing and enqueuing jobs for projects", false, false)
            .await?;

        let now = chrono::Utc::now().timestamp();
        for repo in &descriptors {
            let job = gsast_core::Job {
                id: Uuid::new_v4().to_string(),
                scan_id: scan_id.clone(),
                clone_url_auth: repo.auth_clone_url.clone(),
                clone_url_web: repo.web_url.clone(),
                rule_keys: rule_keys.clone(),
                scanner_ids: scanner_ids.clone(),
                timeout_secs: self.config.job_timeout_secs,
                result_ttl_secs: self.config.job_result_ttl_secs,
                description: scan_id.to_string(),
                status: gsast_core::JobStatus::Queued,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            };
            let payload = serde_json::to_string(&job).map_err(crate::store::StoreError::from)?;
            self.store
                .enqueue_task(
                    &job.id,
                    scan_id.as_str(),
                    &payload,
                    &job.description,
                    job.timeout_secs as i64,
                    job.result_ttl_secs as i64,
                    now,
                )
                .await?;
        }

        self.wait_for_jobs_to_finish(scan_id, descriptors.len()).await?;

        self.update_status(scan_id, "Scan successfully finished", false, true).await?;
        Ok(())
    }

    async fn upload_rules(&self, scan_id: &ScanId, rule_files: &[RuleFile]) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for rule_file in rule_files {
            let key = rule_key(scan_id, &rule_file.relative_path);
            self.store.rule_set(&key, &rule_file.bytes).await?;
            keys.push(key);
        }
        Ok(keys)
    }

    async fn fetch_repositories(
        &self,
        config: &GsastConfig,
    ) -> std::result::Result<Vec<gsast_core::RepositoryDescriptor>, crate::reposource::RepoSourceError> {
        // Filtering is applied by the source itself (see `should_include`
        // calls in `reposource::{GitHubSource,GitLabSource}::fetch_repositories`).
        match &config.target {
            Target::Github { .. } => {
                let source = GitHubSource::new()?;
                source.fetch_repositories(&config.target, config.filters.as_ref()).await
            }
            Target::Gitlab { .. } => {
                let source = GitLabSource::new()?;
                source.fetch_repositories(&config.target, config.filters.as_ref()).await
            }
        }
    }

    /// Poll the worker registry at `worker_wait_poll_interval_secs`
    /// granularity until at least one worker has a live heartbeat, or until
    /// `worker_wait_timeout_secs` elapses, in which case this returns
    /// `CoordinatorError::NoWorkers`.
    async fn wait_for_workers(&self) -> Result<()> {
        let start = tokio::time::Instant::now();
        let timeout = Duration::from_secs(self.config.worker_wait_timeout_secs);
        loop {
            let now = chrono::Utc::now().timestamp();
            let live = self
                .store
                .count_live_workers(now, self.config.worker_stale_after_secs as i64)
                .await?;
            if live > 0 {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(CoordinatorError::NoWorkers);
            }
            tokio::time::sleep(Duration::from_secs(self.config.worker_wait_poll_interval_secs)).await;
        }
    }

    async fn wait_for_jobs_to_finish(&self, scan_id: &ScanId, total_jobs: usize) -> Result<()> {
        loop {
            let counts = self.job_status_counts(scan_id).await?;
            let not_finished = counts.get("queued").copied().unwrap_or(0)
                + counts.get("started").copied().unwrap_or(0)
                + counts.get("deferred").copied().unwrap_or(0)
                + counts.get("scheduled").copied().unwrap_or(0);
            let finished = total_jobs.saturating_sub(not_finished);

            self.store
                .hset_many(
                    scan_id.as_str(),
                    &[(
                        "jobs",
                        &serde_json::to_string(&counts).unwrap_or_default(),
                    )],
                )
                .await?;
            self.update_status(
                scan_id,
                &format!("Waiting for jobs to finish.. Status: {finished}/{total_jobs} finished"),
                false,
                false,
            )
            .await?;

            if not_finished == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(self.config.check_jobs_status_interval_secs)).await;
        }
    }

    async fn job_status_counts(&self, scan_id: &ScanId) -> Result<HashMap<String, usize>> {
        let statuses = self.store.task_statuses_for_scan(scan_id.as_str()).await?;
        let mut counts = HashMap::new();
        for status in statuses {
            *counts.entry(status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn update_status(&self, scan_id: &ScanId, message: &str, is_error: bool, is_completed: bool) -> Result<()> {
        let status = if is_completed {
            "completed"
        } else if is_error {
            "failed"
        } else {
            "started"
        };
        if is_error {
            tracing::error!(scan_id = %scan_id, message, "scan status update");
        } else {
            tracing::info!(scan_id = %scan_id, message, "scan status update");
        }

        let existing_jobs = self
            .store
            .hget(scan_id.as_str(), "jobs")
            .await?
            .unwrap_or_else(|| "{}".to_string());

        self.store
            .hset_many(
                scan_id.as_str(),
                &[("message", message), ("jobs", &existing_jobs), ("status", status)],
            )
            .await?;
        Ok(())
    }

    /// `GET /scan/{id}/status`. `None` if the scan is unknown.
    pub async fn get_scan_info(&self, scan_id: &str) -> Result<Option<ScanInfo>> {
        if !self.store.hexists(scan_id, "status").await? {
            return Ok(None);
        }
        let hash = self.store.hgetall(scan_id).await?;
        Ok(Some(ScanInfo {
            scan_id: scan_id.to_string(),
            message: hash.get("message").cloned().unwrap_or_default(),
            jobs: hash
                .get("jobs")
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default(),
            status: hash.get("status").cloned().unwrap_or_default(),
        }))
    }

    /// `GET /queue/scans`: every top-level scan id, sorted.
    pub async fn list_scans(&self) -> Result<Vec<String>> {
        let mut keys = self.store.list_scan_keys().await?;
        keys.sort();
        Ok(keys)
    }

    /// `DELETE /queue/cleanup`: wipes scans, tasks, and rules.
    pub async fn cleanup_queues(&self) -> Result<()> {
        self.store.flush_namespace(Namespace::Scans).await?;
        self.store.flush_namespace(Namespace::Tasks).await?;
        self.store.flush_namespace(Namespace::Rules).await?;
        Ok(())
    }

    /// `DELETE /queue/projects`: wipes the projects cache only.
    pub async fn cleanup_projects(&self) -> Result<()> {
        self.store.flush_namespace(Namespace::Projects).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanInfo {
    pub scan_id: String,
    pub message: String,
    pub jobs: HashMap<String, usize>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PluginRegistry;
    use tempfile::TempDir;

    async fn test_coordinator() -> (Coordinator, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SharedStore::new(&dir.path().join("test.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();
        let coordinator = Coordinator::new(
            Arc::new(store),
            Arc::new(PluginRegistry::new()),
            CoordinatorConfig::default(),
        );
        (coordinator, dir)
    }

    #[tokio::test]
    async fn get_scan_info_returns_none_for_unknown_scan() {
        let (coordinator, _dir) = test_coordinator().await;
        assert!(coordinator.get_scan_info("SCAN-NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_status_then_get_scan_info_round_trips() {
        let (coordinator, _dir) = test_coordinator().await;
        let scan_id = ScanId::from_string("SCAN-TEST");
        coordinator
            .update_status(&scan_id, "Scan initiated successfully", false, false)
            .await
            .unwrap();

        let info = coordinator.get_scan_info("SCAN-TEST").await.unwrap().unwrap();
        assert_eq!(info.message, "Scan initiated successfully");
        assert_eq!(info.status, "started");
    }

    #[tokio::test]
    async fn list_scans_excludes_results_keys_and_sorts() {
        let (coordinator, _dir) = test_coordinator().await;
        coordinator
            .update_status(&ScanId::from_string("SCAN-2"), "x", false, false)
            .await
            .unwrap();
        coordinator
            .update_status(&ScanId::from_string("SCAN-1"), "x", false, false)
            .await
            .unwrap();

        let scans = coordinator.list_scans().await.unwrap();
        assert_eq!(scans, vec!["SCAN-1".to_string(), "SCAN-2".to_string()]);
    }

    #[tokio::test]
    async fn wait_for_workers_times_out_when_no_worker_ever_registers() {
        let (mut coordinator, _dir) = test_coordinator().await;
        coordinator.config.worker_wait_timeout_secs = 1;
        coordinator.config.worker_wait_poll_interval_secs = 1;

        let err = coordinator.wait_for_workers().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoWorkers));
    }

    #[tokio::test]
    async fn wait_for_workers_proceeds_once_a_late_worker_registers() {
        let (mut coordinator, _dir) = test_coordinator().await;
        coordinator.config.worker_wait_timeout_secs = 5;
        coordinator.config.worker_wait_poll_interval_secs = 1;

        let store = coordinator.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            let now = chrono::Utc::now().timestamp();
            store.worker_heartbeat("worker-0", now).await.unwrap();
        });

        coordinator.wait_for_workers().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_queues_clears_scans_tasks_and_rules_but_not_projects() {
        let (coordinator, _dir) = test_coordinator().await;
        let scan_id = ScanId::from_string("SCAN-1");
        coordinator.update_status(&scan_id, "x", false, false).await.unwrap();
        coordinator.store.rule_set("SCAN-1:a.yaml", b"x").await.unwrap();
        coordinator.store.project_cache_set("p1", "v", 0).await.unwrap();

        coordinator.cleanup_queues().await.unwrap();

        assert!(coordinator.get_scan_info("SCAN-1").await.unwrap().is_none());
        assert!(coordinator.store.rule_get("SCAN-1:a.yaml").await.unwrap().is_none());
        assert_eq!(coordinator.store.project_cache_keys().await.unwrap().len(), 1);
    }
}
