//! Worker pool: claims queued jobs from the shared store and runs each
//! configured scanner against the cloned project in turn.
//!
//! Workers live in this same process rather than as separate RQ processes;
//! `claim_next_task` is the only work-coordination point, so scaling the
//! pool is just spawning more loops against the same store. Each loop also
//! writes a heartbeat row once per poll cycle so the coordinator's
//! worker-readiness check (see `coordinator.rs`) can tell whether any
//! worker is alive before it enqueues jobs.

use crate::registry::{PluginRegistry, RunArgs};
use crate::rulecache::RuleCache;
use crate::store::SharedStore;
use gsast_core::{split_rule_key, Job, ScannerId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("rule cache error: {0}")]
    RuleCache(#[from] crate::rulecache::RuleCacheError),
    #[error("results error: {0}")]
    Results(#[from] crate::results::ResultsError),
    #[error("git error: {0}")]
    Git(#[from] crate::git::GitError),
    #[error("payload was not a valid job: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

pub struct WorkerConfig {
    pub pool_size: usize,
    pub poll_interval_secs: u64,
    pub clone_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval_secs: 2,
            clone_timeout_secs: 600,
        }
    }
}

/// Shared dependencies every worker loop needs; cheap to clone (all `Arc`).
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<SharedStore>,
    pub registry: Arc<PluginRegistry>,
    pub rule_cache: Arc<RuleCache>,
}

/// Spawn `config.pool_size` worker loops, each polling the shared store for
/// queued jobs. Returns their join handles; the daemon does not join them on
/// shutdown (a claimed-but-unfinished job is simply re-claimable by whichever
/// worker comes up next, since its status only flips to a terminal state on
/// completion).
pub fn spawn_pool(ctx: WorkerContext, config: WorkerConfig) -> Vec<tokio::task::JoinHandle<()>> {
    (0..config.pool_size)
        .map(|worker_idx| {
            let ctx = ctx.clone();
            let poll_interval = config.poll_interval_secs;
            let clone_timeout = config.clone_timeout_secs;
            tokio::spawn(async move {
                tracing::info!(worker_idx, "worker started");
                let worker_id = format!("worker-{worker_idx}");
                loop {
                    let now = chrono::Utc::now().timestamp();
                    if let Err(e) = ctx.store.worker_heartbeat(&worker_id, now).await {
                        tracing::error!(error = %e, "failed to record worker heartbeat");
                    }
                    match ctx.store.claim_next_task().await {
                        Ok(Some((task_id, payload_json))) => {
                            if let Err(e) = handle_claimed_task(&ctx, &task_id, &payload_json, clone_timeout).await
                            {
                                tracing::error!(task_id = %task_id, error = %e, "failed to process claimed task");
                            }
                        }
                        Ok(None) => {
                            tokio::time::sleep(Duration::from_secs(poll_interval)).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to poll for queued tasks");
                            tokio::time::sleep(Duration::from_secs(poll_interval)).await;
                        }
                    }
                }
            })
        })
        .collect()
}

async fn handle_claimed_task(
    ctx: &WorkerContext,
    task_id: &str,
    payload_json: &str,
    clone_timeout_secs: u64,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    ctx.store.set_task_status(task_id, "started", now).await?;

    let job: Job = serde_json::from_str(payload_json)?;
    let outcome = process_job(ctx, &job, clone_timeout_secs).await;

    let now = chrono::Utc::now().timestamp();
    match &outcome {
        Ok(()) => ctx.store.set_task_status(task_id, "finished", now).await?,
        Err(e) => {
            tracing::error!(job_id = %job.id, scan_id = %job.scan_id, error = %e, "job failed");
            ctx.store.set_task_status(task_id, "failed", now).await?;
        }
    }
    outcome
}

/// Mirrors `process_task`: clone the project (shallow unless a scanner needs
/// full history), materialize rules if any scanner needs them, run each
/// scanner independently and store whatever it produces, and report whether
/// any of those stores failed. The working directory is a `TempDir` so it's
/// removed on every exit path, including an early `?` return, without a
/// separate cleanup block.
async fn process_job(ctx: &WorkerContext, job: &Job, clone_timeout_secs: u64) -> Result<()> {
    let scan_cwd = tempfile::Builder::new().prefix("gsastd-job-").tempdir()?;
    let project_sources_dir = scan_cwd.path().join("source");
    tokio::fs::create_dir_all(&project_sources_dir).await?;

    let needs_full_history = ctx.registry.needs_full_git_history(&job.scanner_ids);
    crate::git::clone(
        &job.clone_url_auth,
        &project_sources_dir,
        !needs_full_history,
        clone_timeout_secs,
    )
    .await?;

    let rules_dir = if job.rule_keys.is_empty() {
        None
    } else {
        ctx.rule_cache.get_rules(&ctx.store, &job.rule_keys).await?
    };

    if ctx.registry.needs_rules(&job.scanner_ids) && rules_dir.is_none() {
        return Err(WorkerError::Io(std::io::Error::other(
            "scanner requires rules but none were materialized for this job",
        )));
    }

    let rule_files = load_rule_files(&ctx.store, &job.rule_keys).await?;
    let args = RunArgs {
        rules_dir: rules_dir.clone(),
        rule_files,
    };

    let mut has_upload_errors = false;
    for scanner_id in &job.scanner_ids {
        match ctx
            .registry
            .run(scanner_id, &project_sources_dir, scan_cwd.path(), &args)
            .await
        {
            Ok(Some(sarif_paths)) => {
                if let Err(e) = crate::results::store(
                    &ctx.store,
                    job.scan_id.as_str(),
                    &job.clone_url_web,
                    scanner_id.as_str(),
                    &sarif_paths,
                )
                .await
                {
                    tracing::error!(scanner = %scanner_id, project = %job.clone_url_web, error = %e, "failed to store scan results");
                    has_upload_errors = true;
                }
            }
            Ok(None) => {
                tracing::debug!(scanner = %scanner_id, project = %job.clone_url_web, "scanner produced no findings");
            }
            Err(e) => {
                tracing::error!(scanner = %scanner_id, project = %job.clone_url_web, error = %e, "scanner run failed");
                has_upload_errors = true;
            }
        }
    }

    if has_upload_errors {
        return Err(WorkerError::Io(std::io::Error::other(
            "one or more scanners failed to upload their results",
        )));
    }

    Ok(())
}

async fn load_rule_files(store: &SharedStore, rule_keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for key in rule_keys {
        let Some((_, relative_path)) = split_rule_key(key) else {
            continue;
        };
        let bytes = store.rule_get(key).await?.unwrap_or_default();
        out.push((relative_path.to_string(), bytes));
    }
    Ok(out)
}
