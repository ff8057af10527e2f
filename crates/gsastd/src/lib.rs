//! gsastd - Global SAST scan orchestrator daemon
//!
//! Library components for the daemon process: the shared store, plugin
//! registry, scan coordinator, worker pool, and HTTP control plane.

pub mod coordinator;
pub mod git;
pub mod plugins;
pub mod registry;
pub mod reposource;
pub mod results;
pub mod rulecache;
pub mod sarif;
pub mod server;
pub mod store;
pub mod worker;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use coordinator::{Coordinator, CoordinatorConfig};
use plugins::dependency_confusion::DependencyConfusionPlugin;
use plugins::semgrep::SemgrepPlugin;
use plugins::trufflehog::TrufflehogPlugin;
use registry::PluginRegistry;
use rulecache::RuleCache;
use server::AppState;
use store::SharedStore;
use tracing::info;
use worker::{WorkerConfig, WorkerContext};

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon configuration. Every field has an environment-variable fallback so
/// the binary can run unconfigured in a container, matching the teacher's
/// `DaemonConfig::default()` env-var precedence.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the `SQLite` shared-store database.
    pub db_path: PathBuf,
    /// HTTP control-plane port (default: 5000, matching the reference Flask app).
    pub port: u16,
    /// Shared secret clients present via the `X-API-Secret-Key` header.
    pub api_secret_key: String,
    /// Number of worker loops claiming jobs concurrently.
    pub worker_pool_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: std::env::var("GSASTD_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            api_secret_key: std::env::var("API_SECRET_KEY").unwrap_or_default(),
            worker_pool_size: std::env::var("GSASTD_WORKER_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
        }
    }
}

/// `GSASTD_DB_PATH` supersedes the reference implementation's `REDIS_URL`: the
/// shared-store backend is SQLite here, not Redis, so the env var naming
/// follows suit rather than keeping a now-misleading name.
fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("GSASTD_DB_PATH") {
        return PathBuf::from(path);
    }
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("gsastd").join("gsastd.db")
}

fn build_registry() -> PluginRegistry {
    let gitlab_url = std::env::var("GITLAB_URL").unwrap_or_else(|_| "https://gitlab.com".to_string());
    let mut registry = PluginRegistry::new();
    registry.register(Box::new(SemgrepPlugin::default()));
    registry.register(Box::new(TrufflehogPlugin::new(gitlab_url, 900)));
    registry.register(Box::new(DependencyConfusionPlugin::default()));
    registry
}

/// Daemon state: the shared store, plugin registry, coordinator, and the
/// handles of the always-running worker pool.
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<SharedStore>,
    registry: Arc<PluginRegistry>,
    coordinator: Arc<Coordinator>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Daemon {
    /// Create a new daemon with the given configuration: opens (and
    /// migrates) the shared store, registers the built-in scanner plugins,
    /// and spawns the worker pool. The HTTP server is not started until
    /// [`Daemon::run`].
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        let store = SharedStore::new(&config.db_path).await?;
        store.migrate_embedded().await?;
        let store = Arc::new(store);

        let registry = Arc::new(build_registry());

        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            registry.clone(),
            CoordinatorConfig::default(),
        ));

        let rule_cache_root = config
            .db_path
            .parent()
            .map(|p| p.join("rules-cache"))
            .unwrap_or_else(|| PathBuf::from("rules-cache"));
        let rule_cache = Arc::new(RuleCache::new(rule_cache_root));

        let worker_ctx = WorkerContext {
            store: store.clone(),
            registry: registry.clone(),
            rule_cache,
        };
        let worker_handles = worker::spawn_pool(
            worker_ctx,
            WorkerConfig {
                pool_size: config.worker_pool_size,
                ..WorkerConfig::default()
            },
        );

        Ok(Self {
            config,
            store,
            registry,
            coordinator,
            worker_handles,
        })
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Run the HTTP control plane. Workers and the coordinator's detached
    /// scan tasks were already started in [`Daemon::new`]; this call just
    /// blocks serving requests until the listener errors out.
    pub async fn run(&self) -> AppResult<()> {
        info!("gsastd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("worker pool size: {}", self.config.worker_pool_size);
        if self.config.api_secret_key.is_empty() {
            tracing::warn!("API_SECRET_KEY is empty; every request will be rejected with 403");
        }

        let state = Arc::new(AppState {
            store: self.store.clone(),
            registry: self.registry.clone(),
            coordinator: self.coordinator.clone(),
            auth_token: self.config.api_secret_key.clone(),
        });

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.config.port);
        server::start_server(state, addr)
            .await
            .map_err(|e| eyre::eyre!("HTTP server error: {e}"))
    }

    /// Abort the worker pool's polling loops. There is no separate
    /// coordinator shutdown: an in-flight scan's detached task is left to
    /// finish (or to persist its last-written status across a restart),
    /// matching the reference implementation's behavior of leaking the scan
    /// subprocess on `SIGTERM`.
    pub fn shutdown(&self) {
        info!("shutdown requested, stopping worker pool");
        for handle in &self.worker_handles {
            handle.abort();
        }
    }
}
