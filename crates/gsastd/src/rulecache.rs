//! Ruleset cache: materializes rule file bytes to a temp directory keyed by
//! scan id, reused within the worker process across jobs of the same scan.

use crate::store::SharedStore;
use gsast_core::split_rule_key;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleCacheError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rule key missing scan id separator: {0}")]
    MalformedKey(String),
}

pub type Result<T> = std::result::Result<T, RuleCacheError>;

/// Caches materialized rule directories per scan id for the lifetime of one
/// worker process.
pub struct RuleCache {
    root: PathBuf,
    dirs: Mutex<HashMap<String, PathBuf>>,
}

impl RuleCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            dirs: Mutex::new(HashMap::new()),
        }
    }

    /// Materialize the given rule keys (which must all belong to the same
    /// scan id) under `<root>/<scan_id>/<relative_path>`. Returns the scan's
    /// rule root directory, reusing a prior materialization within this
    /// process if one exists. Returns `Ok(None)` if `rule_keys` is empty.
    pub async fn get_rules(&self, store: &SharedStore, rule_keys: &[String]) -> Result<Option<PathBuf>> {
        let Some(first) = rule_keys.first() else {
            return Ok(None);
        };
        let (scan_id, _) = split_rule_key(first)
            .ok_or_else(|| RuleCacheError::MalformedKey(first.clone()))?;
        let scan_id = scan_id.to_string();

        if let Some(existing) = self.dirs.lock().unwrap().get(&scan_id).cloned() {
            tracing::debug!(scan_id = %scan_id, "rule set already materialized, reusing");
            return Ok(Some(existing));
        }

        let scan_dir = self.root.join(&scan_id);
        match self.download_rules(store, &scan_dir, rule_keys).await {
            Ok(()) => {
                self.dirs.lock().unwrap().insert(scan_id, scan_dir.clone());
                Ok(Some(scan_dir))
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&scan_dir);
                Err(e)
            }
        }
    }

    async fn download_rules(
        &self,
        store: &SharedStore,
        scan_dir: &std::path::Path,
        rule_keys: &[String],
    ) -> Result<()> {
        std::fs::create_dir_all(scan_dir)?;
        for key in rule_keys {
            let (_, relative_path) = split_rule_key(key)
                .ok_or_else(|| RuleCacheError::MalformedKey(key.clone()))?;
            let bytes = store.rule_get(key).await?.unwrap_or_default();
            let dest = scan_dir.join(relative_path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStore {
        store: SharedStore,
        _dir: TempDir,
    }

    async fn create_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = SharedStore::new(&dir.path().join("test.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();
        TestStore { store, _dir: dir }
    }

    #[tokio::test]
    async fn get_rules_materializes_and_reuses() {
        let t = create_test_store().await;
        t.store
            .rule_set("SCAN-1:rules/a.yaml", b"rule: a")
            .await
            .unwrap();

        let cache_root = TempDir::new().unwrap();
        let cache = RuleCache::new(cache_root.path().to_path_buf());

        let keys = vec!["SCAN-1:rules/a.yaml".to_string()];
        let dir1 = cache.get_rules(&t.store, &keys).await.unwrap().unwrap();
        assert!(dir1.join("rules/a.yaml").exists());
        assert_eq!(std::fs::read(dir1.join("rules/a.yaml")).unwrap(), b"rule: a");

        let dir2 = cache.get_rules(&t.store, &keys).await.unwrap().unwrap();
        assert_eq!(dir1, dir2);
    }

    #[tokio::test]
    async fn empty_keys_returns_none() {
        let t = create_test_store().await;
        let cache_root = TempDir::new().unwrap();
        let cache = RuleCache::new(cache_root.path().to_path_buf());
        assert!(cache.get_rules(&t.store, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_with_colon_in_relative_path_decodes_safely() {
        let t = create_test_store().await;
        t.store
            .rule_set("SCAN-1:weird:rule.yaml", b"x")
            .await
            .unwrap();
        let cache_root = TempDir::new().unwrap();
        let cache = RuleCache::new(cache_root.path().to_path_buf());
        let keys = vec!["SCAN-1:weird:rule.yaml".to_string()];
        let dir = cache.get_rules(&t.store, &keys).await.unwrap().unwrap();
        assert!(dir.join("weird:rule.yaml").exists());
    }
}
