//! Shared-store abstraction: four namespaces (scans, tasks, rules,
//! projects-cache), each hash/set/byte-string addressable.
//!
//! Backed by a single SQLite database (WAL mode) rather than Redis: no
//! example repo in this codebase's lineage depends on `redis`, and the
//! namespace contract (atomic multi-field hash update, atomic set-add, key
//! enumeration, key-type introspection, per-namespace flush, no
//! cross-namespace transactions required) is fully satisfiable with a
//! relational schema.

use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The four namespaces the shared store addresses. Each flush operation is
/// scoped to exactly one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Scans,
    Tasks,
    Rules,
    Projects,
}

pub struct SharedStore {
    pool: Pool<Sqlite>,
}

impl SharedStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match sqlx::query(trimmed).execute(&self.pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- scans namespace: hash ---

    /// Atomically write multiple fields of a hash in one statement batch.
    pub async fn hset_many(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (field, value) in fields {
            sqlx::query(
                "INSERT INTO scans_hash (namespace_key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(namespace_key, field) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(*field)
            .bind(*value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM scans_hash WHERE namespace_key = ?1 AND field = ?2")
            .bind(key)
            .bind(field)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT field, value FROM scans_hash WHERE namespace_key = ?1")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("field"), r.get::<String, _>("value")))
            .collect())
    }

    pub async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self.hget(key, field).await?.is_some())
    }

    /// Enumerate top-level scan hash keys that carry a "status" field and
    /// contain no `:` (i.e. scan records, not `scan_id:results:*` entries).
    pub async fn list_scan_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT namespace_key FROM scans_hash
             WHERE field = 'status' AND namespace_key NOT LIKE '%:%'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("namespace_key")).collect())
    }

    // --- scans namespace: set ---

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO scans_set (namespace_key, member) VALUES (?1, ?2)
             ON CONFLICT(namespace_key, member) DO NOTHING",
        )
        .bind(key)
        .bind(member)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT member FROM scans_set WHERE namespace_key = ?1")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("member")).collect())
    }

    // --- rules namespace: byte strings ---

    pub async fn rule_set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO rules_bytes (key, bytes) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET bytes = excluded.bytes",
        )
        .bind(key)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn rule_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT bytes FROM rules_bytes WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("bytes")))
    }

    // --- projects-cache namespace ---

    pub async fn project_cache_set(&self, key: &str, value: &str, updated_at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects_cache (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn project_cache_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM projects_cache")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("key")).collect())
    }

    // --- tasks namespace ---

    pub async fn enqueue_task(
        &self,
        id: &str,
        scan_id: &str,
        payload_json: &str,
        description: &str,
        timeout_secs: i64,
        result_ttl_secs: i64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks_queue
                (id, scan_id, payload_json, status, description, timeout_secs,
                 result_ttl_secs, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6, ?7, ?7)
            "#,
        )
        .bind(id)
        .bind(scan_id)
        .bind(payload_json)
        .bind(description)
        .bind(timeout_secs)
        .bind(result_ttl_secs)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_status(&self, id: &str, status: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE tasks_queue SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn task_statuses_for_scan(&self, scan_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT status FROM tasks_queue WHERE scan_id = ?1")
            .bind(scan_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("status")).collect())
    }

    pub async fn claim_next_task(&self) -> Result<Option<(String, String)>> {
        let row = sqlx::query(
            "SELECT id, payload_json FROM tasks_queue WHERE status = 'queued'
             ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("id"), r.get("payload_json"))))
    }

    // --- worker registry ---

    /// Upsert a worker's last-seen timestamp. Called once per poll cycle by
    /// every worker loop so the coordinator can tell whether any worker is
    /// currently alive.
    pub async fn worker_heartbeat(&self, worker_id: &str, now: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers_registry (worker_id, last_seen_at) VALUES (?1, ?2)
             ON CONFLICT(worker_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count workers whose last heartbeat is within `stale_after_secs` of `now`.
    pub async fn count_live_workers(&self, now: i64, stale_after_secs: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM workers_registry WHERE last_seen_at >= ?1")
            .bind(now - stale_after_secs)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c"))
    }

    // --- administrative flush ---

    pub async fn flush_namespace(&self, ns: Namespace) -> Result<()> {
        match ns {
            Namespace::Scans => {
                sqlx::query("DELETE FROM scans_hash").execute(&self.pool).await?;
                sqlx::query("DELETE FROM scans_set").execute(&self.pool).await?;
            }
            Namespace::Tasks => {
                sqlx::query("DELETE FROM tasks_queue").execute(&self.pool).await?;
            }
            Namespace::Rules => {
                sqlx::query("DELETE FROM rules_bytes").execute(&self.pool).await?;
            }
            Namespace::Projects => {
                sqlx::query("DELETE FROM projects_cache").execute(&self.pool).await?;
            }
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
    async fn hset_many_and_hgetall_round_trip() {
        let t = create_test_store().await;
        t.store
            .hset_many("SCAN-1", &[("message", "hi"), ("status", "started")])
            .await
            .unwrap();
        let all = t.store.hgetall("SCAN-1").await.unwrap();
        assert_eq!(all.get("message").unwrap(), "hi");
        assert_eq!(all.get("status").unwrap(), "started");
    }

    #[tokio::test]
    async fn hset_many_overwrites_existing_field() {
        let t = create_test_store().await;
        t.store.hset_many("SCAN-1", &[("status", "started")]).await.unwrap();
        t.store.hset_many("SCAN-1", &[("status", "completed")]).await.unwrap();
        assert_eq!(t.store.hget("SCAN-1", "status").await.unwrap().unwrap(), "completed");
    }

    #[tokio::test]
    async fn sadd_is_idempotent() {
        let t = create_test_store().await;
        t.store.sadd("SCAN-1:projects", "https://x/y.git").await.unwrap();
        t.store.sadd("SCAN-1:projects", "https://x/y.git").await.unwrap();
        let members = t.store.smembers("SCAN-1:projects").await.unwrap();
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn list_scan_keys_excludes_results_keys() {
        let t = create_test_store().await;
        t.store.hset_many("SCAN-1", &[("status", "started")]).await.unwrap();
        t.store
            .hset_many("SCAN-1:results:https://x/y.git", &[("project_url", "https://x/y.git")])
            .await
            .unwrap();
        let keys = t.store.list_scan_keys().await.unwrap();
        assert_eq!(keys, vec!["SCAN-1".to_string()]);
    }

    #[tokio::test]
    async fn rule_bytes_round_trip() {
        let t = create_test_store().await;
        t.store.rule_set("SCAN-1:rules/a.yaml", b"rule: body").await.unwrap();
        let bytes = t.store.rule_get("SCAN-1:rules/a.yaml").await.unwrap().unwrap();
        assert_eq!(bytes, b"rule: body");
    }

    #[tokio::test]
    async fn count_live_workers_ignores_stale_heartbeats() {
        let t = create_test_store().await;
        t.store.worker_heartbeat("worker-0", 1_000).await.unwrap();
        assert_eq!(t.store.count_live_workers(1_005, 15).await.unwrap(), 1);
        assert_eq!(t.store.count_live_workers(1_100, 15).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn worker_heartbeat_upserts_by_worker_id() {
        let t = create_test_store().await;
        t.store.worker_heartbeat("worker-0", 1_000).await.unwrap();
        t.store.worker_heartbeat("worker-0", 2_000).await.unwrap();
        assert_eq!(t.store.count_live_workers(2_000, 5).await.unwrap(), 1);
        assert_eq!(t.store.count_live_workers(1_000, 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_namespace_scopes_to_one_namespace() {
        let t = create_test_store().await;
        t.store.hset_many("SCAN-1", &[("status", "started")]).await.unwrap();
        t.store.rule_set("SCAN-1:a.yaml", b"x").await.unwrap();
        t.store.flush_namespace(Namespace::Scans).await.unwrap();
        assert!(t.store.hgetall("SCAN-1").await.unwrap().is_empty());
        assert!(t.store.rule_get("SCAN-1:a.yaml").await.unwrap().is_some());
    }
}
