//! Baseline storage: the approved reference image for every
//! (branch, url, element, device) key.
//!
//! Payload bytes live in a branch-sharded directory tree; a SQLite index is
//! the source of truth and carries the metadata needed for lookup, listing
//! and retention. Bytes are verified against their recorded hash on every
//! read; a mismatch quarantines the record rather than deleting it.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::capture::CaptureResult;
use crate::error::{Result, SnapError};
use crate::hash::ImageHash;
use crate::vcs::VersionControl;

/// How a baseline lookup resolves its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Current branch, with opt-in fallback to the configured default
    /// branch when the current branch has no baseline.
    Branch,
    /// Exact current commit.
    Commit,
    /// Explicit record id.
    Manual(String),
}

/// A stored baseline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub id: String,
    pub branch: String,
    pub commit: String,
    pub url: String,
    pub element: Option<String>,
    pub device: Option<String>,
    /// Payload location on disk.
    pub path: PathBuf,
    /// SHA-256 of the stored bytes.
    pub hash: ImageHash,
    /// Capture configuration snapshot at the time the baseline was taken.
    pub config: serde_json::Value,
    /// Set when the stored bytes stopped matching the recorded hash.
    pub quarantined: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Key metadata for a new baseline.
#[derive(Debug, Clone)]
pub struct BaselineMeta {
    pub branch: String,
    pub commit: String,
    pub url: String,
    pub element: Option<String>,
    pub device: Option<String>,
}

/// Filters for listing.
#[derive(Debug, Clone, Default)]
pub struct BaselineFilter {
    pub branch: Option<String>,
    pub url: Option<String>,
    pub include_quarantined: bool,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct BaselineManagerConfig {
    /// Workspace root; payloads go under `<workspace>/baselines/<branch>/`.
    pub workspace_dir: PathBuf,
    /// Opt-in branch fallback target for [`LookupStrategy::Branch`].
    pub default_branch: Option<String>,
}

impl BaselineManagerConfig {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            default_branch: None,
        }
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }
}

/// Keyed image store with git-aware lifecycle.
///
/// Writes for the same key are serialized through a single connection, so
/// the uniqueness invariant holds under concurrent use.
pub struct BaselineManager {
    conn: Mutex<Connection>,
    config: BaselineManagerConfig,
    vcs: Arc<dyn VersionControl>,
}

impl BaselineManager {
    /// Open (or create) the store under the workspace directory.
    pub fn open(config: BaselineManagerConfig, vcs: Arc<dyn VersionControl>) -> Result<Self> {
        let baselines_dir = config.workspace_dir.join("baselines");
        std::fs::create_dir_all(&baselines_dir)
            .map_err(|e| SnapError::Storage(format!("cannot create baseline dir: {e}")))?;

        let conn = Connection::open(baselines_dir.join("index.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS baselines (
                id          TEXT PRIMARY KEY,
                branch      TEXT NOT NULL,
                commit_id   TEXT NOT NULL,
                url         TEXT NOT NULL,
                element     TEXT NOT NULL DEFAULT '',
                device      TEXT NOT NULL DEFAULT '',
                path        TEXT NOT NULL,
                hash        TEXT NOT NULL,
                config      TEXT NOT NULL,
                quarantined INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                UNIQUE (branch, url, element, device)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            vcs,
        })
    }

    /// Resolve a baseline for the key under the given strategy.
    pub fn get_baseline(
        &self,
        url: &str,
        element: Option<&str>,
        device: Option<&str>,
        strategy: &LookupStrategy,
    ) -> Result<Option<BaselineRecord>> {
        match strategy {
            LookupStrategy::Branch => {
                let branch = self.vcs.current_branch()?;
                if let Some(record) = self.get_by_key(&branch, url, element, device)? {
                    return Ok(Some(record));
                }
                // Fallback is opt-in and never implicit across branches
                match &self.config.default_branch {
                    Some(default) if default != &branch => {
                        self.get_by_key(default, url, element, device)
                    }
                    _ => Ok(None),
                }
            }
            LookupStrategy::Commit => {
                let commit = self.vcs.current_commit()?;
                let conn = self.conn.lock();
                let record = conn
                    .query_row(
                        "SELECT * FROM baselines
                         WHERE commit_id = ?1 AND url = ?2 AND element = ?3 AND device = ?4
                           AND quarantined = 0",
                        params![commit, url, element.unwrap_or(""), device.unwrap_or("")],
                        row_to_record,
                    )
                    .optional()?;
                Ok(record)
            }
            LookupStrategy::Manual(id) => {
                let conn = self.conn.lock();
                let record = conn
                    .query_row(
                        "SELECT * FROM baselines WHERE id = ?1",
                        params![id],
                        row_to_record,
                    )
                    .optional()?;
                Ok(record)
            }
        }
    }

    fn get_by_key(
        &self,
        branch: &str,
        url: &str,
        element: Option<&str>,
        device: Option<&str>,
    ) -> Result<Option<BaselineRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT * FROM baselines
                 WHERE branch = ?1 AND url = ?2 AND element = ?3 AND device = ?4
                   AND quarantined = 0",
                params![branch, url, element.unwrap_or(""), device.unwrap_or("")],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Store a capture as the baseline for its key, replacing any existing
    /// record for the same (branch, url, element, device).
    pub fn set_baseline(
        &self,
        capture: &CaptureResult,
        meta: &BaselineMeta,
    ) -> Result<BaselineRecord> {
        let conn = self.conn.lock();

        // Replacing an existing key reuses its id and created_at
        let existing: Option<(String, i64, String)> = conn
            .query_row(
                "SELECT id, created_at, path FROM baselines
                 WHERE branch = ?1 AND url = ?2 AND element = ?3 AND device = ?4",
                params![
                    meta.branch,
                    meta.url,
                    meta.element.as_deref().unwrap_or(""),
                    meta.device.as_deref().unwrap_or(""),
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let now = Utc::now();
        let (id, created_at) = match &existing {
            Some((id, created, _)) => (id.clone(), *created),
            None => (Uuid::new_v4().to_string(), now.timestamp()),
        };

        let path = self.payload_path(&meta.branch, &id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SnapError::Storage(format!("cannot create branch dir: {e}")))?;
        }
        std::fs::write(&path, &capture.bytes)
            .map_err(|e| SnapError::Storage(format!("cannot write baseline payload: {e}")))?;

        // Drop a superseded payload living at a different path
        if let Some((_, _, old_path)) = &existing {
            let old = PathBuf::from(old_path);
            if old != path {
                let _ = std::fs::remove_file(old);
            }
        }

        let config_json = serde_json::to_string(&serde_json::json!({
            "viewport_width": capture.metadata.viewport_width,
            "viewport_height": capture.metadata.viewport_height,
            "device_pixel_ratio": capture.metadata.device_pixel_ratio,
            "color_scheme": capture.metadata.color_scheme,
            "mode": capture.metadata.mode,
        }))?;

        conn.execute(
            "INSERT OR REPLACE INTO baselines
                 (id, branch, commit_id, url, element, device, path, hash, config,
                  quarantined, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
            params![
                id,
                meta.branch,
                meta.commit,
                meta.url,
                meta.element.as_deref().unwrap_or(""),
                meta.device.as_deref().unwrap_or(""),
                path.to_string_lossy(),
                capture.hash.to_hex(),
                config_json,
                created_at,
                now.timestamp(),
            ],
        )?;

        let record = conn.query_row(
            "SELECT * FROM baselines WHERE id = ?1",
            params![id],
            row_to_record,
        )?;
        Ok(record)
    }

    /// Replace the payload of an existing record by id.
    pub fn update_baseline(&self, id: &str, capture: &CaptureResult) -> Result<BaselineRecord> {
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT path FROM baselines WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(path) = existing else {
            return Err(SnapError::BaselineNotFound(id.to_string()));
        };

        std::fs::write(&path, &capture.bytes)
            .map_err(|e| SnapError::Storage(format!("cannot write baseline payload: {e}")))?;

        conn.execute(
            "UPDATE baselines SET hash = ?1, quarantined = 0, updated_at = ?2 WHERE id = ?3",
            params![capture.hash.to_hex(), Utc::now().timestamp(), id],
        )?;

        let record = conn.query_row(
            "SELECT * FROM baselines WHERE id = ?1",
            params![id],
            row_to_record,
        )?;
        Ok(record)
    }

    /// List records matching the filter, newest first.
    pub fn list_baselines(&self, filter: &BaselineFilter) -> Result<Vec<BaselineRecord>> {
        let conn = self.conn.lock();
        let mut sql = String::from("SELECT * FROM baselines WHERE 1=1");
        let mut bind: Vec<String> = Vec::new();
        if let Some(branch) = &filter.branch {
            sql.push_str(" AND branch = ?");
            bind.push(branch.clone());
        }
        if let Some(url) = &filter.url {
            sql.push_str(" AND url = ?");
            bind.push(url.clone());
        }
        if !filter.include_quarantined {
            sql.push_str(" AND quarantined = 0");
        }
        sql.push_str(" ORDER BY updated_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(bind.iter());
        let rows = stmt.query_map(params, row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Read and verify a record's payload.
    ///
    /// # Errors
    ///
    /// [`SnapError::ChecksumMismatch`] when the bytes no longer match the
    /// recorded hash; the record is quarantined, not deleted.
    pub fn load_bytes(&self, record: &BaselineRecord) -> Result<Vec<u8>> {
        let bytes = std::fs::read(&record.path)
            .map_err(|e| SnapError::Storage(format!("cannot read baseline payload: {e}")))?;

        if !record.hash.verify(&bytes) {
            let actual = ImageHash::from_bytes(&bytes);
            {
                let conn = self.conn.lock();
                conn.execute(
                    "UPDATE baselines SET quarantined = 1 WHERE id = ?1",
                    params![record.id],
                )?;
            }
            tracing::warn!(
                id = %record.id,
                url = %record.url,
                "baseline payload failed checksum verification, record quarantined"
            );
            return Err(SnapError::ChecksumMismatch {
                id: record.id.clone(),
                expected: record.hash.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Remove records older than `max_age_days` (by `updated_at`) together
    /// with their payloads, then prune orphaned files the index no longer
    /// references. Returns the number of records removed.
    pub fn cleanup_old_baselines(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - i64::from(max_age_days) * 24 * 60 * 60;
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT id, path FROM baselines WHERE updated_at < ?1")?;
        let stale: Vec<(String, String)> = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        for (id, path) in &stale {
            let _ = std::fs::remove_file(path);
            conn.execute("DELETE FROM baselines WHERE id = ?1", params![id])?;
        }

        // The index is the source of truth: anything on disk it does not
        // reference is an orphan
        let mut stmt = conn.prepare("SELECT path FROM baselines")?;
        let known: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let baselines_dir = self.config.workspace_dir.join("baselines");
        prune_orphans(&baselines_dir, &known);

        Ok(stale.len())
    }

    fn payload_path(&self, branch: &str, id: &str) -> PathBuf {
        let shard = sanitize_branch(branch);
        self.config
            .workspace_dir
            .join("baselines")
            .join(shard)
            .join(format!("{id}.png"))
    }

    /// Release the underlying index.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner();
        conn.close()
            .map_err(|(_, e)| SnapError::StoreIo(e.to_string()))
    }
}

fn sanitize_branch(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect()
}

fn prune_orphans(baselines_dir: &Path, known: &[String]) {
    let Ok(branches) = std::fs::read_dir(baselines_dir) else {
        return;
    };
    for branch_dir in branches.flatten() {
        if !branch_dir.path().is_dir() {
            continue;
        }
        let Ok(files) = std::fs::read_dir(branch_dir.path()) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            let listed = known
                .iter()
                .any(|k| Path::new(k) == path.as_path());
            if !listed {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<BaselineRecord> {
    let element: String = row.get("element")?;
    let device: String = row.get("device")?;
    let hash_hex: String = row.get("hash")?;
    let config_json: String = row.get("config")?;
    let created: i64 = row.get("created_at")?;
    let updated: i64 = row.get("updated_at")?;
    let path: String = row.get("path")?;

    Ok(BaselineRecord {
        id: row.get("id")?,
        branch: row.get("branch")?,
        commit: row.get("commit_id")?,
        url: row.get("url")?,
        element: if element.is_empty() { None } else { Some(element) },
        device: if device.is_empty() { None } else { Some(device) },
        path: PathBuf::from(path),
        hash: ImageHash::from_hex(&hash_hex).unwrap_or_else(|_| ImageHash::from_bytes(&[])),
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        quarantined: row.get::<_, i64>("quarantined")? != 0,
        created_at: Utc.timestamp_opt(created, 0).single().unwrap_or_else(Utc::now),
        updated_at: Utc.timestamp_opt(updated, 0).single().unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureMetadata, CaptureMode, ColorScheme};
    use crate::vcs::StaticVersionControl;

    fn capture(bytes: &[u8], url: &str) -> CaptureResult {
        CaptureResult {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            url: url.to_string(),
            bytes: bytes.to_vec(),
            hash: ImageHash::from_bytes(bytes),
            metadata: CaptureMetadata {
                viewport_width: 1280,
                viewport_height: 720,
                device_pixel_ratio: 1.0,
                color_scheme: ColorScheme::Light,
                mode: CaptureMode::Viewport,
                stabilized: true,
            },
        }
    }

    fn meta(branch: &str, url: &str) -> BaselineMeta {
        BaselineMeta {
            branch: branch.to_string(),
            commit: "c0ffee".to_string(),
            url: url.to_string(),
            element: None,
            device: None,
        }
    }

    fn manager(dir: &Path) -> BaselineManager {
        let vcs = Arc::new(StaticVersionControl::new("main", "c0ffee"));
        BaselineManager::open(BaselineManagerConfig::new(dir), vcs).unwrap()
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let cap = capture(b"payload-1", "https://example.com/");
        let record = manager.set_baseline(&cap, &meta("main", "https://example.com/")).unwrap();
        assert_eq!(record.hash, cap.hash);

        let found = manager
            .get_baseline("https://example.com/", None, None, &LookupStrategy::Branch)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(manager.load_bytes(&found).unwrap(), b"payload-1");
    }

    #[test]
    fn test_key_uniqueness_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let key = meta("main", "https://example.com/pricing");

        let first = manager.set_baseline(&capture(b"v1", "u"), &key).unwrap();
        let second = manager.set_baseline(&capture(b"v2", "u"), &key).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);

        let all = manager.list_baselines(&BaselineFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(manager.load_bytes(&second).unwrap(), b"v2");
    }

    #[test]
    fn test_distinct_elements_are_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let mut with_element = meta("main", "https://example.com/");
        with_element.element = Some("#hero".to_string());
        manager.set_baseline(&capture(b"page", "u"), &meta("main", "https://example.com/")).unwrap();
        manager.set_baseline(&capture(b"hero", "u"), &with_element).unwrap();

        let all = manager.list_baselines(&BaselineFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let hero = manager
            .get_baseline(
                "https://example.com/",
                Some("#hero"),
                None,
                &LookupStrategy::Branch,
            )
            .unwrap()
            .unwrap();
        assert_eq!(hero.element.as_deref(), Some("#hero"));
    }

    #[test]
    fn test_branch_fallback_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(StaticVersionControl::new("feature/x", "abc"));

        // Without a default branch: no fallback
        let strict = BaselineManager::open(BaselineManagerConfig::new(dir.path()), vcs.clone())
            .unwrap();
        strict
            .set_baseline(&capture(b"main-img", "u"), &meta("main", "https://example.com/"))
            .unwrap();
        assert!(strict
            .get_baseline("https://example.com/", None, None, &LookupStrategy::Branch)
            .unwrap()
            .is_none());
        drop(strict);

        // With default_branch = main: falls back
        let fallback = BaselineManager::open(
            BaselineManagerConfig::new(dir.path()).with_default_branch("main"),
            vcs,
        )
        .unwrap();
        let found = fallback
            .get_baseline("https://example.com/", None, None, &LookupStrategy::Branch)
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().branch, "main");
    }

    #[test]
    fn test_commit_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.set_baseline(&capture(b"img", "u"), &meta("main", "https://example.com/")).unwrap();

        // StaticVersionControl reports commit c0ffee, matching the record
        assert!(manager
            .get_baseline("https://example.com/", None, None, &LookupStrategy::Commit)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_manual_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let record = manager
            .set_baseline(&capture(b"img", "u"), &meta("main", "https://example.com/"))
            .unwrap();

        let found = manager
            .get_baseline("ignored", None, None, &LookupStrategy::Manual(record.id.clone()))
            .unwrap();
        assert!(found.is_some());

        let missing = manager
            .get_baseline("ignored", None, None, &LookupStrategy::Manual("nope".to_string()))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_checksum_mismatch_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let record = manager
            .set_baseline(&capture(b"pristine", "u"), &meta("main", "https://example.com/"))
            .unwrap();

        // Corrupt the payload behind the index's back
        std::fs::write(&record.path, b"tampered").unwrap();

        let err = manager.load_bytes(&record).unwrap_err();
        assert!(matches!(err, SnapError::ChecksumMismatch { .. }));

        // Quarantined records stop resolving, but are not deleted
        assert!(manager
            .get_baseline("https://example.com/", None, None, &LookupStrategy::Branch)
            .unwrap()
            .is_none());
        let all = manager
            .list_baselines(&BaselineFilter {
                include_quarantined: true,
                ..BaselineFilter::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].quarantined);
        assert!(record.path.exists());
    }

    #[test]
    fn test_update_baseline_clears_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let record = manager
            .set_baseline(&capture(b"ok", "u"), &meta("main", "https://example.com/"))
            .unwrap();

        std::fs::write(&record.path, b"tampered").unwrap();
        let _ = manager.load_bytes(&record);

        let updated = manager.update_baseline(&record.id, &capture(b"fresh", "u")).unwrap();
        assert!(!updated.quarantined);
        assert_eq!(manager.load_bytes(&updated).unwrap(), b"fresh");
    }

    #[test]
    fn test_update_missing_baseline_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let err = manager
            .update_baseline("does-not-exist", &capture(b"x", "u"))
            .unwrap_err();
        assert!(matches!(err, SnapError::BaselineNotFound(_)));
    }

    #[test]
    fn test_cleanup_removes_stale_records_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let record = manager
            .set_baseline(&capture(b"old", "u"), &meta("main", "https://example.com/old"))
            .unwrap();
        manager
            .set_baseline(&capture(b"new", "u"), &meta("main", "https://example.com/new"))
            .unwrap();

        // Age the first record beyond the cutoff
        {
            let conn = manager.conn.lock();
            conn.execute(
                "UPDATE baselines SET updated_at = ?1 WHERE id = ?2",
                params![Utc::now().timestamp() - 90 * 24 * 60 * 60, record.id],
            )
            .unwrap();
        }

        // Drop an orphan file into the branch shard
        let orphan = dir.path().join("baselines").join("main").join("orphan.png");
        std::fs::write(&orphan, b"junk").unwrap();

        let removed = manager.cleanup_old_baselines(30).unwrap();
        assert_eq!(removed, 1);
        assert!(!record.path.exists());
        assert!(!orphan.exists());
        assert_eq!(manager.list_baselines(&BaselineFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_branch_shard_sanitization() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let record = manager
            .set_baseline(&capture(b"img", "u"), &meta("feature/new-header", "https://example.com/"))
            .unwrap();
        assert!(record
            .path
            .to_string_lossy()
            .contains("feature-new-header"));
        assert!(record.path.exists());
    }
}
