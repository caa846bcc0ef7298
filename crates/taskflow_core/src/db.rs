use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};

use crate::merge::{BaselineEntry, ChangeRecord, FieldChange, MergeEngine};
use crate::model::{ProjectSnapshot, TaskField, now_unix};
use crate::runtime::ResolvedPaths;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshot_cache (
    backup_id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    cached_at_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshot_cache_project ON snapshot_cache(project);

CREATE TABLE IF NOT EXISTS change_history (
    task_id TEXT NOT NULL,
    field TEXT NOT NULL,
    original TEXT,
    current TEXT,
    edited_at_unix INTEGER NOT NULL,
    created_at_unix INTEGER NOT NULL,
    PRIMARY KEY (task_id, field)
);

CREATE TABLE IF NOT EXISTS baseline (
    task_id TEXT PRIMARY KEY,
    status TEXT,
    stage TEXT,
    assigned_to TEXT,
    updated_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub fn open_store(paths: &ResolvedPaths) -> Result<Connection> {
    let parent = paths
        .db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", paths.db_path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create database directory {}", parent.display()))?;

    let connection = Connection::open(&paths.db_path)
        .with_context(|| format!("failed to open {}", paths.db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    connection
        .execute_batch(SCHEMA_SQL)
        .context("failed to initialize taskflow schema")?;
    Ok(connection)
}

pub fn get_meta(connection: &Connection, key: &str) -> Result<Option<String>> {
    let mut statement = connection
        .prepare("SELECT value FROM meta WHERE key = ?1 LIMIT 1")
        .context("failed to prepare meta query")?;
    let mut rows = statement
        .query([key])
        .with_context(|| format!("failed to read meta key {key}"))?;
    match rows.next().context("failed to decode meta row")? {
        Some(row) => Ok(Some(row.get(0).context("failed to decode meta value")?)),
        None => Ok(None),
    }
}

pub fn set_meta(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to set meta key {key}"))?;
    Ok(())
}

pub fn last_backup_id(connection: &Connection, project: &str) -> Result<Option<String>> {
    get_meta(connection, &format!("last_backup_{project}"))
}

pub fn set_last_backup_id(connection: &Connection, project: &str, backup_id: &str) -> Result<()> {
    set_meta(connection, &format!("last_backup_{project}"), backup_id)
}

/// Cache one snapshot for the project, evicting any older entries; only
/// the latest backup is ever retained.
pub fn store_snapshot(
    connection: &Connection,
    project: &str,
    backup_id: &str,
    snapshot: &ProjectSnapshot,
) -> Result<()> {
    let content = serde_json::to_string(snapshot).context("failed to serialize snapshot")?;
    let content_hash = compute_hash(&content);
    connection
        .execute(
            "INSERT INTO snapshot_cache (backup_id, project, content, content_hash, cached_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(backup_id) DO UPDATE SET
                 project = excluded.project,
                 content = excluded.content,
                 content_hash = excluded.content_hash,
                 cached_at_unix = excluded.cached_at_unix",
            params![backup_id, project, content, content_hash, now_unix()],
        )
        .with_context(|| format!("failed to cache snapshot {backup_id}"))?;
    connection
        .execute(
            "DELETE FROM snapshot_cache WHERE project = ?1 AND backup_id != ?2",
            params![project, backup_id],
        )
        .context("failed to evict stale snapshot cache entries")?;
    Ok(())
}

pub fn load_snapshot(
    connection: &Connection,
    project: &str,
) -> Result<Option<(String, ProjectSnapshot)>> {
    let mut statement = connection
        .prepare(
            "SELECT backup_id, content FROM snapshot_cache
             WHERE project = ?1 ORDER BY cached_at_unix DESC LIMIT 1",
        )
        .context("failed to prepare snapshot cache query")?;
    let mut rows = statement
        .query([project])
        .with_context(|| format!("failed to read cached snapshot for {project}"))?;
    let Some(row) = rows.next().context("failed to decode snapshot cache row")? else {
        return Ok(None);
    };
    let backup_id: String = row.get(0).context("failed to decode backup id")?;
    let content: String = row.get(1).context("failed to decode snapshot content")?;
    let snapshot = serde_json::from_str(&content)
        .with_context(|| format!("cached snapshot {backup_id} is not valid JSON"))?;
    Ok(Some((backup_id, snapshot)))
}

pub fn clear_project_cache(connection: &Connection, project: &str) -> Result<usize> {
    let cleared = connection
        .execute("DELETE FROM snapshot_cache WHERE project = ?1", [project])
        .with_context(|| format!("failed to clear snapshot cache for {project}"))?;
    connection
        .execute(
            "DELETE FROM meta WHERE key = ?1",
            [format!("last_backup_{project}")],
        )
        .context("failed to clear last backup marker")?;
    Ok(cleared)
}

pub fn clear_all_cache(connection: &Connection) -> Result<usize> {
    let cleared = connection
        .execute("DELETE FROM snapshot_cache", [])
        .context("failed to clear snapshot cache")?;
    connection
        .execute("DELETE FROM meta WHERE key LIKE 'last_backup_%'", [])
        .context("failed to clear last backup markers")?;
    Ok(cleared)
}

#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub entries: usize,
    pub content_bytes: u64,
}

pub fn cache_info(connection: &Connection) -> Result<CacheInfo> {
    connection
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(content)), 0) FROM snapshot_cache",
            [],
            |row| {
                Ok(CacheInfo {
                    entries: usize::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
                    content_bytes: u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                })
            },
        )
        .context("failed to inspect snapshot cache")
}

/// Persist both engine stores, replacing whatever was saved before. Runs in
/// one transaction so a crash never leaves half a store behind.
pub fn save_engine_state(connection: &mut Connection, engine: &MergeEngine) -> Result<()> {
    let tx = connection
        .transaction()
        .context("failed to begin engine state transaction")?;
    tx.execute("DELETE FROM change_history", [])
        .context("failed to reset change history table")?;
    tx.execute("DELETE FROM baseline", [])
        .context("failed to reset baseline table")?;

    for (task_id, record) in engine.change_history() {
        for (field, change) in &record.changes {
            tx.execute(
                "INSERT INTO change_history
                     (task_id, field, original, current, edited_at_unix, created_at_unix)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task_id,
                    field.as_str(),
                    change.original,
                    change.current,
                    change.edited_at,
                    record.created_at
                ],
            )
            .with_context(|| format!("failed to persist change for task {task_id}"))?;
        }
    }
    for (task_id, entry) in engine.baseline() {
        tx.execute(
            "INSERT INTO baseline (task_id, status, stage, assigned_to, updated_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task_id,
                entry.status,
                entry.stage,
                entry.assigned_to,
                entry.updated_at
            ],
        )
        .with_context(|| format!("failed to persist baseline for task {task_id}"))?;
    }

    tx.commit().context("failed to commit engine state")
}

pub fn load_engine_state(connection: &Connection) -> Result<MergeEngine> {
    let mut change_history: BTreeMap<String, ChangeRecord> = BTreeMap::new();
    let mut statement = connection
        .prepare(
            "SELECT task_id, field, original, current, edited_at_unix, created_at_unix
             FROM change_history",
        )
        .context("failed to prepare change history query")?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .context("failed to run change history query")?;
    for row in rows {
        let (task_id, field, original, current, edited_at, created_at) =
            row.context("failed to decode change history row")?;
        let Some(field) = TaskField::parse(&field) else {
            // A row written by a newer schema; ignore rather than fail the load.
            continue;
        };
        change_history
            .entry(task_id)
            .or_insert_with(|| ChangeRecord {
                changes: BTreeMap::new(),
                created_at,
            })
            .changes
            .insert(
                field,
                FieldChange {
                    original,
                    current,
                    edited_at,
                },
            );
    }

    let mut baseline: BTreeMap<String, BaselineEntry> = BTreeMap::new();
    let mut statement = connection
        .prepare("SELECT task_id, status, stage, assigned_to, updated_at_unix FROM baseline")
        .context("failed to prepare baseline query")?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                BaselineEntry {
                    status: row.get(1)?,
                    stage: row.get(2)?,
                    assigned_to: row.get(3)?,
                    updated_at: row.get(4)?,
                },
            ))
        })
        .context("failed to run baseline query")?;
    for row in rows {
        let (task_id, entry) = row.context("failed to decode baseline row")?;
        baseline.insert(task_id, entry);
    }

    Ok(MergeEngine::from_parts(change_history, baseline))
}

fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{
        cache_info, clear_all_cache, clear_project_cache, last_backup_id, load_engine_state,
        load_snapshot, open_store, save_engine_state, set_last_backup_id, store_snapshot,
    };
    use crate::merge::MergeEngine;
    use crate::model::{ProjectSnapshot, SnapshotLine, SnapshotPage, Task, TaskField};
    use crate::runtime::{PathOverrides, ResolutionContext, resolve_paths};

    fn test_paths(root: &std::path::Path) -> crate::runtime::ResolvedPaths {
        let context = ResolutionContext {
            cwd: root.to_path_buf(),
        };
        resolve_paths(
            &context,
            &PathOverrides {
                project_root: Some(root.to_path_buf()),
                ..PathOverrides::default()
            },
        )
        .expect("resolve paths")
    }

    fn sample_snapshot() -> ProjectSnapshot {
        ProjectSnapshot {
            pages: vec![SnapshotPage {
                id: "p1".to_string(),
                title: "Alpha".to_string(),
                updated: 100,
                lines: vec![SnapshotLine::Text("Alpha".to_string())],
            }],
            project_name: Some("atlas-wiki".to_string()),
            backup_id: Some("b1".to_string()),
            fetched_at: None,
        }
    }

    fn sample_task() -> Task {
        Task {
            id: "p1".to_string(),
            title: "Alpha".to_string(),
            updated_at: 100,
            status: Some("Status_notStarted".to_string()),
            stage: None,
            assigned_to: None,
            start_date: None,
            due_date: None,
            project_stem: None,
            parent_task: None,
            tags: Default::default(),
            high_priority: false,
        }
    }

    #[test]
    fn snapshot_cache_round_trips_and_keeps_latest_only() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let connection = open_store(&paths).expect("open store");

        store_snapshot(&connection, "atlas-wiki", "b1", &sample_snapshot()).expect("store b1");
        store_snapshot(&connection, "atlas-wiki", "b2", &sample_snapshot()).expect("store b2");

        let (backup_id, snapshot) = load_snapshot(&connection, "atlas-wiki")
            .expect("load")
            .expect("cached entry");
        assert_eq!(backup_id, "b2");
        assert_eq!(snapshot.pages.len(), 1);
        assert_eq!(cache_info(&connection).expect("info").entries, 1);
    }

    #[test]
    fn last_backup_marker_round_trips() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let connection = open_store(&paths).expect("open store");

        assert_eq!(last_backup_id(&connection, "atlas-wiki").expect("read"), None);
        set_last_backup_id(&connection, "atlas-wiki", "b7").expect("set");
        assert_eq!(
            last_backup_id(&connection, "atlas-wiki").expect("read"),
            Some("b7".to_string())
        );
    }

    #[test]
    fn clearing_cache_removes_entries_and_markers() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let connection = open_store(&paths).expect("open store");

        store_snapshot(&connection, "atlas-wiki", "b1", &sample_snapshot()).expect("store");
        set_last_backup_id(&connection, "atlas-wiki", "b1").expect("set");

        assert_eq!(clear_project_cache(&connection, "atlas-wiki").expect("clear"), 1);
        assert_eq!(last_backup_id(&connection, "atlas-wiki").expect("read"), None);
        assert!(load_snapshot(&connection, "atlas-wiki").expect("load").is_none());

        store_snapshot(&connection, "other", "b9", &sample_snapshot()).expect("store");
        assert_eq!(clear_all_cache(&connection).expect("clear all"), 1);
    }

    #[test]
    fn engine_state_round_trips_through_sqlite() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let mut connection = open_store(&paths).expect("open store");

        let mut engine = MergeEngine::new();
        engine.initialize_from(&[sample_task()]);
        engine.record_change(
            "p1",
            TaskField::Status,
            Some("Status_notStarted"),
            Some("Status_inProgress"),
        );
        engine.record_change("p1", TaskField::Stage, None, Some("Stage_active"));

        save_engine_state(&mut connection, &engine).expect("save");
        let restored = load_engine_state(&connection).expect("load");

        assert_eq!(restored.change_history(), engine.change_history());
        assert_eq!(restored.baseline(), engine.baseline());
    }

    #[test]
    fn saving_again_replaces_previous_state() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let mut connection = open_store(&paths).expect("open store");

        let mut engine = MergeEngine::new();
        engine.record_change("p1", TaskField::Status, None, Some("Status_review"));
        save_engine_state(&mut connection, &engine).expect("save");

        engine.clear_change_history();
        save_engine_state(&mut connection, &engine).expect("save empty");

        let restored = load_engine_state(&connection).expect("load");
        assert!(restored.change_history().is_empty());
        assert!(restored.baseline().is_empty());
    }
}
