//! `SqlStore`: a `sea-orm`-backed realization of every repository trait over
//! a single SQLite connection.
//!
//! Grounded in the sibling `toka-store-sqlite` example's shape (one struct
//! wrapping one pool, `open`/`in_memory` constructors, a `migrate()` that
//! runs idempotent `CREATE TABLE IF NOT EXISTS` statements, `#[async_trait]`
//! trait impls) but driven through `sea_orm::Statement`/`ConnectionTrait`
//! raw SQL rather than `sqlx` directly, since `sea-orm` is the dependency
//! this crate actually carries.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement, Value as SeaValue};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::llm::LLMConfig;
use crate::model::commit::Operation;
use crate::model::event::{CompileRecord, OperationCommitRef};
use crate::model::{Annotation, Commit, OperationEvent, OperationKind, Priority, Ref, SpawnEdge, TractRecord};
use crate::storage::{
    AnnotationRepository, BlobRepository, CommitRepository, CompileRecordRepository, ConfigPredicate,
    OperationEventRepository, PendingWrite, RefRepository, SessionRepository, Store,
};

/// Current linear schema version. Bumped whenever a migration is added.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub struct SqlStore {
    conn: DatabaseConnection,
}

impl SqlStore {
    pub async fn open(path: &str) -> Result<Self, TraceError> {
        let url = format!("sqlite://{path}?mode=rwc");
        let conn = Database::connect(&url).await?;
        let store = Self { conn };
        store.apply_pragmas().await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, TraceError> {
        let conn = Database::connect("sqlite::memory:").await?;
        let store = Self { conn };
        store.apply_pragmas().await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_connection(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    async fn apply_pragmas(&self) -> Result<(), TraceError> {
        for pragma in [
            "PRAGMA journal_mode=WAL;",
            "PRAGMA busy_timeout=5000;",
            "PRAGMA foreign_keys=ON;",
            "PRAGMA synchronous=NORMAL;",
        ] {
            self.conn
                .execute(Statement::from_string(DbBackend::Sqlite, pragma.to_string()))
                .await?;
        }
        Ok(())
    }

    async fn migrate(&self) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_string(
                DbBackend::Sqlite,
                "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);".to_string(),
            ))
            .await?;

        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
            ))
            .await?;
        let stored_version: i64 = match row {
            Some(row) => row.try_get::<String>("", "value")?.parse().unwrap_or(0),
            None => 0,
        };

        if stored_version > CURRENT_SCHEMA_VERSION {
            return Err(TraceError::CustomError(format!(
                "database schema version {stored_version} is newer than this build supports ({CURRENT_SCHEMA_VERSION})"
            )));
        }

        self.run_migrations(stored_version).await?;

        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [SeaValue::from(CURRENT_SCHEMA_VERSION.to_string())],
            ))
            .await?;
        Ok(())
    }

    async fn run_migrations(&self, from_version: i64) -> Result<(), TraceError> {
        if from_version < 1 {
            for stmt in MIGRATION_V1 {
                self.conn
                    .execute(Statement::from_string(DbBackend::Sqlite, stmt.to_string()))
                    .await?;
            }
        }
        Ok(())
    }
}

const MIGRATION_V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blobs (
        content_hash TEXT PRIMARY KEY,
        bytes BLOB NOT NULL,
        size INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS commits (
        commit_hash TEXT PRIMARY KEY,
        tract_id TEXT NOT NULL,
        content_hash TEXT NOT NULL REFERENCES blobs(content_hash),
        content_type TEXT NOT NULL,
        parent_hash TEXT REFERENCES commits(commit_hash),
        operation TEXT NOT NULL,
        edit_target TEXT REFERENCES commits(commit_hash),
        message TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        generation_config_json TEXT,
        token_count INTEGER NOT NULL,
        token_source TEXT,
        created_at TEXT NOT NULL,
        reply_to TEXT REFERENCES commits(commit_hash)
    );",
    "CREATE INDEX IF NOT EXISTS idx_commits_tract_created ON commits(tract_id, created_at);",
    "CREATE INDEX IF NOT EXISTS idx_commits_tract_parent ON commits(tract_id, parent_hash);",
    "CREATE INDEX IF NOT EXISTS idx_commits_content_type ON commits(content_type);",
    "CREATE TABLE IF NOT EXISTS commit_parents (
        commit_hash TEXT NOT NULL REFERENCES commits(commit_hash),
        parent_hash TEXT NOT NULL REFERENCES commits(commit_hash),
        PRIMARY KEY (commit_hash, parent_hash)
    );",
    "CREATE TABLE IF NOT EXISTS refs (
        tract_id TEXT NOT NULL,
        ref_name TEXT NOT NULL,
        commit_hash TEXT NOT NULL REFERENCES commits(commit_hash),
        PRIMARY KEY (tract_id, ref_name)
    );",
    "CREATE TABLE IF NOT EXISTS annotations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        target_hash TEXT NOT NULL REFERENCES commits(commit_hash),
        priority TEXT NOT NULL,
        reason TEXT,
        created_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_annotations_target_created ON annotations(target_hash, created_at);",
    "CREATE TABLE IF NOT EXISTS operation_events (
        event_id TEXT PRIMARY KEY,
        tract_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        params_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS operation_commits (
        event_id TEXT NOT NULL REFERENCES operation_events(event_id),
        role TEXT NOT NULL,
        commit_hash TEXT NOT NULL,
        PRIMARY KEY (event_id, role, commit_hash)
    );",
    "CREATE TABLE IF NOT EXISTS compile_records (
        record_id TEXT PRIMARY KEY,
        tract_id TEXT NOT NULL,
        head_hash TEXT,
        token_count INTEGER NOT NULL,
        commit_count INTEGER NOT NULL,
        token_source TEXT NOT NULL,
        created_at TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS compile_effective (
        record_id TEXT NOT NULL REFERENCES compile_records(record_id),
        position INTEGER NOT NULL,
        commit_hash TEXT NOT NULL,
        PRIMARY KEY (record_id, position)
    );",
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS tracts (
        tract_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(session_id),
        display_name TEXT,
        created_at TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS spawn_edges (
        parent_tract_id TEXT NOT NULL,
        child_tract_id TEXT NOT NULL PRIMARY KEY,
        spawn_point_hash TEXT,
        purpose TEXT,
        created_at TEXT NOT NULL
    );",
];

fn commit_from_row(row: &sea_orm::QueryResult) -> Result<Commit, TraceError> {
    let commit_hash: String = row.try_get("", "commit_hash")?;
    let tract_id: String = row.try_get("", "tract_id")?;
    let content_hash: String = row.try_get("", "content_hash")?;
    let content_type: String = row.try_get("", "content_type")?;
    let parent_hash: Option<String> = row.try_get("", "parent_hash")?;
    let operation: String = row.try_get("", "operation")?;
    let edit_target: Option<String> = row.try_get("", "edit_target")?;
    let message: String = row.try_get("", "message")?;
    let metadata_json: String = row.try_get("", "metadata_json")?;
    let generation_config_json: Option<String> = row.try_get("", "generation_config_json")?;
    let token_count: i64 = row.try_get("", "token_count")?;
    let token_source: Option<String> = row.try_get("", "token_source")?;
    let created_at: String = row.try_get("", "created_at")?;
    let reply_to: Option<String> = row.try_get("", "reply_to")?;

    Ok(Commit {
        commit_hash: commit_hash.parse().map_err(TraceError::CustomError)?,
        tract_id: Uuid::parse_str(&tract_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
        content_hash: content_hash.parse().map_err(TraceError::CustomError)?,
        content_type,
        parent_hash: parent_hash.map(|h| h.parse()).transpose().map_err(TraceError::CustomError)?,
        operation: if operation == "EDIT" { Operation::Edit } else { Operation::Append },
        edit_target: edit_target.map(|h| h.parse()).transpose().map_err(TraceError::CustomError)?,
        message,
        metadata: serde_json::from_str(&metadata_json)?,
        generation_config: generation_config_json
            .map(|s| serde_json::from_str::<LLMConfig>(&s))
            .transpose()?,
        token_count: token_count as u64,
        token_source,
        created_at: NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| TraceError::CustomError(e.to_string()))?,
        reply_to: reply_to.map(|h| h.parse()).transpose().map_err(TraceError::CustomError)?,
    })
}

fn naive_to_string(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

#[async_trait]
impl BlobRepository for SqlStore {
    async fn save_if_absent(&self, content_hash: TraceHash, bytes: &[u8]) -> Result<bool, TraceError> {
        let res = self
            .conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT OR IGNORE INTO blobs (content_hash, bytes, size) VALUES (?1, ?2, ?3)",
                [
                    SeaValue::from(content_hash.to_hex()),
                    SeaValue::from(bytes.to_vec()),
                    SeaValue::from(bytes.len() as i64),
                ],
            ))
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_blob(&self, content_hash: TraceHash) -> Result<Vec<u8>, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT bytes FROM blobs WHERE content_hash = ?1",
                [SeaValue::from(content_hash.to_hex())],
            ))
            .await?
            .ok_or_else(|| TraceError::not_found("blob", content_hash))?;
        Ok(row.try_get::<Vec<u8>>("", "bytes")?)
    }

    async fn delete_if_orphaned(&self, content_hash: TraceHash) -> Result<bool, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT COUNT(*) as c FROM commits WHERE content_hash = ?1",
                [SeaValue::from(content_hash.to_hex())],
            ))
            .await?;
        let refs: i64 = match row {
            Some(r) => r.try_get("", "c")?,
            None => 0,
        };
        if refs > 0 {
            return Ok(false);
        }
        let res = self
            .conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "DELETE FROM blobs WHERE content_hash = ?1",
                [SeaValue::from(content_hash.to_hex())],
            ))
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl CommitRepository for SqlStore {
    async fn create(&self, commit: &Commit) -> Result<(), TraceError> {
        let generation_config_json = commit
            .generation_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO commits (commit_hash, tract_id, content_hash, content_type, parent_hash, \
                 operation, edit_target, message, metadata_json, generation_config_json, token_count, \
                 token_source, created_at, reply_to) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                [
                    SeaValue::from(commit.commit_hash.to_hex()),
                    SeaValue::from(commit.tract_id.to_string()),
                    SeaValue::from(commit.content_hash.to_hex()),
                    SeaValue::from(commit.content_type.clone()),
                    SeaValue::from(commit.parent_hash.map(|h| h.to_hex())),
                    SeaValue::from(commit.operation.as_str().to_string()),
                    SeaValue::from(commit.edit_target.map(|h| h.to_hex())),
                    SeaValue::from(commit.message.clone()),
                    SeaValue::from(commit.metadata.to_string()),
                    SeaValue::from(generation_config_json),
                    SeaValue::from(commit.token_count as i64),
                    SeaValue::from(commit.token_source.clone()),
                    SeaValue::from(naive_to_string(commit.created_at)),
                    SeaValue::from(commit.reply_to.map(|h| h.to_hex())),
                ],
            ))
            .await?;
        if let Some(parent) = commit.parent_hash {
            self.conn
                .execute(Statement::from_sql_and_values(
                    DbBackend::Sqlite,
                    "INSERT OR IGNORE INTO commit_parents (commit_hash, parent_hash) VALUES (?1, ?2)",
                    [SeaValue::from(commit.commit_hash.to_hex()), SeaValue::from(parent.to_hex())],
                ))
                .await?;
        }
        Ok(())
    }

    async fn get(&self, commit_hash: TraceHash) -> Result<Commit, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM commits WHERE commit_hash = ?1",
                [SeaValue::from(commit_hash.to_hex())],
            ))
            .await?
            .ok_or_else(|| TraceError::not_found("commit", commit_hash))?;
        commit_from_row(&row)
    }

    async fn get_by_tract(&self, tract_id: Uuid, limit: Option<u64>) -> Result<Vec<Commit>, TraceError> {
        let sql = match limit {
            Some(_) => "SELECT * FROM commits WHERE tract_id = ?1 ORDER BY created_at ASC LIMIT ?2",
            None => "SELECT * FROM commits WHERE tract_id = ?1 ORDER BY created_at ASC",
        };
        let mut values = vec![SeaValue::from(tract_id.to_string())];
        if let Some(n) = limit {
            values.push(SeaValue::from(n as i64));
        }
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(DbBackend::Sqlite, sql, values))
            .await?;
        rows.iter().map(commit_from_row).collect()
    }

    async fn get_by_config(
        &self,
        tract_id: Uuid,
        predicate: ConfigPredicate,
    ) -> Result<Vec<Commit>, TraceError> {
        self.get_by_config_multi(tract_id, std::slice::from_ref(&predicate)).await
    }

    async fn get_by_config_multi(
        &self,
        tract_id: Uuid,
        predicates: &[ConfigPredicate],
    ) -> Result<Vec<Commit>, TraceError> {
        let mut sql = "SELECT * FROM commits WHERE tract_id = ?1".to_string();
        let mut values = vec![SeaValue::from(tract_id.to_string())];
        for p in predicates {
            let placeholder = format!("?{}", values.len() + 1);
            sql.push_str(&format!(
                " AND json_extract(generation_config_json, '$.{}') {} {}",
                p.field,
                p.op.as_sql(),
                placeholder
            ));
            values.push(json_value_to_sea(&p.value));
        }
        sql.push_str(" ORDER BY created_at ASC");
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(DbBackend::Sqlite, sql, values))
            .await?;
        rows.iter().map(commit_from_row).collect()
    }

    async fn get_children(&self, commit_hash: TraceHash) -> Result<Vec<Commit>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM commits WHERE parent_hash = ?1 OR edit_target = ?1",
                [SeaValue::from(commit_hash.to_hex())],
            ))
            .await?;
        rows.iter().map(commit_from_row).collect()
    }

    async fn add_parent(&self, commit_hash: TraceHash, parent_hash: TraceHash) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT OR IGNORE INTO commit_parents (commit_hash, parent_hash) VALUES (?1, ?2)",
                [SeaValue::from(commit_hash.to_hex()), SeaValue::from(parent_hash.to_hex())],
            ))
            .await?;
        Ok(())
    }

    async fn get_parents(&self, commit_hash: TraceHash) -> Result<Vec<TraceHash>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT parent_hash FROM commit_parents WHERE commit_hash = ?1",
                [SeaValue::from(commit_hash.to_hex())],
            ))
            .await?;
        rows.iter()
            .map(|r| {
                let hex: String = r.try_get("", "parent_hash")?;
                hex.parse().map_err(TraceError::CustomError)
            })
            .collect()
    }

    async fn update_token_usage(
        &self,
        commit_hash: TraceHash,
        token_count: u64,
        token_source: &str,
    ) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE commits SET token_count = ?1, token_source = ?2 WHERE commit_hash = ?3",
                [
                    SeaValue::from(token_count as i64),
                    SeaValue::from(token_source.to_string()),
                    SeaValue::from(commit_hash.to_hex()),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn delete(&self, commit_hash: TraceHash) -> Result<(), TraceError> {
        let hex = commit_hash.to_hex();
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "DELETE FROM annotations WHERE target_hash = ?1",
                [SeaValue::from(hex.clone())],
            ))
            .await?;
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "DELETE FROM operation_commits WHERE commit_hash = ?1",
                [SeaValue::from(hex.clone())],
            ))
            .await?;
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE commits SET parent_hash = NULL WHERE parent_hash = ?1",
                [SeaValue::from(hex.clone())],
            ))
            .await?;
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE commits SET edit_target = NULL WHERE edit_target = ?1",
                [SeaValue::from(hex.clone())],
            ))
            .await?;
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "DELETE FROM commit_parents WHERE commit_hash = ?1 OR parent_hash = ?1",
                [SeaValue::from(hex.clone())],
            ))
            .await?;
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "DELETE FROM refs WHERE commit_hash = ?1",
                [SeaValue::from(hex.clone())],
            ))
            .await?;
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "DELETE FROM commits WHERE commit_hash = ?1",
                [SeaValue::from(hex)],
            ))
            .await?;
        Ok(())
    }
}

fn json_value_to_sea(value: &JsonValue) -> SeaValue {
    match value {
        JsonValue::String(s) => SeaValue::from(s.clone()),
        JsonValue::Number(n) if n.is_i64() => SeaValue::from(n.as_i64().unwrap()),
        JsonValue::Number(n) => SeaValue::from(n.as_f64().unwrap_or_default()),
        JsonValue::Bool(b) => SeaValue::from(*b),
        other => SeaValue::from(other.to_string()),
    }
}

#[async_trait]
impl RefRepository for SqlStore {
    async fn set(&self, tract_id: Uuid, ref_name: &str, commit_hash: TraceHash) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO refs (tract_id, ref_name, commit_hash) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(tract_id, ref_name) DO UPDATE SET commit_hash = excluded.commit_hash",
                [
                    SeaValue::from(tract_id.to_string()),
                    SeaValue::from(ref_name.to_string()),
                    SeaValue::from(commit_hash.to_hex()),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn get(&self, tract_id: Uuid, ref_name: &str) -> Result<Option<TraceHash>, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT commit_hash FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
                [SeaValue::from(tract_id.to_string()), SeaValue::from(ref_name.to_string())],
            ))
            .await?;
        match row {
            Some(r) => {
                let hex: String = r.try_get("", "commit_hash")?;
                Ok(Some(hex.parse().map_err(TraceError::CustomError)?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, tract_id: Uuid, prefix: Option<&str>) -> Result<Vec<Ref>, TraceError> {
        let (sql, values) = match prefix {
            Some(p) => (
                "SELECT ref_name, commit_hash FROM refs WHERE tract_id = ?1 AND ref_name LIKE ?2",
                vec![SeaValue::from(tract_id.to_string()), SeaValue::from(format!("{p}%"))],
            ),
            None => (
                "SELECT ref_name, commit_hash FROM refs WHERE tract_id = ?1",
                vec![SeaValue::from(tract_id.to_string())],
            ),
        };
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(DbBackend::Sqlite, sql, values))
            .await?;
        rows.iter()
            .map(|r| {
                let ref_name: String = r.try_get("", "ref_name")?;
                let hex: String = r.try_get("", "commit_hash")?;
                Ok(Ref {
                    ref_name,
                    commit_hash: hex.parse().map_err(TraceError::CustomError)?,
                })
            })
            .collect()
    }

    async fn delete(&self, tract_id: Uuid, ref_name: &str) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "DELETE FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
                [SeaValue::from(tract_id.to_string()), SeaValue::from(ref_name.to_string())],
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AnnotationRepository for SqlStore {
    async fn insert(
        &self,
        target_hash: TraceHash,
        priority: Priority,
        reason: Option<&str>,
        created_at: NaiveDateTime,
    ) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO annotations (target_hash, priority, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
                [
                    SeaValue::from(target_hash.to_hex()),
                    SeaValue::from(priority.as_str().to_string()),
                    SeaValue::from(reason.map(str::to_string)),
                    SeaValue::from(naive_to_string(created_at)),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn get_latest(&self, target_hash: TraceHash) -> Result<Option<Annotation>, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM annotations WHERE target_hash = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                [SeaValue::from(target_hash.to_hex())],
            ))
            .await?;
        row.map(|r| annotation_from_row(&r, target_hash)).transpose()
    }

    async fn batch_get_latest(
        &self,
        target_hashes: &[TraceHash],
    ) -> Result<HashMap<TraceHash, Annotation>, TraceError> {
        if target_hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders: Vec<String> = (1..=target_hashes.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT a.* FROM annotations a \
             INNER JOIN (
                SELECT target_hash, MAX(created_at) as max_created_at \
                FROM annotations WHERE target_hash IN ({}) GROUP BY target_hash
             ) latest ON a.target_hash = latest.target_hash AND a.created_at = latest.max_created_at",
            placeholders.join(", ")
        );
        let values: Vec<SeaValue> = target_hashes.iter().map(|h| SeaValue::from(h.to_hex())).collect();
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(DbBackend::Sqlite, sql, values))
            .await?;
        let mut out = HashMap::new();
        for row in &rows {
            let target_hex: String = row.try_get("", "target_hash")?;
            let target: TraceHash = target_hex.parse().map_err(TraceError::CustomError)?;
            out.insert(target, annotation_from_row(row, target)?);
        }
        Ok(out)
    }
}

fn annotation_from_row(row: &sea_orm::QueryResult, target_hash: TraceHash) -> Result<Annotation, TraceError> {
    let id: i64 = row.try_get("", "id")?;
    let priority: String = row.try_get("", "priority")?;
    let reason: Option<String> = row.try_get("", "reason")?;
    let created_at: String = row.try_get("", "created_at")?;
    Ok(Annotation {
        id,
        target_hash,
        priority: match priority.as_str() {
            "PINNED" => Priority::Pinned,
            "SKIP" => Priority::Skip,
            _ => Priority::Normal,
        },
        reason,
        created_at: NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| TraceError::CustomError(e.to_string()))?,
    })
}

#[async_trait]
impl OperationEventRepository for SqlStore {
    async fn save_event(&self, event: &OperationEvent) -> Result<(), TraceError> {
        let kind = match event.kind {
            crate::model::event::OperationKind::Compress => "compress",
            crate::model::event::OperationKind::Reorganize => "reorganize",
            crate::model::event::OperationKind::Import => "import",
        };
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO operation_events (event_id, tract_id, kind, params_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                [
                    SeaValue::from(event.event_id.to_string()),
                    SeaValue::from(event.tract_id.to_string()),
                    SeaValue::from(kind.to_string()),
                    SeaValue::from(event.params.to_string()),
                    SeaValue::from(naive_to_string(event.created_at)),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn add_commit(&self, link: &OperationCommitRef) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT OR IGNORE INTO operation_commits (event_id, role, commit_hash) VALUES (?1, ?2, ?3)",
                [
                    SeaValue::from(link.event_id.to_string()),
                    SeaValue::from(link.role.clone()),
                    SeaValue::from(link.commit_hash.to_hex()),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn get_event(&self, event_id: Uuid) -> Result<OperationEvent, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM operation_events WHERE event_id = ?1",
                [SeaValue::from(event_id.to_string())],
            ))
            .await?
            .ok_or_else(|| TraceError::not_found("operation event", event_id))?;
        operation_event_from_row(&row)
    }

    async fn get_commits_for_event(&self, event_id: Uuid) -> Result<Vec<OperationCommitRef>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM operation_commits WHERE event_id = ?1",
                [SeaValue::from(event_id.to_string())],
            ))
            .await?;
        rows.iter()
            .map(|r| {
                let role: String = r.try_get("", "role")?;
                let hex: String = r.try_get("", "commit_hash")?;
                Ok(OperationCommitRef {
                    event_id,
                    role,
                    commit_hash: hex.parse().map_err(TraceError::CustomError)?,
                })
            })
            .collect()
    }

    async fn list_events(&self, tract_id: Uuid) -> Result<Vec<OperationEvent>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM operation_events WHERE tract_id = ?1 ORDER BY created_at ASC",
                [SeaValue::from(tract_id.to_string())],
            ))
            .await?;
        rows.iter().map(operation_event_from_row).collect()
    }
}

fn operation_event_from_row(row: &sea_orm::QueryResult) -> Result<OperationEvent, TraceError> {
    let event_id: String = row.try_get("", "event_id")?;
    let tract_id: String = row.try_get("", "tract_id")?;
    let kind: String = row.try_get("", "kind")?;
    let params_json: String = row.try_get("", "params_json")?;
    let created_at: String = row.try_get("", "created_at")?;
    Ok(OperationEvent {
        event_id: Uuid::parse_str(&event_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
        tract_id: Uuid::parse_str(&tract_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
        kind: match kind.as_str() {
            "reorganize" => OperationKind::Reorganize,
            "import" => OperationKind::Import,
            _ => OperationKind::Compress,
        },
        params: serde_json::from_str(&params_json)?,
        created_at: NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| TraceError::CustomError(e.to_string()))?,
    })
}

#[async_trait]
impl CompileRecordRepository for SqlStore {
    async fn save(&self, record: &CompileRecord, effective_commits: &[TraceHash]) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO compile_records (record_id, tract_id, head_hash, token_count, commit_count, \
                 token_source, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                [
                    SeaValue::from(record.record_id.to_string()),
                    SeaValue::from(record.tract_id.to_string()),
                    SeaValue::from(record.head_hash.map(|h| h.to_hex())),
                    SeaValue::from(record.token_count as i64),
                    SeaValue::from(record.commit_count as i64),
                    SeaValue::from(record.token_source.clone()),
                    SeaValue::from(naive_to_string(record.created_at)),
                ],
            ))
            .await?;
        for (position, hash) in effective_commits.iter().enumerate() {
            self.conn
                .execute(Statement::from_sql_and_values(
                    DbBackend::Sqlite,
                    "INSERT INTO compile_effective (record_id, position, commit_hash) VALUES (?1, ?2, ?3)",
                    [
                        SeaValue::from(record.record_id.to_string()),
                        SeaValue::from(position as i64),
                        SeaValue::from(hash.to_hex()),
                    ],
                ))
                .await?;
        }
        Ok(())
    }

    async fn list(&self, tract_id: Uuid) -> Result<Vec<CompileRecord>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM compile_records WHERE tract_id = ?1 ORDER BY created_at ASC",
                [SeaValue::from(tract_id.to_string())],
            ))
            .await?;
        rows.iter()
            .map(|row| {
                let record_id: String = row.try_get("", "record_id")?;
                let tract_id: String = row.try_get("", "tract_id")?;
                let head_hash: Option<String> = row.try_get("", "head_hash")?;
                let token_count: i64 = row.try_get("", "token_count")?;
                let commit_count: i64 = row.try_get("", "commit_count")?;
                let token_source: String = row.try_get("", "token_source")?;
                let created_at: String = row.try_get("", "created_at")?;
                Ok(CompileRecord {
                    record_id: Uuid::parse_str(&record_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
                    tract_id: Uuid::parse_str(&tract_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
                    head_hash: head_hash.map(|h| h.parse()).transpose().map_err(TraceError::CustomError)?,
                    token_count: token_count as u64,
                    commit_count: commit_count as u64,
                    token_source,
                    created_at: NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%dT%H:%M:%S%.f")
                        .map_err(|e| TraceError::CustomError(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn get_effective_commits(&self, record_id: Uuid) -> Result<Vec<TraceHash>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT commit_hash FROM compile_effective WHERE record_id = ?1 ORDER BY position ASC",
                [SeaValue::from(record_id.to_string())],
            ))
            .await?;
        rows.iter()
            .map(|r| {
                let hex: String = r.try_get("", "commit_hash")?;
                hex.parse().map_err(TraceError::CustomError)
            })
            .collect()
    }
}

fn tract_record_from_row(row: &sea_orm::QueryResult) -> Result<TractRecord, TraceError> {
    let tract_id: String = row.try_get("", "tract_id")?;
    let session_id: String = row.try_get("", "session_id")?;
    let display_name: Option<String> = row.try_get("", "display_name")?;
    let created_at: String = row.try_get("", "created_at")?;
    Ok(TractRecord {
        tract_id: Uuid::parse_str(&tract_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
        session_id: Uuid::parse_str(&session_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
        display_name,
        created_at: NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| TraceError::CustomError(e.to_string()))?,
    })
}

fn spawn_edge_from_row(row: &sea_orm::QueryResult) -> Result<SpawnEdge, TraceError> {
    let parent_tract_id: String = row.try_get("", "parent_tract_id")?;
    let child_tract_id: String = row.try_get("", "child_tract_id")?;
    let spawn_point_hash: Option<String> = row.try_get("", "spawn_point_hash")?;
    let purpose: Option<String> = row.try_get("", "purpose")?;
    let created_at: String = row.try_get("", "created_at")?;
    Ok(SpawnEdge {
        parent_tract_id: Uuid::parse_str(&parent_tract_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
        child_tract_id: Uuid::parse_str(&child_tract_id).map_err(|e| TraceError::CustomError(e.to_string()))?,
        spawn_point_hash: spawn_point_hash.map(|h| h.parse()).transpose().map_err(TraceError::CustomError)?,
        purpose,
        created_at: NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| TraceError::CustomError(e.to_string()))?,
    })
}

#[async_trait]
impl SessionRepository for SqlStore {
    async fn create_session(&self, session_id: Uuid, created_at: NaiveDateTime) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO sessions (session_id, created_at) VALUES (?1, ?2)",
                [SeaValue::from(session_id.to_string()), SeaValue::from(naive_to_string(created_at))],
            ))
            .await?;
        Ok(())
    }

    async fn session_exists(&self, session_id: Uuid) -> Result<bool, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT session_id FROM sessions WHERE session_id = ?1",
                [SeaValue::from(session_id.to_string())],
            ))
            .await?;
        Ok(row.is_some())
    }

    async fn register_tract(
        &self,
        tract_id: Uuid,
        session_id: Uuid,
        display_name: Option<&str>,
        created_at: NaiveDateTime,
    ) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO tracts (tract_id, session_id, display_name, created_at) VALUES (?1, ?2, ?3, ?4)",
                [
                    SeaValue::from(tract_id.to_string()),
                    SeaValue::from(session_id.to_string()),
                    SeaValue::from(display_name.map(str::to_string)),
                    SeaValue::from(naive_to_string(created_at)),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn get_tract(&self, tract_id: Uuid) -> Result<TractRecord, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM tracts WHERE tract_id = ?1",
                [SeaValue::from(tract_id.to_string())],
            ))
            .await?
            .ok_or_else(|| TraceError::not_found("tract", tract_id))?;
        tract_record_from_row(&row)
    }

    async fn list_tracts(&self, session_id: Uuid) -> Result<Vec<TractRecord>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM tracts WHERE session_id = ?1 ORDER BY created_at ASC",
                [SeaValue::from(session_id.to_string())],
            ))
            .await?;
        rows.iter().map(tract_record_from_row).collect()
    }

    async fn record_spawn(&self, edge: &SpawnEdge) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO spawn_edges (parent_tract_id, child_tract_id, spawn_point_hash, purpose, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                [
                    SeaValue::from(edge.parent_tract_id.to_string()),
                    SeaValue::from(edge.child_tract_id.to_string()),
                    SeaValue::from(edge.spawn_point_hash.map(|h| h.to_hex())),
                    SeaValue::from(edge.purpose.clone()),
                    SeaValue::from(naive_to_string(edge.created_at)),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn get_spawn_edge(&self, child_tract_id: Uuid) -> Result<Option<SpawnEdge>, TraceError> {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM spawn_edges WHERE child_tract_id = ?1",
                [SeaValue::from(child_tract_id.to_string())],
            ))
            .await?;
        row.map(|r| spawn_edge_from_row(&r)).transpose()
    }

    async fn list_children(&self, parent_tract_id: Uuid) -> Result<Vec<SpawnEdge>, TraceError> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT * FROM spawn_edges WHERE parent_tract_id = ?1 ORDER BY created_at ASC",
                [SeaValue::from(parent_tract_id.to_string())],
            ))
            .await?;
        rows.iter().map(spawn_edge_from_row).collect()
    }
}

#[async_trait]
impl Store for SqlStore {
    /// Wraps the whole batch in one SQLite transaction: every deferred write
    /// commits together or none do, matching the nested-transaction contract
    /// a `BatchScope` promises its caller.
    async fn execute_batch(&self, ops: Vec<PendingWrite>) -> Result<(), TraceError> {
        self.conn
            .execute(Statement::from_string(DbBackend::Sqlite, "BEGIN;".to_string()))
            .await?;
        for op in ops {
            let result = match op {
                PendingWrite::Commit(commit) => self.create(&commit).await,
                PendingWrite::Blob { content_hash, bytes } => {
                    self.save_if_absent(content_hash, &bytes).await.map(|_| ())
                }
                PendingWrite::Annotation {
                    target_hash,
                    priority,
                    reason,
                    created_at,
                } => self.insert(target_hash, priority, reason.as_deref(), created_at).await,
                PendingWrite::RefSet {
                    tract_id,
                    ref_name,
                    commit_hash,
                } => self.set(tract_id, &ref_name, commit_hash).await,
            };
            if let Err(e) = result {
                self.conn
                    .execute(Statement::from_string(DbBackend::Sqlite, "ROLLBACK;".to_string()))
                    .await
                    .ok();
                return Err(e);
            }
        }
        self.conn
            .execute(Statement::from_string(DbBackend::Sqlite, "COMMIT;".to_string()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    #[tokio::test]
    async fn blob_dedup_on_repeated_insert() {
        let store = SqlStore::in_memory().await.expect("open");
        let hash = TraceHash::of_bytes(b"same content");
        assert!(store.save_if_absent(hash, b"same content").await.expect("insert"));
        assert!(!store.save_if_absent(hash, b"same content").await.expect("insert again"));
        assert_eq!(store.get_blob(hash).await.expect("get"), b"same content");
    }

    #[tokio::test]
    async fn commit_round_trips_through_storage() {
        let store = SqlStore::in_memory().await.expect("open");
        let content_hash = TraceHash::of_bytes(b"payload");
        store.save_if_absent(content_hash, b"payload").await.expect("blob insert");

        let commit = crate::model::commit::NewCommit {
            tract_id: Uuid::from_u128(7),
            content_hash,
            content_type: "instruction".to_string(),
            parent_hash: None,
            operation: Operation::Append,
            edit_target: None,
            message: "instruction: hi".to_string(),
            metadata: serde_json::json!({}),
            generation_config: None,
            created_at: now(),
            reply_to: None,
        }
        .into_commit(3, Some("tiktoken:o200k_base".to_string()));

        store.create(&commit).await.expect("commit insert");
        let fetched = store.get(commit.commit_hash).await.expect("commit fetch");
        assert_eq!(fetched.commit_hash, commit.commit_hash);
        assert_eq!(fetched.message, "instruction: hi");
    }

    #[tokio::test]
    async fn ref_survives_reopen_against_same_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tract.db");
        let path_str = path.to_str().unwrap().to_string();

        let tract_id = Uuid::from_u128(42);
        let hash = TraceHash::of_bytes(b"root");
        {
            let store = SqlStore::open(&path_str).await.expect("open");
            store.save_if_absent(hash, b"root").await.expect("blob");
            let commit = crate::model::commit::NewCommit {
                tract_id,
                content_hash: hash,
                content_type: "instruction".to_string(),
                parent_hash: None,
                operation: Operation::Append,
                edit_target: None,
                message: "instruction: root".to_string(),
                metadata: serde_json::json!({}),
                generation_config: None,
                created_at: now(),
                reply_to: None,
            }
            .into_commit(1, None);
            store.create(&commit).await.expect("create");
            store.set(tract_id, "HEAD/main", commit.commit_hash).await.expect("set ref");
        }
        {
            let store = SqlStore::open(&path_str).await.expect("reopen");
            let head = store.get(tract_id, "HEAD/main").await.expect("get ref");
            assert!(head.is_some());
        }
    }

    #[tokio::test]
    async fn annotation_latest_wins_by_created_at() {
        let store = SqlStore::in_memory().await.expect("open");
        let target = TraceHash::of_bytes(b"target");
        let t1 = now();
        let t2 = t1 + chrono::Duration::seconds(1);
        store.insert(target, Priority::Normal, None, t1).await.expect("insert1");
        store.insert(target, Priority::Pinned, Some("important"), t2).await.expect("insert2");
        let latest = store.get_latest(target).await.expect("latest").expect("some");
        assert_eq!(latest.priority, Priority::Pinned);
    }

    #[tokio::test]
    async fn session_registers_tracts_and_spawn_edges() {
        let store = SqlStore::in_memory().await.expect("open");
        let session_id = Uuid::from_u128(100);
        let root_tract = Uuid::from_u128(101);
        let child_tract = Uuid::from_u128(102);

        store.create_session(session_id, now()).await.expect("create session");
        assert!(store.session_exists(session_id).await.expect("exists"));
        assert!(!store.session_exists(Uuid::from_u128(999)).await.expect("exists"));

        store
            .register_tract(root_tract, session_id, Some("main"), now())
            .await
            .expect("register root");
        store
            .register_tract(child_tract, session_id, None, now())
            .await
            .expect("register child");

        let tracts = store.list_tracts(session_id).await.expect("list tracts");
        assert_eq!(tracts.len(), 2);
        let fetched = store.get_tract(root_tract).await.expect("get tract");
        assert_eq!(fetched.display_name.as_deref(), Some("main"));

        let spawn_point = TraceHash::of_bytes(b"fork point");
        store
            .record_spawn(&SpawnEdge {
                parent_tract_id: root_tract,
                child_tract_id: child_tract,
                spawn_point_hash: Some(spawn_point),
                purpose: Some("explore alternative".to_string()),
                created_at: now(),
            })
            .await
            .expect("record spawn");

        let edge = store
            .get_spawn_edge(child_tract)
            .await
            .expect("get spawn edge")
            .expect("some edge");
        assert_eq!(edge.parent_tract_id, root_tract);
        assert_eq!(edge.spawn_point_hash, Some(spawn_point));

        let children = store.list_children(root_tract).await.expect("list children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].child_tract_id, child_tract);

        assert!(store
            .get_spawn_edge(root_tract)
            .await
            .expect("root has no spawn edge")
            .is_none());
    }
}
