use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(feature = "sqlite-store")]
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::integrity::IntegrityRecord;
#[cfg(feature = "sqlite-store")]
use crate::integrity::FileHash;
use crate::types::{now_ms, ToolStatus};

/// Persisted tool metadata the orchestrator reads from and mirrors status into.
/// Updates against unknown ids are no-ops, matching an SQL `UPDATE`.
#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn list_enabled_tool_ids(&self) -> Result<Vec<String>>;
    async fn update_tool_runtime(
        &self,
        tool_id: &str,
        status: ToolStatus,
        port: u16,
        pid: u32,
    ) -> Result<()>;
    async fn update_tool_build_status(&self, tool_id: &str, status: ToolStatus) -> Result<()>;
    async fn record_tool_error(&self, tool_id: &str, message: &str) -> Result<()>;
    async fn record_integrity(&self, tool_id: &str, record: &IntegrityRecord) -> Result<()>;
    async fn library_slug(&self, tool_id: &str) -> Result<Option<String>>;
}

/// Resolves secret values by name for injection into tool processes.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn lookup_secret(&self, name: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_record_status")]
    pub status: ToolStatus,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub library_slug: Option<String>,
    #[serde(default)]
    pub integrity: Option<IntegrityRecord>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl ToolRecord {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: None,
            enabled: false,
            status: default_record_status(),
            port: 0,
            pid: 0,
            last_error: None,
            library_slug: None,
            integrity: None,
            updated_at_ms: now_ms(),
        }
    }
}

fn default_record_status() -> ToolStatus {
    ToolStatus::Stopped
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    tools: BTreeMap<String, ToolRecord>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

pub struct ToolStateStore {
    backend: ToolStateBackend,
}

enum ToolStateBackend {
    Json {
        path: PathBuf,
        document: Mutex<StoreDocument>,
    },
    #[cfg(feature = "sqlite-store")]
    Sqlite { path: PathBuf, lock: Mutex<()> },
}

impl ToolStateStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        if is_sqlite_path(&path) {
            #[cfg(feature = "sqlite-store")]
            {
                init_sqlite(path.clone()).await?;
                return Ok(Self {
                    backend: ToolStateBackend::Sqlite {
                        path,
                        lock: Mutex::new(()),
                    },
                });
            }

            #[cfg(not(feature = "sqlite-store"))]
            {
                anyhow::bail!(
                    "sqlite tool store requested for {} but binary was built without \
                     `sqlite-store` feature",
                    path.display()
                );
            }
        }

        let document = if path.exists() {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read tool store {}", path.display()))?;
            if text.trim().is_empty() {
                StoreDocument::default()
            } else {
                serde_json::from_str::<StoreDocument>(&text)
                    .with_context(|| format!("parse tool store {}", path.display()))?
            }
        } else {
            StoreDocument::default()
        };

        Ok(Self {
            backend: ToolStateBackend::Json {
                path,
                document: Mutex::new(document),
            },
        })
    }

    pub async fn tool(&self, tool_id: &str) -> Result<Option<ToolRecord>> {
        match &self.backend {
            ToolStateBackend::Json { document, .. } => {
                let guard = document.lock().await;
                Ok(guard.tools.get(tool_id).cloned())
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                let key = tool_id.to_owned();
                with_sqlite(path, lock, move |conn| sqlite_tool(conn, &key)).await
            }
        }
    }

    /// Creates the record when it does not exist yet.
    pub async fn set_enabled(&self, tool_id: &str, enabled: bool) -> Result<ToolRecord> {
        match &self.backend {
            ToolStateBackend::Json { path, document } => {
                let mut guard = document.lock().await;
                let record = guard
                    .tools
                    .entry(tool_id.to_owned())
                    .or_insert_with(|| ToolRecord::new(tool_id));
                record.enabled = enabled;
                record.updated_at_ms = now_ms();
                let record = record.clone();
                persist_json(path, &guard).await?;
                Ok(record)
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                let key = tool_id.to_owned();
                with_sqlite(path, lock, move |conn| {
                    conn.execute(
                        "INSERT INTO tools (id, enabled, status, updated_at_ms)
                         VALUES (?1, ?2, 'stopped', ?3)
                         ON CONFLICT(id) DO UPDATE SET
                            enabled=excluded.enabled,
                            updated_at_ms=excluded.updated_at_ms",
                        params![key, enabled as i64, now_ms() as i64],
                    )
                    .context("upsert tool enabled flag")?;
                    sqlite_tool(conn, &key)?
                        .ok_or_else(|| anyhow::anyhow!("tool {key} vanished after upsert"))
                })
                .await
            }
        }
    }
}

async fn update_json_record<F>(
    path: &Path,
    document: &Mutex<StoreDocument>,
    tool_id: &str,
    apply: F,
) -> Result<()>
where
    F: FnOnce(&mut ToolRecord),
{
    let mut guard = document.lock().await;
    let Some(record) = guard.tools.get_mut(tool_id) else {
        debug!("tool store has no record for {tool_id}; update skipped");
        return Ok(());
    };
    apply(record);
    record.updated_at_ms = now_ms();
    persist_json(path, &guard).await
}

#[async_trait]
impl ToolStore for ToolStateStore {
    async fn list_enabled_tool_ids(&self) -> Result<Vec<String>> {
        match &self.backend {
            ToolStateBackend::Json { document, .. } => {
                let guard = document.lock().await;
                Ok(guard
                    .tools
                    .values()
                    .filter(|record| record.enabled)
                    .map(|record| record.id.clone())
                    .collect())
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                with_sqlite(path, lock, |conn| {
                    let mut stmt = conn
                        .prepare("SELECT id FROM tools WHERE enabled = 1 ORDER BY id")
                        .context("prepare enabled tools query")?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, String>(0))
                        .context("query enabled tools")?;
                    let mut ids = Vec::new();
                    for row in rows {
                        ids.push(row.context("read enabled tool row")?);
                    }
                    Ok(ids)
                })
                .await
            }
        }
    }

    async fn update_tool_runtime(
        &self,
        tool_id: &str,
        status: ToolStatus,
        port: u16,
        pid: u32,
    ) -> Result<()> {
        match &self.backend {
            ToolStateBackend::Json { path, document } => {
                update_json_record(path, document, tool_id, |record| {
                    record.status = status;
                    record.port = port;
                    record.pid = pid;
                    if status == ToolStatus::Running {
                        record.last_error = None;
                    }
                })
                .await
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                let key = tool_id.to_owned();
                with_sqlite(path, lock, move |conn| {
                    conn.execute(
                        "UPDATE tools SET status = ?1, port = ?2, pid = ?3, updated_at_ms = ?4,
                            last_error = CASE WHEN ?1 = 'running' THEN NULL ELSE last_error END
                         WHERE id = ?5",
                        params![
                            status.as_str(),
                            i64::from(port),
                            i64::from(pid),
                            now_ms() as i64,
                            key
                        ],
                    )
                    .context("update tool runtime")?;
                    Ok(())
                })
                .await
            }
        }
    }

    async fn update_tool_build_status(&self, tool_id: &str, status: ToolStatus) -> Result<()> {
        match &self.backend {
            ToolStateBackend::Json { path, document } => {
                update_json_record(path, document, tool_id, |record| {
                    record.status = status;
                    if status == ToolStatus::Active {
                        record.last_error = None;
                    }
                })
                .await
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                let key = tool_id.to_owned();
                with_sqlite(path, lock, move |conn| {
                    conn.execute(
                        "UPDATE tools SET status = ?1, updated_at_ms = ?2,
                            last_error = CASE WHEN ?1 = 'active' THEN NULL ELSE last_error END
                         WHERE id = ?3",
                        params![status.as_str(), now_ms() as i64, key],
                    )
                    .context("update tool build status")?;
                    Ok(())
                })
                .await
            }
        }
    }

    async fn record_tool_error(&self, tool_id: &str, message: &str) -> Result<()> {
        match &self.backend {
            ToolStateBackend::Json { path, document } => {
                let message = message.to_owned();
                update_json_record(path, document, tool_id, move |record| {
                    record.status = ToolStatus::Error;
                    record.last_error = Some(message);
                })
                .await
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                let key = tool_id.to_owned();
                let message = message.to_owned();
                with_sqlite(path, lock, move |conn| {
                    conn.execute(
                        "UPDATE tools SET status = 'error', last_error = ?1, updated_at_ms = ?2
                         WHERE id = ?3",
                        params![message, now_ms() as i64, key],
                    )
                    .context("record tool error")?;
                    Ok(())
                })
                .await
            }
        }
    }

    async fn record_integrity(&self, tool_id: &str, integrity: &IntegrityRecord) -> Result<()> {
        match &self.backend {
            ToolStateBackend::Json { path, document } => {
                let integrity = integrity.clone();
                update_json_record(path, document, tool_id, move |record| {
                    record.integrity = Some(integrity);
                })
                .await
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                let key = tool_id.to_owned();
                let integrity = integrity.clone();
                with_sqlite(path, lock, move |conn| {
                    let tx = conn
                        .unchecked_transaction()
                        .context("begin integrity transaction")?;
                    let updated = tx
                        .execute(
                            "UPDATE tools SET source_hash = ?1, binary_hash = ?2, updated_at_ms = ?3
                             WHERE id = ?4",
                            params![
                                integrity.source_hash,
                                integrity.binary_hash,
                                now_ms() as i64,
                                key
                            ],
                        )
                        .context("update tool hashes")?;
                    if updated > 0 {
                        tx.execute("DELETE FROM tool_integrity WHERE tool_id = ?1", params![key])
                            .context("clear tool integrity rows")?;
                        for file in &integrity.files {
                            tx.execute(
                                "INSERT INTO tool_integrity (tool_id, filename, file_hash, file_size)
                                 VALUES (?1, ?2, ?3, ?4)",
                                params![key, file.filename, file.hash, file.size as i64],
                            )
                            .context("insert tool integrity row")?;
                        }
                    }
                    tx.commit().context("commit integrity transaction")?;
                    Ok(())
                })
                .await
            }
        }
    }

    async fn library_slug(&self, tool_id: &str) -> Result<Option<String>> {
        Ok(self
            .tool(tool_id)
            .await?
            .and_then(|record| record.library_slug)
            .map(|slug| slug.trim().to_owned())
            .filter(|slug| !slug.is_empty()))
    }
}

#[async_trait]
impl SecretSource for ToolStateStore {
    async fn lookup_secret(&self, name: &str) -> Result<Option<String>> {
        match &self.backend {
            ToolStateBackend::Json { document, .. } => {
                let guard = document.lock().await;
                Ok(guard.secrets.get(name).cloned())
            }
            #[cfg(feature = "sqlite-store")]
            ToolStateBackend::Sqlite { path, lock } => {
                let key = name.to_owned();
                with_sqlite(path, lock, move |conn| {
                    conn.query_row(
                        "SELECT value FROM secrets WHERE name = ?1",
                        params![key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()
                    .context("query secret")
                })
                .await
            }
        }
    }
}

async fn persist_json(path: &Path, document: &StoreDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let snapshot = serde_json::to_vec_pretty(document)?;
    tokio::fs::write(path, snapshot).await?;
    Ok(())
}

fn is_sqlite_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).map(|s| s.to_ascii_lowercase()),
        Some(ext) if ext == "db" || ext == "sqlite" || ext == "sqlite3"
    )
}

#[cfg(feature = "sqlite-store")]
const TOOL_STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tools (
    id TEXT PRIMARY KEY,
    name TEXT,
    enabled INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'stopped',
    port INTEGER NOT NULL DEFAULT 0,
    pid INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    library_slug TEXT,
    source_hash TEXT,
    binary_hash TEXT,
    updated_at_ms INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tool_integrity (
    tool_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    PRIMARY KEY (tool_id, filename)
);
CREATE TABLE IF NOT EXISTS secrets (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[cfg(feature = "sqlite-store")]
async fn init_sqlite(path: PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .with_context(|| "set WAL mode")?;
        conn.execute_batch(TOOL_STORE_SCHEMA)
            .with_context(|| "ensure tool store schema")?;
        Ok(())
    })
    .await
    .with_context(|| "sqlite init join error")??;
    Ok(())
}

#[cfg(feature = "sqlite-store")]
async fn with_sqlite<T, F>(path: &Path, lock: &Mutex<()>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    let _guard = lock.lock().await;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<T> {
        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        work(&conn)
    })
    .await
    .with_context(|| "sqlite join error")?
}

#[cfg(feature = "sqlite-store")]
fn sqlite_tool(conn: &Connection, tool_id: &str) -> Result<Option<ToolRecord>> {
    let row = conn
        .query_row(
            "SELECT id, name, enabled, status, port, pid, last_error, library_slug,
                    source_hash, binary_hash, updated_at_ms
             FROM tools WHERE id = ?1",
            params![tool_id],
            |row| {
                Ok((
                    ToolRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        enabled: row.get::<_, i64>(2)? != 0,
                        status: ToolStatus::parse(&row.get::<_, String>(3)?)
                            .unwrap_or(ToolStatus::Stopped),
                        port: row.get::<_, i64>(4)? as u16,
                        pid: row.get::<_, i64>(5)? as u32,
                        last_error: row.get(6)?,
                        library_slug: row.get(7)?,
                        integrity: None,
                        updated_at_ms: row.get::<_, i64>(10)? as u64,
                    },
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )
        .optional()
        .context("query tool record")?;
    let Some((mut record, source_hash, binary_hash)) = row else {
        return Ok(None);
    };
    if let Some(source_hash) = source_hash {
        let mut stmt = conn
            .prepare(
                "SELECT filename, file_hash, file_size FROM tool_integrity
                 WHERE tool_id = ?1 ORDER BY filename",
            )
            .context("prepare integrity query")?;
        let rows = stmt
            .query_map(params![tool_id], |row| {
                Ok(FileHash {
                    filename: row.get(0)?,
                    hash: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                })
            })
            .context("query integrity rows")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("read integrity row")?);
        }
        record.integrity = Some(IntegrityRecord {
            source_hash,
            binary_hash,
            files,
        });
    }
    Ok(Some(record))
}
