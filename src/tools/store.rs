//! 工具元数据缓存的持久化后端
//!
//! 每个工具服务端一条记录 `{server_id, fetched_at, ttl_seconds, tools}`：
//! - JsonDirStore：目录下每个服务端一个 `<安全化 id>-<id 摘要>.json`
//! - SqliteStore：`tool_cache` 表，以 server_id 为主键
//!
//! 重启后加载的记录保留原 fetched_at，仍受 ttl 约束。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tools::descriptor::ToolDescriptor;

/// 单个服务端的缓存快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub server_id: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub tools: Vec<ToolDescriptor>,
}

/// 缓存持久化后端（同步 I/O，调用方负责放到 spawn_blocking 中）
pub trait CacheStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<CacheRecord>>;

    /// 写入给定记录；已有同 server_id 的记录被覆盖
    fn save(&self, records: &[CacheRecord]) -> Result<()>;
}

/// 目录存储：一个服务端一个 JSON 文件
#[derive(Debug)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, server_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", sanitize_key(server_id), id_digest(server_id)))
    }
}

/// 原始 id 的 SHA-256 前 4 字节（十六进制），区分安全化后同名的 id
fn id_digest(server_id: &str) -> String {
    Sha256::digest(server_id.as_bytes())[..4]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// 服务端 id 转为安全文件名（非字母数字、`-`、`_`、`.` 一律替换为 `_`）
fn sanitize_key(server_id: &str) -> String {
    let key: String = server_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() || key.starts_with('.') {
        format!("_{key}")
    } else {
        key
    }
}

impl CacheStore for JsonDirStore {
    fn load_all(&self) -> Result<Vec<CacheRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("read cache dir {:?}", self.dir))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<CacheRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = ?path, "skipping corrupt cache record: {}", e),
            }
        }
        records.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(records)
    }

    fn save(&self, records: &[CacheRecord]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create cache dir {:?}", self.dir))?;
        for record in records {
            let path = self.path_for(&record.server_id);
            // 先写临时文件再 rename，避免进程中途退出留下半截 JSON
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
            std::fs::rename(&tmp, &path)?;
        }
        Ok(())
    }
}

/// SQLite 存储：tool_cache(server_id PRIMARY KEY, fetched_at, ttl_seconds, tools_json)
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {:?}", parent))?;
            }
        }
        let conn = Connection::open(path).with_context(|| format!("open database {:?}", path))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tool_cache (
                server_id TEXT PRIMARY KEY,
                fetched_at TEXT NOT NULL,
                ttl_seconds INTEGER NOT NULL,
                tools_json TEXT NOT NULL
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("tool_cache connection poisoned"))
    }
}

impl CacheStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<CacheRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT server_id, fetched_at, ttl_seconds, tools_json FROM tool_cache ORDER BY server_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, DateTime<Utc>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (server_id, fetched_at, ttl_seconds, tools_json) = row?;
            let tools: Vec<ToolDescriptor> = serde_json::from_str(&tools_json)
                .with_context(|| format!("decode tools for {server_id}"))?;
            records.push(CacheRecord {
                server_id,
                fetched_at,
                ttl_seconds: ttl_seconds.max(0) as u64,
                tools,
            });
        }
        Ok(records)
    }

    fn save(&self, records: &[CacheRecord]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT OR REPLACE INTO tool_cache (server_id, fetched_at, ttl_seconds, tools_json) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.server_id,
                    record.fetched_at,
                    record.ttl_seconds as i64,
                    serde_json::to_string(&record.tools)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(server: &str) -> CacheRecord {
        CacheRecord {
            server_id: server.to_string(),
            fetched_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            ttl_seconds: 300,
            tools: vec![ToolDescriptor::new(server, "read_file")
                .with_description("read a file")
                .with_capabilities(["fs", "read"])
                .with_schema(json!({"type": "object", "required": ["path"]}))],
        }
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("fs"), "fs");
        assert_eq!(sanitize_key("../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_key("a b:c"), "a_b_c");
        assert_eq!(sanitize_key(""), "_");
    }

    #[test]
    fn test_colliding_ids_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        assert_eq!(sanitize_key("a/b"), sanitize_key("a_b"));
        assert_ne!(store.path_for("a/b"), store.path_for("a_b"));

        store.save(&[record("a/b"), record("a_b")]).unwrap();
        let ids: Vec<String> = store.load_all().unwrap().into_iter().map(|r| r.server_id).collect();
        assert_eq!(ids, vec!["a/b".to_string(), "a_b".to_string()]);
    }

    #[test]
    fn test_json_dir_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path().join("cache"));
        assert!(store.load_all().unwrap().is_empty());

        let records = vec![record("web"), record("fs")];
        store.save(&records).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![record("fs"), record("web")]);
    }

    #[test]
    fn test_json_dir_store_skips_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        store.save(&[record("fs")]).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_store_overwrites_by_server() {
        let store = SqliteStore::in_memory().unwrap();
        store.save(&[record("fs")]).unwrap();

        let mut updated = record("fs");
        updated.ttl_seconds = 60;
        store.save(&[updated.clone()]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![updated]);
    }

    #[test]
    fn test_sqlite_store_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        SqliteStore::open(&path).unwrap().save(&[record("fs")]).unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load_all().unwrap(), vec![record("fs")]);
    }
}
