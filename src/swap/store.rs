use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, params};
use uuid::Uuid;

use super::Swap;
use crate::chain::Chain;

const KEY_INDEX_KEY: &str = "key_index";

/// Durable storage of swap records. Records are never deleted.
pub trait SwapRepository: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> Result<Option<Swap>>;

    /// Every swap whose status is not `DONE`, oldest first.
    fn find_unfinished(&self) -> Result<Vec<Swap>>;

    /// Inserts or replaces the record.
    fn save(&self, swap: &Swap) -> Result<()>;
}

/// Small key/value state next to the swap records.
pub trait CursorStore: Send + Sync {
    fn cursor(&self, chain: Chain) -> Result<Option<u64>>;

    /// Commits `cursor` as the last fully handled event. Callers commit only
    /// after every subscriber handled the event, so a crash in between
    /// redelivers it instead of losing it.
    fn set_cursor(&self, chain: Chain, cursor: u64) -> Result<()>;

    /// Reserves the next operator key index.
    fn next_key_index(&self) -> Result<u32>;
}

fn cursor_key(chain: Chain) -> String {
    format!("cursor.{chain}")
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_kv(conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("read kv {key}"))
    }

    fn write_kv(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("write kv {key}"))?;
        Ok(())
    }
}

fn decode_body(body: &str) -> Result<Swap> {
    serde_json::from_str(body).context("decode swap body")
}

impl SwapRepository for SqliteStore {
    fn find_by_id(&self, id: Uuid) -> Result<Option<Swap>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM swaps WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get swap {id}"))?;
        body.as_deref().map(decode_body).transpose()
    }

    fn find_unfinished(&self) -> Result<Vec<Swap>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT body FROM swaps WHERE status != 'DONE' ORDER BY created_at, id")
            .context("prepare list unfinished swaps")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query unfinished swaps")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode_body(&row.context("read swap row")?)?);
        }
        Ok(out)
    }

    fn save(&self, swap: &Swap) -> Result<()> {
        let common = swap.common();
        let body = serde_json::to_string(swap).context("encode swap body")?;

        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            r#"
INSERT INTO swaps (id, kind, chain, status, outcome, created_at, updated_at, body)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(id) DO UPDATE SET
  status = excluded.status,
  outcome = excluded.outcome,
  updated_at = excluded.updated_at,
  body = excluded.body
"#,
            params![
                common.id.to_string(),
                swap.kind(),
                common.chain.as_str(),
                swap.status_str(),
                common.outcome.map(|o| o.as_str()),
                common.created_at.to_rfc3339(),
                common.updated_at.to_rfc3339(),
                body,
            ],
        )
        .with_context(|| format!("save swap {}", common.id))?;
        Ok(())
    }
}

impl CursorStore for SqliteStore {
    fn cursor(&self, chain: Chain) -> Result<Option<u64>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Self::read_kv(&conn, &cursor_key(chain))?
            .map(|v| v.parse::<u64>().with_context(|| format!("invalid cursor {v}")))
            .transpose()
    }

    fn set_cursor(&self, chain: Chain, cursor: u64) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Self::write_kv(&conn, &cursor_key(chain), &cursor.to_string())
    }

    fn next_key_index(&self) -> Result<u32> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().context("begin key index tx")?;
        let current = Self::read_kv(&tx, KEY_INDEX_KEY)?
            .map(|v| v.parse::<u32>().with_context(|| format!("invalid key index {v}")))
            .transpose()?
            .unwrap_or(0);
        Self::write_kv(&tx, KEY_INDEX_KEY, &(current + 1).to_string())?;
        tx.commit().context("commit key index tx")?;
        Ok(current)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  chain TEXT NOT NULL,
  status TEXT NOT NULL,
  outcome TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_status_idx ON swaps(status);
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
    )
    .context("create tables")?;
    Ok(())
}
