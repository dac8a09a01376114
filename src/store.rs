use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::swap::SwapKey;
use crate::vault::VaultKey;

/// Durable store for swap records and vaults. Bodies are JSON; identity and
/// state live in their own columns so they can be queried without decoding.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct StoredSwap {
    pub namespace: String,
    pub key: SwapKey,
    pub chain_id: String,
    pub state: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct StoredVault {
    pub key: VaultKey,
    pub status: String,
    pub body: serde_json::Value,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        migrate(&conn).context("migrate sqlite schema")?;
        Ok(Self { conn })
    }

    pub fn save_swap<T: Serialize>(
        &mut self,
        namespace: &str,
        key: &SwapKey,
        chain_id: &str,
        state: &str,
        record: &T,
    ) -> Result<()> {
        let body = serde_json::to_string(record).context("encode swap record")?;
        self.conn
            .execute(
                r#"
INSERT INTO swaps (namespace, identifier_hash, sequence, chain_id, state, body, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT (namespace, identifier_hash, sequence) DO UPDATE SET
  chain_id = excluded.chain_id,
  state = excluded.state,
  body = excluded.body,
  updated_at = excluded.updated_at
"#,
                params![
                    namespace,
                    &key.identifier_hash,
                    to_sql_int(key.sequence)?,
                    chain_id,
                    state,
                    body,
                    to_sql_int(crate::unix_now())?,
                ],
            )
            .with_context(|| format!("save swap {namespace}/{key}"))?;
        Ok(())
    }

    pub fn get_swap<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &SwapKey,
    ) -> Result<Option<T>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM swaps \
                 WHERE namespace = ?1 AND identifier_hash = ?2 AND sequence = ?3",
                params![namespace, &key.identifier_hash, to_sql_int(key.sequence)?],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get swap {namespace}/{key}"))?;

        body.map(|b| {
            serde_json::from_str(&b).with_context(|| format!("decode swap {namespace}/{key}"))
        })
        .transpose()
    }

    pub fn remove_swap(&mut self, namespace: &str, key: &SwapKey) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM swaps WHERE namespace = ?1 AND identifier_hash = ?2 AND sequence = ?3",
                params![namespace, &key.identifier_hash, to_sql_int(key.sequence)?],
            )
            .with_context(|| format!("remove swap {namespace}/{key}"))?;
        Ok(rows == 1)
    }

    pub fn list_swaps<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>> {
        self.query_swaps(namespace, |_: &T| true)
    }

    pub fn query_swaps<T: DeserializeOwned>(
        &self,
        namespace: &str,
        predicate: impl Fn(&T) -> bool,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for row in self.swap_rows(Some(namespace))? {
            let record: T = serde_json::from_value(row.body)
                .with_context(|| format!("decode swap {namespace}/{}", row.key))?;
            if predicate(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn swap_rows(&self, namespace: Option<&str>) -> Result<Vec<StoredSwap>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
SELECT namespace, identifier_hash, sequence, chain_id, state, body
FROM swaps
WHERE ?1 IS NULL OR namespace = ?1
ORDER BY namespace, identifier_hash, sequence
"#,
            )
            .context("prepare list swaps")?;

        let rows = stmt
            .query_map(params![namespace], |row| {
                Ok(StoredSwap {
                    namespace: row.get(0)?,
                    key: SwapKey {
                        identifier_hash: row.get(1)?,
                        sequence: from_sql_int(row, 2)?,
                    },
                    chain_id: row.get(3)?,
                    state: row.get(4)?,
                    body: json_column(row, 5)?,
                })
            })
            .context("query list swaps")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read swap row")?);
        }
        Ok(out)
    }

    pub fn save_vault<T: Serialize>(
        &mut self,
        key: &VaultKey,
        status: &str,
        vault: &T,
    ) -> Result<()> {
        let body = serde_json::to_string(vault).context("encode vault")?;
        self.conn
            .execute(
                r#"
INSERT INTO vaults (chain_id, owner, vault_id, status, body, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT (chain_id, owner, vault_id) DO UPDATE SET
  status = excluded.status,
  body = excluded.body,
  updated_at = excluded.updated_at
"#,
                params![
                    &key.chain_id,
                    &key.owner,
                    to_sql_int(key.vault_id)?,
                    status,
                    body,
                    to_sql_int(crate::unix_now())?,
                ],
            )
            .with_context(|| format!("save vault {key}"))?;
        Ok(())
    }

    pub fn list_vaults<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.vault_rows()?
            .into_iter()
            .map(|row| {
                let key = row.key;
                serde_json::from_value(row.body).with_context(|| format!("decode vault {key}"))
            })
            .collect()
    }

    pub fn vault_rows(&self) -> Result<Vec<StoredVault>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
SELECT chain_id, owner, vault_id, status, body
FROM vaults
ORDER BY chain_id, owner, vault_id
"#,
            )
            .context("prepare list vaults")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(StoredVault {
                    key: VaultKey {
                        chain_id: row.get(0)?,
                        owner: row.get(1)?,
                        vault_id: from_sql_int(row, 2)?,
                    },
                    status: row.get(3)?,
                    body: json_column(row, 4)?,
                })
            })
            .context("query list vaults")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read vault row")?);
        }
        Ok(out)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  namespace TEXT NOT NULL,
  identifier_hash TEXT NOT NULL,
  sequence INTEGER NOT NULL,
  chain_id TEXT NOT NULL,
  state TEXT NOT NULL,
  body TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (namespace, identifier_hash, sequence)
);
CREATE INDEX IF NOT EXISTS swaps_state_idx ON swaps(namespace, state);
CREATE TABLE IF NOT EXISTS vaults (
  chain_id TEXT NOT NULL,
  owner TEXT NOT NULL,
  vault_id INTEGER NOT NULL,
  status TEXT NOT NULL,
  body TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (chain_id, owner, vault_id)
);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn to_sql_int(v: u64) -> Result<i64> {
    i64::try_from(v).with_context(|| format!("value {v} does not fit sqlite integer"))
}

fn from_sql_int(row: &Row<'_>, col: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(col)?;
    u64::try_from(v).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("invalid unsigned value {v}").into(),
        )
    })
}

fn json_column(row: &Row<'_>, col: usize) -> rusqlite::Result<serde_json::Value> {
    let body: String = row.get(col)?;
    serde_json::from_str(&body).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}
