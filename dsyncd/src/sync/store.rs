use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio::sync::Mutex;

use super::entry::RemoteEntry;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const CURSOR_KEY: &str = "cursor";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("tombstone for {0} cannot be stored")]
    Tombstone(String),
}

/// Durable shadow of a remote entry. `rev` is `None` for folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: String,
    pub path_display: String,
    pub path_lower: String,
    pub materialized: bool,
    pub rev: Option<String>,
    pub size: Option<i64>,
    pub server_modified: Option<i64>,
    pub client_modified: Option<i64>,
    pub content_hash: Option<String>,
}

impl StoredEntry {
    pub fn from_remote(entry: &RemoteEntry, materialized: bool) -> Result<Self, StoreError> {
        match entry {
            RemoteEntry::File(file) => Ok(Self {
                id: file.id.clone(),
                path_display: file.path_display.clone(),
                path_lower: file.path_lower.clone(),
                materialized,
                rev: Some(file.rev.clone()),
                size: Some(file.size as i64),
                server_modified: Some(file.server_modified),
                client_modified: Some(file.client_modified),
                content_hash: file.content_hash.clone(),
            }),
            RemoteEntry::Folder(folder) => Ok(Self {
                id: folder.id.clone(),
                path_display: folder.path_display.clone(),
                path_lower: folder.path_lower.clone(),
                materialized,
                rev: None,
                size: None,
                server_modified: None,
                client_modified: None,
                content_hash: None,
            }),
            RemoteEntry::Deleted(deleted) => Err(StoreError::Tombstone(deleted.path_lower.clone())),
        }
    }

    pub fn to_remote(&self) -> RemoteEntry {
        use super::entry::{RemoteFile, RemoteFolder};

        match &self.rev {
            Some(rev) => RemoteEntry::File(RemoteFile {
                id: self.id.clone(),
                path_display: self.path_display.clone(),
                path_lower: self.path_lower.clone(),
                rev: rev.clone(),
                size: self.size.unwrap_or_default().max(0) as u64,
                server_modified: self.server_modified.unwrap_or_default(),
                client_modified: self.client_modified.unwrap_or_default(),
                content_hash: self.content_hash.clone(),
            }),
            None => RemoteEntry::Folder(RemoteFolder {
                id: self.id.clone(),
                path_display: self.path_display.clone(),
                path_lower: self.path_lower.clone(),
            }),
        }
    }
}

/// SQLite-backed config and entry tables. Reads go straight to the pool;
/// every write, including read-modify-write sequences, holds `write_lock`.
pub struct MetadataStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn read_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn write_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cursor(&self) -> Result<Option<String>, StoreError> {
        self.read_config(CURSOR_KEY).await
    }

    pub async fn set_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        self.write_config(CURSOR_KEY, cursor).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<StoredEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM entries WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| entry_from_row(&row)).transpose()
    }

    pub async fn find_by_path_lower(
        &self,
        path_lower: &str,
    ) -> Result<Option<StoredEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM entries WHERE path_lower = ?1 ORDER BY rowid DESC LIMIT 1"
        ))
        .bind(path_lower)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| entry_from_row(&row)).transpose()
    }

    /// Inserts or updates by id. Any other record left at the same lower path
    /// (a replaced object with a new id) is dropped.
    pub async fn write_entry(&self, entry: &StoredEntry) -> Result<StoredEntry, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        upsert(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(entry.clone())
    }

    /// Records an entry observed on the remote feed. New records start
    /// unmaterialized; an existing record keeps its materialized flag only
    /// while the revision is unchanged.
    pub async fn merge_remote(&self, entry: &RemoteEntry) -> Result<StoredEntry, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let merged = merge_in(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(merged)
    }

    /// Transactional form of [`merge_remote`](Self::merge_remote) for the
    /// initial listing. Tombstones in the batch remove their paths.
    pub async fn write_batch(&self, entries: &[RemoteEntry]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for entry in entries {
            if let RemoteEntry::Deleted(deleted) = entry {
                delete_subtree(&mut tx, &deleted.path_lower).await?;
                continue;
            }
            merge_in(&mut tx, entry).await?;
            written += 1;
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn set_materialized(&self, id: &str, materialized: bool) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE entries SET materialized = ?1 WHERE id = ?2")
            .bind(materialized)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_path(
        &self,
        id: &str,
        path_display: &str,
        path_lower: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE entries SET path_display = ?1, path_lower = ?2 WHERE id = ?3")
            .bind(path_display)
            .bind(path_lower)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the record at `path_lower` and every record beneath it.
    /// Removing a path that has no record is not an error.
    pub async fn delete_by_path_lower(&self, path_lower: &str) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let removed = delete_subtree(&mut tx, path_lower).await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM entries WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_unmaterialized(&self) -> Result<Vec<StoredEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM entries WHERE materialized = 0 ORDER BY path_lower ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}

const COLUMNS: &str = "id, path_display, path_lower, materialized, rev, size, server_modified, client_modified, content_hash";

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

async fn upsert(tx: &mut Tx<'_>, entry: &StoredEntry) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM entries WHERE path_lower = ?1 AND id <> ?2")
        .bind(&entry.path_lower)
        .bind(&entry.id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "INSERT INTO entries (
            id, path_display, path_lower, materialized, rev, size,
            server_modified, client_modified, content_hash
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            path_display = excluded.path_display,
            path_lower = excluded.path_lower,
            materialized = excluded.materialized,
            rev = excluded.rev,
            size = excluded.size,
            server_modified = excluded.server_modified,
            client_modified = excluded.client_modified,
            content_hash = excluded.content_hash",
    )
    .bind(&entry.id)
    .bind(&entry.path_display)
    .bind(&entry.path_lower)
    .bind(entry.materialized)
    .bind(&entry.rev)
    .bind(entry.size)
    .bind(entry.server_modified)
    .bind(entry.client_modified)
    .bind(&entry.content_hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn merge_in(tx: &mut Tx<'_>, entry: &RemoteEntry) -> Result<StoredEntry, StoreError> {
    let mut incoming = StoredEntry::from_remote(entry, false)?;
    let existing = sqlx::query(&format!("SELECT {COLUMNS} FROM entries WHERE id = ?1"))
        .bind(&incoming.id)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(row) = existing {
        let existing = entry_from_row(&row)?;
        incoming.materialized = existing.materialized && existing.rev == incoming.rev;
    }
    upsert(tx, &incoming).await?;
    Ok(incoming)
}

async fn delete_subtree(tx: &mut Tx<'_>, path_lower: &str) -> Result<u64, StoreError> {
    let pattern = format!("{}/%", escape_like(path_lower.trim_end_matches('/')));
    let result =
        sqlx::query("DELETE FROM entries WHERE path_lower = ?1 OR path_lower LIKE ?2 ESCAPE '\\'")
            .bind(path_lower)
            .bind(pattern)
            .execute(&mut **tx)
            .await?;
    Ok(result.rows_affected())
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn entry_from_row(row: &SqliteRow) -> Result<StoredEntry, StoreError> {
    Ok(StoredEntry {
        id: row.try_get("id")?,
        path_display: row.try_get("path_display")?,
        path_lower: row.try_get("path_lower")?,
        materialized: row.try_get("materialized")?,
        rev: row.try_get("rev")?,
        size: row.try_get("size")?,
        server_modified: row.try_get("server_modified")?,
        client_modified: row.try_get("client_modified")?,
        content_hash: row.try_get("content_hash")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("dsync").join("dsync.db"))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
