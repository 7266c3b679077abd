//! Embedded SQL store.
//!
//! Opens the SQLite database with two pools: a read pool of a few connections
//! for plain `SELECT`s and a write pool of exactly one connection that every
//! write and every transaction goes through, so writers serialize at the pool
//! instead of colliding on `SQLITE_BUSY`. The sqlite-vec extension is
//! registered process-wide before the first connection opens, and its version
//! probe is called at startup so a broken build fails fast instead of at the
//! first vector insert.

use anyhow::{anyhow, Context};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::migrate;

const READ_POOL_SIZE: u32 = 4;

/// Handle to the opened store. Cheap to clone; pools are reference counted.
#[derive(Clone)]
pub struct Store {
    read: SqlitePool,
    write: SqlitePool,
    vector_dims: usize,
}

/// Register sqlite-vec as an auto extension for every connection the process
/// opens. Idempotent; safe to call from concurrent openers.
fn register_vec_extension() {
    static REGISTERED: OnceLock<()> = OnceLock::new();
    REGISTERED.get_or_init(|| unsafe {
        libsqlite3_sys::sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut libsqlite3_sys::sqlite3,
                *mut *mut std::os::raw::c_char,
                *const libsqlite3_sys::sqlite3_api_routines,
            ) -> std::os::raw::c_int,
        >(sqlite_vec::sqlite3_vec_init as *const ())));
    });
}

impl Store {
    /// Open (creating if needed) the database at `db_path`, run migrations,
    /// and verify the vector extension and dimension.
    ///
    /// Failure here is fatal to startup.
    pub async fn open(db_path: &Path, vector_dims: usize) -> Result<Store> {
        Self::open_inner(db_path, vector_dims)
            .await
            .map_err(Error::StoreInit)
    }

    async fn open_inner(db_path: &Path, vector_dims: usize) -> anyhow::Result<Store> {
        register_vec_extension();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5000))
            .foreign_keys(true);

        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .context("opening write pool")?;

        let read = SqlitePoolOptions::new()
            .max_connections(READ_POOL_SIZE)
            .connect_with(options)
            .await
            .context("opening read pool")?;

        let store = Store {
            read,
            write,
            vector_dims,
        };

        store.warm_up().await?;
        store.verify_vec_extension().await?;
        migrate::run_migrations(&store).await?;
        store.verify_vector_dims().await?;

        Ok(store)
    }

    /// Pre-open every pooled connection and apply the pragmas so the first
    /// concurrent caller never sees an un-pragma'd connection.
    async fn warm_up(&self) -> anyhow::Result<()> {
        let mut held = Vec::new();
        for _ in 0..READ_POOL_SIZE {
            match self.read.acquire().await {
                Ok(mut conn) => {
                    sqlx::query("PRAGMA busy_timeout = 5000")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(&mut *conn)
                        .await?;
                    held.push(conn);
                }
                Err(_) => break,
            }
        }
        drop(held);

        let mut conn = self.write.acquire().await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&mut *conn)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn verify_vec_extension(&self) -> anyhow::Result<()> {
        let row = sqlx::query("SELECT vec_version() AS v")
            .fetch_one(&self.read)
            .await
            .context("sqlite-vec extension not loaded")?;
        let version: String = row.get("v");
        tracing::info!(%version, "sqlite-vec loaded");
        Ok(())
    }

    /// The vector table dimension is baked at migration time; a config that
    /// disagrees would corrupt every subsequent insert.
    async fn verify_vector_dims(&self) -> anyhow::Result<()> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = 'vector_dims'")
                .fetch_optional(&self.read)
                .await?;
        match stored.and_then(|s| s.parse::<usize>().ok()) {
            Some(stored) if stored != self.vector_dims => Err(anyhow!(Error::DimensionMismatch {
                store: stored,
                config: self.vector_dims,
            })),
            Some(_) => Ok(()),
            None => Err(anyhow!("store_meta missing vector_dims")),
        }
    }

    /// Pool for plain `SELECT`s.
    pub fn read(&self) -> &SqlitePool {
        &self.read
    }

    /// Single-connection pool every write and transaction goes through.
    pub fn write(&self) -> &SqlitePool {
        &self.write
    }

    /// Begin a write transaction.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>> {
        Ok(self.write.begin().await?)
    }

    pub fn vector_dims(&self) -> usize {
        self.vector_dims
    }

    pub async fn close(&self) {
        self.read.close().await;
        self.write.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema_and_probes_vec() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.sqlite"), 4).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'trigger') ORDER BY name",
        )
        .fetch_all(store.read())
        .await
        .unwrap();
        for required in [
            "documents",
            "document_nodes",
            "doc_vec",
            "doc_fts",
            "doc_name_fts",
            "goqite",
            "libraries",
        ] {
            assert!(tables.iter().any(|t| t == required), "missing {}", required);
        }
        store.close().await;
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        let store = Store::open(&path, 4).await.unwrap();
        store.close().await;
        let store = Store::open(&path, 4).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        let store = Store::open(&path, 4).await.unwrap();
        store.close().await;
        assert!(Store::open(&path, 8).await.is_err());
    }
}
