//! Persisted key-value store over the `kv_store` table.
//!
//! Values are JSON documents. Every write (`set`, `append`, `remove`,
//! `update`, `delete`) runs in a `BEGIN IMMEDIATE` transaction, so
//! read-modify-write cycles from separate processes sharing one database
//! file cannot interleave. A store-wide lock additionally orders writers
//! within this process; clones share it.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Sqlite, SqliteExecutor, Transaction};
use tokio::sync::Mutex;

use crate::Result;

use super::db::Database;

/// JSON key-value store with serialised writes.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<Database>,
    write_lock: Arc<Mutex<()>>,
}

async fn read_raw<'e>(executor: impl SqliteExecutor<'e>, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?1")
        .bind(key)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|(value,)| value))
}

async fn write_raw<'e>(executor: impl SqliteExecutor<'e>, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

impl KvStore {
    /// Create a new store instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open a write transaction holding the database write lock.
    ///
    /// Dropping the transaction without committing rolls it back.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.db.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Fetch and decode the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the value does not
    /// decode as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match read_raw(self.db.as_ref(), key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Replace the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if encoding or the write fails.
    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin_write().await?;
        write_raw(&mut *tx, key, &raw).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Run `mutate` on the decoded value (default when absent) and store the
    /// result, all in one write transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if reading, decoding, encoding or writing fails.
    pub async fn update<T, R, F>(&self, key: &str, mutate: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default + Send,
        R: Send,
        F: FnOnce(&mut T) -> R + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin_write().await?;
        let mut value: T = match read_raw(&mut *tx, key).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => T::default(),
        };
        let out = mutate(&mut value);
        let raw = serde_json::to_string(&value)?;
        write_raw(&mut *tx, key, &raw).await?;
        tx.commit().await?;
        Ok(out)
    }

    /// Append `item` to the list stored under `key`. Does not deduplicate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on read, decode or write failure.
    pub async fn append<T>(&self, key: &str, item: T) -> Result<()>
    where
        T: DeserializeOwned + Serialize + Send,
    {
        self.update::<Vec<T>, _, _>(key, move |items| items.push(item))
            .await
    }

    /// Remove the first element equal to `item` from the list under `key`.
    ///
    /// Absent items are a no-op. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on read, decode or write failure.
    pub async fn remove<T>(&self, key: &str, item: &T) -> Result<bool>
    where
        T: DeserializeOwned + Serialize + PartialEq + Send + Sync,
    {
        self.update::<Vec<T>, _, _>(key, |items| {
            items
                .iter()
                .position(|candidate| candidate == item)
                .map(|index| items.remove(index))
                .is_some()
        })
        .await
    }

    /// Delete `key` entirely.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.begin_write().await?;
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
