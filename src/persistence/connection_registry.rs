//! Registry of active connections, persisted under one list-valued key.
//!
//! The supervisor is the only writer. Readers get owned copies.

use crate::models::connection::Connection;
use crate::Result;

use super::kv_store::KvStore;

/// Key holding the ordered list of active connections.
pub const ACTIVE_CONNECTIONS_KEY: &str = "active_connections";

/// Ordered, restart-durable list of active [`Connection`] records.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: KvStore,
}

impl ConnectionRegistry {
    /// Create a registry over `store`.
    #[must_use]
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// All records, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn get_all(&self) -> Result<Vec<Connection>> {
        Ok(self
            .store
            .get::<Vec<Connection>>(ACTIVE_CONNECTIONS_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Append without any duplicate check.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn append(&self, connection: &Connection) -> Result<()> {
        self.store
            .append(ACTIVE_CONNECTIONS_KEY, connection.clone())
            .await
    }

    /// Append unless a record with the same connection id or pid exists.
    ///
    /// Check and append happen in one locked cycle. Returns whether the
    /// record was inserted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the read or write fails.
    pub async fn insert_unique(&self, connection: &Connection) -> Result<bool> {
        let candidate = connection.clone();
        self.store
            .update::<Vec<Connection>, _, _>(ACTIVE_CONNECTIONS_KEY, move |items| {
                let duplicate = items.iter().any(|existing| {
                    existing.connection_id == candidate.connection_id
                        || existing.pid == candidate.pid
                });
                if !duplicate {
                    items.push(candidate);
                }
                !duplicate
            })
            .await
    }

    /// Remove `connection` by value. Absent values are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the read or write fails.
    pub async fn remove(&self, connection: &Connection) -> Result<bool> {
        self.store.remove(ACTIVE_CONNECTIONS_KEY, connection).await
    }

    /// Replace the whole list.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn replace_all(&self, connections: &[Connection]) -> Result<()> {
        self.store.set(ACTIVE_CONNECTIONS_KEY, &connections).await
    }

    /// Look up a record by connection id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn find(&self, connection_id: &str) -> Result<Option<Connection>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .find(|c| c.connection_id == connection_id))
    }

    /// Remove the record with `connection_id`, returning it if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the read or write fails.
    pub async fn remove_by_id(&self, connection_id: &str) -> Result<Option<Connection>> {
        let id = connection_id.to_owned();
        self.store
            .update::<Vec<Connection>, _, _>(ACTIVE_CONNECTIONS_KEY, move |items| {
                items
                    .iter()
                    .position(|c| c.connection_id == id)
                    .map(|index| items.remove(index))
            })
            .await
    }
}
