//! Durable key/value defaults backed by redb.
//!
//! Every persisted gating field lives in a single `DEFAULTS` table keyed by
//! the names in [`keys`]. Values are JSON-encoded, except the attribution
//! payload which is stored as the raw bytes the attribution SDK produced.
//!
//! Multi-field updates go through [`WriteBatch`], which commits in a single
//! write transaction so readers never observe a partial update.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{GateError, Result};

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: persisted field name. Value: JSON bytes.
const DEFAULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("defaults");

/// Persisted field names.
pub mod keys {
    pub const CONVERSION_DATA: &str = "conversion_data";
    pub const ORGANIC_CONVERSION: &str = "is_organic_conversion";
    pub const CONFIG_URL: &str = "config_url";
    pub const CONFIG_EXPIRES: &str = "config_expires";
    pub const CONFIG_FETCHED_AT: &str = "config_fetched_at";
    pub const NO_MORE_REQUESTS: &str = "config_no_more_requests";
    pub const LAST_DENIED: &str = "last_notification_denied_at";
    pub const SESSION_COOKIES: &str = "session_cookies";
}

fn store_err(e: impl std::fmt::Display) -> GateError {
    GateError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// WriteBatch
// ---------------------------------------------------------------------------

/// A set of puts and removes applied atomically by [`DefaultsStore::commit`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(String, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize + ?Sized>(mut self, key: &str, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        self.ops.push((key.to_string(), Some(bytes)));
        Ok(self)
    }

    pub fn set_raw(mut self, key: &str, bytes: &[u8]) -> Self {
        self.ops.push((key.to_string(), Some(bytes.to_vec())));
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.ops.push((key.to_string(), None));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DefaultsStore
// ---------------------------------------------------------------------------

/// Persistent defaults shared by every gating component.
///
/// Cheap to clone; all clones share the same open database. redb holds an
/// exclusive file lock, so a process opens the file once and hands clones out.
#[derive(Clone)]
pub struct DefaultsStore {
    db: Arc<Database>,
}

impl DefaultsStore {
    /// Open or create the redb database at `path`.
    ///
    /// Creates the parent directory and the `DEFAULTS` table if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(DEFAULTS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Return the raw bytes stored under `key`.
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(DEFAULTS).map_err(store_err)?;
        let value = table.get(key).map_err(store_err)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    /// Decode the JSON value stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get_raw(key)?.is_some())
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.commit(WriteBatch::new().set(key, value)?)
    }

    pub fn set_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.commit(WriteBatch::new().set_raw(key, bytes))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.commit(WriteBatch::new().remove(key))
    }

    /// Apply every operation in `batch` inside one write transaction.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(DEFAULTS).map_err(store_err)?;
            for (key, value) in &batch.ops {
                match value {
                    Some(bytes) => {
                        table
                            .insert(key.as_str(), bytes.as_slice())
                            .map_err(store_err)?;
                    }
                    None => {
                        table.remove(key.as_str()).map_err(store_err)?;
                    }
                }
            }
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }
}
