//! Data source records and their credential storage
//!
//! A data source carries only sealed credentials; the plaintext password
//! exists solely inside [`crate::vault::CredentialVault::open`]'s return value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::store::StoreError;

/// Sealed password plus the metadata needed to open it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredential {
    /// Opaque sealed-box bytes (`enc_password`)
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Algorithm tag (`enc_algo`)
    pub algorithm: String,
    /// Version of the keypair that produced the ciphertext
    pub key_version: i32,
}

/// Connection target for scheduled queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    /// Identity
    pub id: i64,
    /// Display name
    pub name: String,
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Login role
    pub username: String,
    /// Sealed password
    pub credential: SealedCredential,
}

/// Persisted data-source records, as seen by the engine
#[async_trait]
pub trait DataSourceStore: Send + Sync {
    /// All data sources, ordered by id
    async fn list_data_sources(&self) -> Result<Vec<DataSource>, StoreError>;

    /// A single data source
    async fn get_data_source(&self, id: i64) -> Result<Option<DataSource>, StoreError>;

    /// Replace the sealed credential of one record if it still equals
    /// `expected`. Ciphertext and key version change together or not at all.
    ///
    /// Returns `false` when the record is gone or was modified concurrently.
    async fn swap_credential(
        &self,
        id: i64,
        expected: &SealedCredential,
        replacement: &SealedCredential,
    ) -> Result<bool, StoreError>;
}

/// In-process [`DataSourceStore`]
#[derive(Debug, Default)]
pub struct MemoryDataSourceStore {
    sources: RwLock<BTreeMap<i64, DataSource>>,
}

impl MemoryDataSourceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub async fn upsert(&self, source: DataSource) {
        self.sources.write().await.insert(source.id, source);
    }

    /// Remove a record
    pub async fn remove(&self, id: i64) -> Option<DataSource> {
        self.sources.write().await.remove(&id)
    }
}

#[async_trait]
impl DataSourceStore for MemoryDataSourceStore {
    async fn list_data_sources(&self) -> Result<Vec<DataSource>, StoreError> {
        Ok(self.sources.read().await.values().cloned().collect())
    }

    async fn get_data_source(&self, id: i64) -> Result<Option<DataSource>, StoreError> {
        Ok(self.sources.read().await.get(&id).cloned())
    }

    async fn swap_credential(
        &self,
        id: i64,
        expected: &SealedCredential,
        replacement: &SealedCredential,
    ) -> Result<bool, StoreError> {
        let mut sources = self.sources.write().await;
        match sources.get_mut(&id) {
            Some(source) if &source.credential == expected => {
                source.credential = replacement.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
