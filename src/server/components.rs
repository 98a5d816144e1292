//! Shared construction of stores and the executor

use super::config::AppConfig;
use anyhow::{bail, Context, Result};
use pgsched_core::{CredentialVault, Executor, PgSourceConnector, PostgresStore};
use std::sync::Arc;
use tracing::info;

/// Connect to the metadata database
pub async fn connect_store(config: &AppConfig) -> Result<Arc<PostgresStore>> {
    if config.database.url.trim().is_empty() {
        bail!("database.url is not set (PGSCHED_DATABASE__URL)");
    }
    let store = PostgresStore::connect(&config.database.url, &config.database.pool())
        .await
        .context("Failed to connect to the metadata database")?;
    info!(
        max_connections = config.database.max_connections,
        "Metadata database connected"
    );
    Ok(Arc::new(store))
}

/// Connector for data-source sessions
pub fn source_connector(config: &AppConfig) -> Arc<PgSourceConnector> {
    Arc::new(PgSourceConnector::new(config.executor.source_pools()))
}

/// Executor opening credentials with the configured private key
pub fn build_executor(
    config: &AppConfig,
    store: Arc<PostgresStore>,
    connector: Arc<PgSourceConnector>,
) -> Result<Arc<Executor>> {
    let keys = &config.keys;
    let vault = CredentialVault::from_key_file(&keys.private_key_path, keys.key_version)
        .with_context(|| {
            format!("Failed to load private key from {}", keys.private_key_path.display())
        })?;
    info!(key_version = vault.key_version(), "Credential vault ready");

    let executor = Executor::new(Arc::new(vault), connector, store, config.executor.engine())
        .with_redactor(config.logging.redactor());
    Ok(Arc::new(executor))
}
