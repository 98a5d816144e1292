//! Configuration checks run before anything connects

use super::config::AppConfig;
use super::loader::ENV_VAR;
use anyhow::{bail, Result};
use tracing::warn;

/// Reject settings the server cannot start with; warn about risky ones
/// when `PGSCHED_ENV=production`.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.database.url.trim().is_empty() {
        bail!("database.url is not set (PGSCHED_DATABASE__URL)");
    }
    if config.keys.key_version < 1 {
        bail!("keys.key_version must be at least 1, got {}", config.keys.key_version);
    }
    if config.scheduler.reconcile_interval_secs == 0 {
        bail!("scheduler.reconcile_interval_secs must be positive");
    }

    let is_production = std::env::var(ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("production"))
        .unwrap_or(false);
    if !is_production {
        return Ok(());
    }

    if !config.database.url.contains("sslmode=") {
        warn!(
            "SECURITY WARNING: database.url does not set sslmode in production. \
             Consider sslmode=require or stronger."
        );
    }
    if config.logging.redact_keys.is_empty() {
        warn!(
            "SECURITY WARNING: logging.redact_keys is empty; credentials in source errors \
             will be stored verbatim."
        );
    }

    Ok(())
}
