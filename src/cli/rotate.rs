//! Rotate-keys command - re-seals stored credentials for a new keypair

use crate::server::config::AppConfig;
use crate::server::{connect_store, source_connector};
use anyhow::{bail, Context, Result};
use pgsched_core::vault::{load_private_key, load_public_key};
use pgsched_core::{format_error_for_cli, KeyRotator, RotationReport};
use std::path::Path;

/// Run the rotate-keys command
pub async fn run(
    config: &AppConfig,
    old_private: &Path,
    new_public: &Path,
    new_version: i32,
    verify: bool,
) -> Result<()> {
    if new_version < 1 {
        bail!("--new-version must be at least 1, got {new_version}");
    }
    let old_secret = load_private_key(old_private)
        .with_context(|| format!("Failed to load old private key {}", old_private.display()))?;
    let new_key = load_public_key(new_public)
        .with_context(|| format!("Failed to load new public key {}", new_public.display()))?;
    if old_secret.public_key().as_bytes() == new_key.as_bytes() {
        bail!("The new public key belongs to the old private key; generate a new keypair first");
    }

    let store = connect_store(config).await?;
    let rotator = KeyRotator::new(store, source_connector(config));
    let report = match rotator.rotate(&old_secret, &new_key, new_version, verify).await {
        Ok(report) => report,
        Err(e) => bail!(format_error_for_cli(&pgsched_core::Error::from(e))),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    summarize(&report)
}

fn summarize(report: &RotationReport) -> Result<()> {
    if report.is_clean() {
        return Ok(());
    }
    bail!(
        "Rotation incomplete: {} failed, {} changed concurrently. \
         Fix the listed records and run the same command again; rotated records are skipped.",
        report.failed,
        report.conflicts
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_report_succeeds() {
        let report = RotationReport {
            key_version: 2,
            rotated: 3,
            already_current: 1,
            ..RotationReport::default()
        };
        assert!(summarize(&report).is_ok());
    }

    #[test]
    fn test_failures_make_the_command_fail() {
        let report = RotationReport {
            key_version: 2,
            rotated: 3,
            failed: 1,
            ..RotationReport::default()
        };
        let err = summarize(&report).unwrap_err();
        assert!(err.to_string().contains("1 failed"));
    }
}
