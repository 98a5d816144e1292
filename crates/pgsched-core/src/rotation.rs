//! KeyRotator - re-seals every data-source credential under a new keypair
//!
//! Each record is handled on its own: open with the old private key, seal
//! for the new public key, then swap ciphertext and key version together
//! with a compare-and-swap. A failure on one record is reported and leaves
//! that record exactly as it was; it never rolls back or blocks the others.
//! Records already at the target key version are left alone, so an
//! interrupted rotation can simply be run again.

use pgsched_crypto::{PublicKey, SecretKey};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::datasource::{DataSource, DataSourceStore};
use crate::error::ErrorKind;
use crate::executor::{ConnectTarget, SourceConnector};
use crate::store::StoreError;
use crate::vault::{open_with, CredentialVault};


/// Failures that stop a rotation before any record is touched
#[derive(Debug, Error)]
pub enum RotationError {
    /// Data sources could not be listed
    #[error("cannot list data sources: {0}")]
    Store(#[from] StoreError),
}

impl RotationError {
    /// Failure class
    pub fn kind(&self) -> ErrorKind {
        match self {
            RotationError::Store(_) => ErrorKind::Persistence,
        }
    }
}

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RotationOutcome {
    /// Re-sealed and swapped
    Rotated,
    /// Already sealed under the target key version
    AlreadyCurrent,
    /// Record changed (or vanished) between read and swap; left as is
    Conflict,
    /// Could not be re-sealed; left as is
    Failed {
        /// Why
        reason: String,
    },
}

/// Connectivity check after a successful swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Verification {
    /// Session opened with the re-sealed credential
    Reachable,
    /// Session could not be opened. The swap stands.
    Unreachable {
        /// Connector error
        reason: String,
    },
}

/// Per-record result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationItem {
    /// Record id
    pub data_source_id: i64,
    /// Record name
    pub name: String,
    /// Swap result
    pub outcome: RotationOutcome,
    /// Connectivity, when requested and the record was rotated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

/// Summary of a rotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Key version written
    pub key_version: i32,
    /// Records re-sealed
    pub rotated: usize,
    /// Records that could not be re-sealed
    pub failed: usize,
    /// Records modified concurrently
    pub conflicts: usize,
    /// Records already at `key_version`
    pub already_current: usize,
    /// Rotated records that answered a connectivity check
    pub verified: usize,
    /// Rotated records that did not
    pub unreachable: usize,
    /// One entry per record, by id
    pub items: Vec<RotationItem>,
}

impl RotationReport {
    /// No record failed or conflicted
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.conflicts == 0
    }

    fn push(&mut self, item: RotationItem) {
        match item.outcome {
            RotationOutcome::Rotated => self.rotated += 1,
            RotationOutcome::AlreadyCurrent => self.already_current += 1,
            RotationOutcome::Conflict => self.conflicts += 1,
            RotationOutcome::Failed { .. } => self.failed += 1,
        }
        match item.verification {
            Some(Verification::Reachable) => self.verified += 1,
            Some(Verification::Unreachable { .. }) => self.unreachable += 1,
            None => {}
        }
        self.items.push(item);
    }
}

/// Re-seals data-source credentials
pub struct KeyRotator {
    sources: Arc<dyn DataSourceStore>,
    connector: Arc<dyn SourceConnector>,
}

impl KeyRotator {
    /// Create a rotator
    pub fn new(sources: Arc<dyn DataSourceStore>, connector: Arc<dyn SourceConnector>) -> Self {
        Self { sources, connector }
    }

    /// Rotate every record to `new_public` / `new_key_version`.
    ///
    /// With `verify`, each rotated record gets a connectivity check; an
    /// unreachable source is reported but its new credential is kept.
    pub async fn rotate(
        &self,
        old_secret: &SecretKey,
        new_public: &PublicKey,
        new_key_version: i32,
        verify: bool,
    ) -> Result<RotationReport, RotationError> {
        let sources = self.sources.list_data_sources().await?;
        info!(
            sources = sources.len(),
            key_version = new_key_version,
            verify,
            "Starting key rotation"
        );

        let mut report = RotationReport {
            key_version: new_key_version,
            ..RotationReport::default()
        };
        for source in &sources {
            let item = self
                .rotate_one(source, old_secret, new_public, new_key_version, verify)
                .await;
            report.push(item);
        }

        info!(
            rotated = report.rotated,
            failed = report.failed,
            conflicts = report.conflicts,
            already_current = report.already_current,
            verified = report.verified,
            unreachable = report.unreachable,
            "Key rotation finished"
        );
        Ok(report)
    }

    async fn rotate_one(
        &self,
        source: &DataSource,
        old_secret: &SecretKey,
        new_public: &PublicKey,
        new_key_version: i32,
        verify: bool,
    ) -> RotationItem {
        let mut item = RotationItem {
            data_source_id: source.id,
            name: source.name.clone(),
            outcome: RotationOutcome::Rotated,
            verification: None,
        };

        if source.credential.key_version == new_key_version {
            item.outcome = RotationOutcome::AlreadyCurrent;
            return item;
        }

        let password = match open_with(old_secret, &source.credential) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    data_source_id = source.id,
                    error = %e,
                    "Cannot open credential with old key"
                );
                item.outcome = RotationOutcome::Failed {
                    reason: e.to_string(),
                };
                return item;
            }
        };

        let replacement =
            match CredentialVault::seal(password.expose_secret(), new_public, new_key_version) {
                Ok(c) => c,
                Err(e) => {
                    warn!(data_source_id = source.id, error = %e, "Cannot seal credential");
                    item.outcome = RotationOutcome::Failed {
                        reason: e.to_string(),
                    };
                    return item;
                }
            };

        match self
            .sources
            .swap_credential(source.id, &source.credential, &replacement)
            .await
        {
            Ok(true) => {
                info!(
                    data_source_id = source.id,
                    key_version = new_key_version,
                    "Credential rotated"
                );
            }
            Ok(false) => {
                warn!(data_source_id = source.id, "Record changed during rotation; left untouched");
                item.outcome = RotationOutcome::Conflict;
                return item;
            }
            Err(e) => {
                warn!(data_source_id = source.id, error = %e, "Credential swap failed");
                item.outcome = RotationOutcome::Failed {
                    reason: e.to_string(),
                };
                return item;
            }
        }

        if verify {
            let rotated = DataSource {
                credential: replacement,
                ..source.clone()
            };
            let target = ConnectTarget::new(&rotated, password);
            item.verification = Some(match self.connector.ping(&target).await {
                Ok(()) => Verification::Reachable,
                Err(e) => {
                    warn!(data_source_id = source.id, error = %e, "Rotated source unreachable");
                    Verification::Unreachable {
                        reason: e.to_string(),
                    }
                }
            });
        }
        item
    }
}
