//! CredentialVault - sealing and opening data-source passwords
//!
//! Thin policy layer over `pgsched-crypto`: it pins the private key to a key
//! version and refuses ciphertexts produced under any other version.

use pgsched_crypto::{CryptoError, PublicKey, SecretKey};
use secrecy::SecretString;
use std::path::Path;
use thiserror::Error;

use crate::datasource::SealedCredential;

/// Credential decryption / key loading failures
#[derive(Debug, Error)]
pub enum VaultError {
    /// Ciphertext was sealed under a different key version
    #[error("credential sealed with key version {found}, vault holds version {expected}")]
    KeyVersionMismatch {
        /// Version the vault can open
        expected: i32,
        /// Version recorded on the credential
        found: i32,
    },

    /// Crypto layer rejected the ciphertext
    #[error("decryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// Decrypted bytes are not a UTF-8 password
    #[error("decrypted credential is not valid UTF-8")]
    NotUtf8,

    /// Key file could not be read
    #[error("cannot read key file {path}: {message}")]
    KeyFile {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },
}

/// Holds the private key for one key version.
#[derive(Debug)]
pub struct CredentialVault {
    secret: SecretKey,
    key_version: i32,
}

impl CredentialVault {
    /// Create a vault from an in-memory key
    pub fn new(secret: SecretKey, key_version: i32) -> Self {
        Self {
            secret,
            key_version,
        }
    }

    /// Load the private key from a base64 key file
    pub fn from_key_file(path: &Path, key_version: i32) -> Result<Self, VaultError> {
        let secret = load_private_key(path)?;
        Ok(Self::new(secret, key_version))
    }

    /// Key version this vault opens
    pub fn key_version(&self) -> i32 {
        self.key_version
    }

    /// Public key matching the vault's private key
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Recover a password. The result is only ever held in memory.
    pub fn open(&self, credential: &SealedCredential) -> Result<SecretString, VaultError> {
        if credential.key_version != self.key_version {
            return Err(VaultError::KeyVersionMismatch {
                expected: self.key_version,
                found: credential.key_version,
            });
        }
        open_with(&self.secret, credential)
    }

    /// Seal a password for `public`, tagging it with `key_version`.
    pub fn seal(
        plaintext: &str,
        public: &PublicKey,
        key_version: i32,
    ) -> Result<SealedCredential, VaultError> {
        let ciphertext = pgsched_crypto::seal(plaintext.as_bytes(), public)?;
        Ok(SealedCredential {
            ciphertext,
            algorithm: pgsched_crypto::ALGORITHM.to_string(),
            key_version,
        })
    }
}

/// Open a credential with an explicit key, ignoring key versions.
///
/// Used by key rotation, where the caller vouches for the old key.
pub fn open_with(
    secret: &SecretKey,
    credential: &SealedCredential,
) -> Result<SecretString, VaultError> {
    let bytes =
        pgsched_crypto::open_tagged(&credential.algorithm, &credential.ciphertext, secret)?;
    let text = std::str::from_utf8(&bytes).map_err(|_| VaultError::NotUtf8)?;
    Ok(SecretString::from(text.to_string()))
}

/// Read a base64 private key file
pub fn load_private_key(path: &Path) -> Result<SecretKey, VaultError> {
    let data = std::fs::read(path).map_err(|e| VaultError::KeyFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(pgsched_crypto::load_private_key_b64(&data)?)
}

/// Read a base64 public key file
pub fn load_public_key(path: &Path) -> Result<PublicKey, VaultError> {
    let data = std::fs::read(path).map_err(|e| VaultError::KeyFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(pgsched_crypto::load_public_key_b64(&data)?)
}
