//! pgsched Crypto - sealed-box encryption for data-source credentials.
//!
//! Anyone holding the public key can seal a password; only the holder of the
//! matching private key can open it. Ciphertexts are libsodium sealed boxes
//! (`crypto_box_seal`): a fresh ephemeral X25519 public key followed by the
//! XSalsa20-Poly1305 box, whose nonce is BLAKE2b over both public keys.
//!
//! The output is self-contained (`eph_pk ‖ ciphertext+tag`), so it can be
//! stored as an opaque byte string next to its algorithm tag and key version,
//! and boxes written by any libsodium binding open here unchanged. Nothing
//! here logs or caches plaintext.

#![forbid(unsafe_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::{KEY_SIZE, SEALBYTES};
use zeroize::Zeroizing;

pub use crypto_box::PublicKey;

/// Algorithm tag stored alongside every ciphertext produced by [`seal`].
pub const ALGORITHM: &str = "libsodium-sealedbox";

const KEY_LEN: usize = KEY_SIZE;

/// Smallest well-formed ciphertext: ephemeral key and an empty plaintext's
/// authentication tag.
pub const MIN_CIPHERTEXT_LEN: usize = SEALBYTES;

/// Error types for crypto operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed
    EncryptionFailed,
    /// Decryption failed (wrong key, tampered data)
    DecryptionFailed,
    /// Ciphertext or key material is malformed
    InvalidFormat(String),
    /// The stored algorithm tag is not one this build can open
    UnsupportedAlgorithm(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncryptionFailed => write!(f, "encryption failed"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            Self::UnsupportedAlgorithm(tag) => write!(f, "unsupported algorithm: {}", tag),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Private half of a credential keypair.
///
/// The inner scalar is zeroized on drop.
pub struct SecretKey(crypto_box::SecretKey);

impl SecretKey {
    /// Build from raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(crypto_box::SecretKey::from_bytes(bytes))
    }

    /// Public key matching this secret.
    pub fn public_key(&self) -> PublicKey {
        self.0.public_key()
    }

    /// Raw key bytes, wrapped so the copy is wiped when dropped.
    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.0.to_bytes())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generate a new credential keypair.
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let secret = crypto_box::SecretKey::generate(&mut rand::thread_rng());
    let public = secret.public_key();
    (SecretKey(secret), public)
}

/// Seal `plaintext` for the holder of `recipient`'s private key.
///
/// Sealing the same plaintext twice yields different ciphertexts.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    recipient
        .seal(&mut rand::thread_rng(), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Open a sealed box addressed to `secret`'s public key.
///
/// The plaintext is returned in a buffer that is wiped on drop.
pub fn open(sealed: &[u8], secret: &SecretKey) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: {} bytes",
            sealed.len()
        )));
    }

    secret
        .0
        .unseal(sealed)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Open a ciphertext after checking its stored algorithm tag.
pub fn open_tagged(
    algorithm: &str,
    sealed: &[u8],
    secret: &SecretKey,
) -> Result<Zeroizing<Vec<u8>>> {
    if algorithm != ALGORITHM {
        return Err(CryptoError::UnsupportedAlgorithm(algorithm.to_string()));
    }
    open(sealed, secret)
}

fn decode_key_b64(data: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| CryptoError::InvalidFormat("key file is not UTF-8".to_string()))?;
    let raw = Zeroizing::new(
        BASE64
            .decode(text.trim())
            .map_err(|e| CryptoError::InvalidFormat(format!("invalid base64 key: {}", e)))?,
    );
    if raw.len() != KEY_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "expected {} key bytes, got {}",
            KEY_LEN,
            raw.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Parse a public key from key-file bytes (base64 of the 32 raw bytes).
pub fn load_public_key_b64(data: &[u8]) -> Result<PublicKey> {
    let key = decode_key_b64(data)?;
    Ok(PublicKey::from(*key))
}

/// Parse a private key from key-file bytes (base64 of the 32 raw bytes).
pub fn load_private_key_b64(data: &[u8]) -> Result<SecretKey> {
    let key = decode_key_b64(data)?;
    Ok(SecretKey::from_bytes(*key))
}

/// Base64 encoding used for key files.
pub fn encode_key_b64(bytes: &[u8; KEY_LEN]) -> String {
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let (secret, public) = generate_keypair();

        let sealed = seal(b"hunter2", &public).unwrap();
        assert_eq!(sealed.len(), b"hunter2".len() + MIN_CIPHERTEXT_LEN);
        assert_ne!(&sealed[KEY_LEN..KEY_LEN + 7], b"hunter2");

        let opened = open(&sealed, &secret).unwrap();
        assert_eq!(opened.as_slice(), b"hunter2");
    }

    #[test]
    fn test_sealing_is_randomized() {
        let (secret, public) = generate_keypair();

        let a = seal(b"same password", &public).unwrap();
        let b = seal(b"same password", &public).unwrap();
        assert_ne!(a, b);
        // Distinct ephemeral keys
        assert_ne!(a[..KEY_LEN], b[..KEY_LEN]);

        assert_eq!(open(&a, &secret).unwrap().as_slice(), b"same password");
        assert_eq!(open(&b, &secret).unwrap().as_slice(), b"same password");
    }

    #[test]
    fn test_wrong_keypair_fails() {
        let (_, public) = generate_keypair();
        let (other_secret, _) = generate_keypair();

        let sealed = seal(b"secret", &public).unwrap();
        assert_eq!(
            open(&sealed, &other_secret).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (secret, public) = generate_keypair();
        let mut sealed = seal(b"original", &public).unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert_eq!(open(&sealed, &secret).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let (secret, public) = generate_keypair();
        let sealed = seal(b"original", &public).unwrap();

        let result = open(&sealed[..MIN_CIPHERTEXT_LEN - 1], &secret);
        assert!(matches!(result, Err(CryptoError::InvalidFormat(_))));

        // Long enough to parse but missing plaintext bytes: authentication fails.
        let result = open(&sealed[..sealed.len() - 2], &secret);
        assert_eq!(result.unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_empty_plaintext() {
        let (secret, public) = generate_keypair();
        let sealed = seal(b"", &public).unwrap();
        assert_eq!(sealed.len(), MIN_CIPHERTEXT_LEN);
        assert!(open(&sealed, &secret).unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_algorithm_tag() {
        let (secret, public) = generate_keypair();
        let sealed = seal(b"pw", &public).unwrap();

        let result = open_tagged("x25519-aes256gcm", &sealed, &secret);
        assert_eq!(
            result.unwrap_err(),
            CryptoError::UnsupportedAlgorithm("x25519-aes256gcm".to_string())
        );
        assert_eq!(
            open_tagged(ALGORITHM, &sealed, &secret).unwrap().as_slice(),
            b"pw"
        );
    }

    // Written by libsodium's crypto_box_seal for the secret key 0x01..=0x20.
    const SODIUM_SECRET_B64: &str = "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA=";
    const SODIUM_PUBLIC_B64: &str = "B6N8vBQgk8i3VdwbEOhstCY3StFqqFPtC9/AsrhtHHw=";
    const SODIUM_SEALED_HUNTER2_B64: &str =
        "uTMgaj08lTbWafCYrCJOVkRCxJO4sEiSW6oyL1ylj0iga14atSeUtk5m7li96VKE5DleImugEw==";

    #[test]
    fn test_opens_libsodium_sealed_box() {
        let secret = load_private_key_b64(SODIUM_SECRET_B64.as_bytes()).unwrap();
        assert_eq!(encode_key_b64(secret.public_key().as_bytes()), SODIUM_PUBLIC_B64);

        let sealed = BASE64.decode(SODIUM_SEALED_HUNTER2_B64).unwrap();
        assert_eq!(sealed.len(), 55);
        let opened = open_tagged(ALGORITHM, &sealed, &secret).unwrap();
        assert_eq!(opened.as_slice(), b"hunter2");

        let mut tampered = sealed.clone();
        tampered[KEY_LEN] ^= 0x01;
        assert_eq!(open(&tampered, &secret).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_sealed_for_libsodium_key_reopens() {
        let public = load_public_key_b64(SODIUM_PUBLIC_B64.as_bytes()).unwrap();
        let secret = load_private_key_b64(SODIUM_SECRET_B64.as_bytes()).unwrap();

        let sealed = seal(b"hunter2", &public).unwrap();
        assert_eq!(sealed.len(), 55);
        assert_eq!(open(&sealed, &secret).unwrap().as_slice(), b"hunter2");
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, public) = generate_keypair();

        let pub_path = dir.path().join("public_key.base64");
        let priv_path = dir.path().join("private_key.base64");
        std::fs::write(&pub_path, format!("{}\n", encode_key_b64(public.as_bytes()))).unwrap();
        std::fs::write(&priv_path, encode_key_b64(&secret.to_bytes())).unwrap();

        let loaded_public = load_public_key_b64(&std::fs::read(&pub_path).unwrap()).unwrap();
        let loaded_secret = load_private_key_b64(&std::fs::read(&priv_path).unwrap()).unwrap();
        assert_eq!(loaded_public.as_bytes(), public.as_bytes());

        let sealed = seal(b"from file", &loaded_public).unwrap();
        assert_eq!(open(&sealed, &loaded_secret).unwrap().as_slice(), b"from file");
    }

    #[test]
    fn test_bad_key_length() {
        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(
            load_public_key_b64(short.as_bytes()),
            Err(CryptoError::InvalidFormat(_))
        ));
        assert!(matches!(
            load_private_key_b64(b"not base64!!"),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let secret = SecretKey::from_bytes([42u8; 32]);
        let debug = format!("{:?}", secret);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }
}
