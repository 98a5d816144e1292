//! Keygen command - writes a fresh credential keypair

use anyhow::{bail, Context, Result};
use pgsched_crypto::{encode_key_b64, generate_keypair};
use std::fs;
use std::path::{Path, PathBuf};

pub const PUBLIC_KEY_FILE: &str = "public_key.base64";
pub const PRIVATE_KEY_FILE: &str = "private_key.base64";

/// Run the keygen command
pub fn run(out_dir: &Path, force: bool) -> Result<()> {
    let (public_path, private_path) = write_keypair(out_dir, force)?;

    println!("Public key:  {}", public_path.display());
    println!("Private key: {}", private_path.display());
    println!();
    println!("Seal new credentials with the public key; keep the private key on the scheduler host only.");
    Ok(())
}

/// Write both key files into `out_dir`, refusing to clobber existing ones
/// unless `force` is set.
pub fn write_keypair(out_dir: &Path, force: bool) -> Result<(PathBuf, PathBuf)> {
    let public_path = out_dir.join(PUBLIC_KEY_FILE);
    let private_path = out_dir.join(PRIVATE_KEY_FILE);

    if !force {
        for path in [&public_path, &private_path] {
            if path.exists() {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
        }
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let (secret, public) = generate_keypair();
    write_private(&private_path, &encode_key_b64(&secret.to_bytes()))?;
    fs::write(&public_path, encode_key_b64(public.as_bytes()))
        .with_context(|| format!("Failed to write {}", public_path.display()))?;

    Ok((public_path, private_path))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsched_core::vault::{load_private_key, load_public_key};

    #[test]
    fn test_written_keys_load_as_a_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (public_path, private_path) = write_keypair(dir.path(), false).unwrap();

        let secret = load_private_key(&private_path).unwrap();
        let public = load_public_key(&public_path).unwrap();
        assert_eq!(secret.public_key().as_bytes(), public.as_bytes());
    }

    #[test]
    fn test_existing_keys_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let (_, private_path) = write_keypair(dir.path(), false).unwrap();
        let before = fs::read_to_string(&private_path).unwrap();

        let err = write_keypair(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read_to_string(&private_path).unwrap(), before);

        write_keypair(dir.path(), true).unwrap();
        assert_ne!(fs::read_to_string(&private_path).unwrap(), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (_, private_path) = write_keypair(dir.path(), false).unwrap();
        let mode = fs::metadata(&private_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
