//! Passphrase key store (`keys.json`)
//!
//! The master key is derived from the passphrase with argon2id; the salt
//! and cost parameters are recorded next to an AEAD-encrypted verifier so
//! a wrong passphrase is detected before any blob is touched.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use dlfi_core::{DlfiError, KdfParams, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const VERIFIER_PLAINTEXT: &[u8] = b"dlfi-keystore-v1";

#[derive(Debug, Serialize, Deserialize)]
struct Verifier {
    nonce: String,
    ciphertext: String,
}

/// On-disk shape of `keys.json`
#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreFile {
    algo: String,
    salt: String,
    t: u32,
    m: u32,
    p: u32,
    verifier: Verifier,
}

/// Derive the 256-bit master key from a passphrase.
pub fn derive_master_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<[u8; 32]> {
    let argon_params = argon2::Params::new(params.m_cost, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| DlfiError::Crypto(e.to_string()))?;
    let argon = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );
    let mut out = [0u8; 32];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| DlfiError::Crypto(e.to_string()))?;
    Ok(out)
}

fn encrypt_verifier(master_key: &[u8; 32]) -> Result<Verifier> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let cipher = XChaCha20Poly1305::new_from_slice(master_key)
        .map_err(|e| DlfiError::Crypto(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), VERIFIER_PLAINTEXT)
        .map_err(|e| DlfiError::Crypto(e.to_string()))?;
    Ok(Verifier {
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

fn check_verifier(master_key: &[u8; 32], verifier: &Verifier) -> Result<()> {
    let nonce = hex::decode(&verifier.nonce)
        .map_err(|e| DlfiError::Crypto(format!("bad verifier nonce: {e}")))?;
    let ciphertext = hex::decode(&verifier.ciphertext)
        .map_err(|e| DlfiError::Crypto(format!("bad verifier ciphertext: {e}")))?;
    let cipher = XChaCha20Poly1305::new_from_slice(master_key)
        .map_err(|e| DlfiError::Crypto(e.to_string()))?;
    let plain = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| DlfiError::DecryptionFailed)?;
    if plain != VERIFIER_PLAINTEXT {
        return Err(DlfiError::DecryptionFailed);
    }
    Ok(())
}

fn write_atomic(path: &Path, file: &KeyStoreFile) -> Result<()> {
    let json = serde_json::to_string_pretty(file)
        .map_err(|e| DlfiError::Serialization(e.to_string()))?;
    let dir = path
        .parent()
        .ok_or_else(|| DlfiError::Crypto("key store path has no parent".into()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(json.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| DlfiError::Io(e.error))?;
    Ok(())
}

/// Create a fresh key store at `path` and return the derived master key.
pub fn create(path: &Path, passphrase: &str, params: &KdfParams) -> Result<[u8; 32]> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let master_key = derive_master_key(passphrase, &salt, params)?;
    write(path, &salt, params, &master_key)?;
    Ok(master_key)
}

/// Generate a fresh random salt.
pub fn fresh_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Write `keys.json` for an already-derived master key. Used by rotation,
/// which must rewrap every blob DEK before committing the new key store.
pub fn write(path: &Path, salt: &[u8], params: &KdfParams, master_key: &[u8; 32]) -> Result<()> {
    let file = KeyStoreFile {
        algo: "argon2id".to_string(),
        salt: hex::encode(salt),
        t: params.t_cost,
        m: params.m_cost,
        p: params.p_cost,
        verifier: encrypt_verifier(master_key)?,
    };
    write_atomic(path, &file)
}

/// Load `keys.json`, derive the master key, and check the verifier.
/// A wrong passphrase fails with `DecryptionFailed`.
pub fn unlock(path: &Path, passphrase: &str) -> Result<[u8; 32]> {
    let raw = std::fs::read_to_string(path)?;
    let file: KeyStoreFile =
        serde_json::from_str(&raw).map_err(|e| DlfiError::Serialization(e.to_string()))?;
    if file.algo != "argon2id" {
        return Err(DlfiError::Crypto(format!("unsupported kdf {:?}", file.algo)));
    }
    let salt = hex::decode(&file.salt)
        .map_err(|e| DlfiError::Crypto(format!("bad key store salt: {e}")))?;
    let params = KdfParams {
        t_cost: file.t,
        m_cost: file.m,
        p_cost: file.p,
    };
    let master_key = derive_master_key(passphrase, &salt, &params)?;
    check_verifier(&master_key, &file.verifier)?;
    Ok(master_key)
}

/// Remove the key store file (used when encryption is disabled).
pub fn remove(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_params() -> KdfParams {
        KdfParams {
            t_cost: 1,
            m_cost: 8,
            p_cost: 1,
        }
    }

    #[test]
    fn create_and_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let mk = create(&path, "hunter2", &cheap_params()).unwrap();
        let again = unlock(&path, "hunter2").unwrap();
        assert_eq!(mk, again);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        create(&path, "hunter2", &cheap_params()).unwrap();
        let err = unlock(&path, "wrong").unwrap_err();
        assert!(matches!(err, DlfiError::DecryptionFailed));
    }

    #[test]
    fn rotation_changes_salt_but_keeps_behavior() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        create(&path, "one", &cheap_params()).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();
        create(&path, "two", &cheap_params()).unwrap();
        let after = std::fs::read_to_string(&path).unwrap();
        assert_ne!(before, after);
        assert!(unlock(&path, "one").is_err());
        assert!(unlock(&path, "two").is_ok());
    }
}
