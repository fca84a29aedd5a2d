//! Authenticated encryption for backup artifacts.
//!
//! Layout: `MAGIC (8) | salt (16) | nonce (12) | ciphertext + GCM tag`.
//! The key is derived from the installation backup secret with PBKDF2.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::fs;
use std::path::Path;

use super::{write_synced, BackupError, TempFile};

pub const MAGIC: &[u8; 8] = b"CLBKENC1";
pub const PBKDF2_ROUNDS: u32 = 100_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + NONCE_LEN;

fn derive_key(secret: &SecretString, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.expose_secret().as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

pub fn is_encrypted(data: &[u8]) -> bool {
    data.len() >= MAGIC.len() && &data[..MAGIC.len()] == MAGIC
}

pub fn encrypt(plaintext: &[u8], secret: &SecretString) -> Result<Vec<u8>, BackupError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(secret, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| BackupError::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| BackupError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Fails with `DecryptionFailed` on a wrong secret or any tampering
pub fn decrypt(data: &[u8], secret: &SecretString) -> Result<Vec<u8>, BackupError> {
    if data.len() < HEADER_LEN || !is_encrypted(data) {
        return Err(BackupError::Corrupt("not an encrypted backup".into()));
    }
    let salt = &data[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let nonce = &data[MAGIC.len() + SALT_LEN..HEADER_LEN];

    let key = derive_key(secret, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| BackupError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), &data[HEADER_LEN..])
        .map_err(|_| BackupError::DecryptionFailed)
}

/// Decrypt `src` into `dest`. Nothing exists at `dest` unless decryption
/// succeeded.
pub fn decrypt_file(src: &Path, dest: &Path, secret: &SecretString) -> Result<u64, BackupError> {
    let data = fs::read(src).map_err(|e| BackupError::from_io("encrypted backup", e))?;
    let plaintext = decrypt(&data, secret)?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = TempFile::new(dest.with_file_name(format!(".tmp-{}", file_name)));
    write_synced(tmp.path(), &plaintext).map_err(|e| BackupError::from_io("decrypted backup", e))?;
    tmp.persist(dest).map_err(|e| BackupError::from_io("decrypted backup", e))?;
    Ok(plaintext.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_round_trip_is_exact() {
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let sealed = encrypt(&plaintext, &secret("correct horse")).unwrap();

        assert!(is_encrypted(&sealed));
        assert_eq!(sealed.len(), HEADER_LEN + plaintext.len() + 16);
        assert_eq!(decrypt(&sealed, &secret("correct horse")).unwrap(), plaintext);
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_call() {
        let a = encrypt(b"same", &secret("k")).unwrap();
        let b = encrypt(b"same", &secret("k")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let sealed = encrypt(b"patient rows", &secret("right")).unwrap();
        assert!(matches!(decrypt(&sealed, &secret("wrong")), Err(BackupError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut sealed = encrypt(b"patient rows", &secret("right")).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(decrypt(&sealed, &secret("right")), Err(BackupError::DecryptionFailed)));
    }

    #[test]
    fn test_plain_input_rejected() {
        assert!(matches!(
            decrypt(b"SQLite format 3\0 and more bytes here", &secret("k")),
            Err(BackupError::Corrupt(_))
        ));
    }

    #[test]
    fn test_decrypt_file_writes_nothing_on_failure() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.db.enc");
        fs::write(&src, encrypt(b"rows", &secret("right")).unwrap()).unwrap();

        let dest = dir.path().join("a.db");
        assert!(decrypt_file(&src, &dest, &secret("wrong")).is_err());
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        assert_eq!(decrypt_file(&src, &dest, &secret("right")).unwrap(), 4);
        assert_eq!(fs::read(&dest).unwrap(), b"rows");
    }
}
