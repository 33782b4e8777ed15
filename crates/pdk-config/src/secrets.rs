//! Encrypted on-disk secret store.
//!
//! Secrets live in `~/.pdk/secrets.json`, encrypted with AES-256-GCM. The
//! key is derived with PBKDF2-SHA256 from a machine-local passphrase
//! (user name + home directory), so the file is useless when copied to
//! another account or machine. File format:
//! `base64(salt || nonce || ciphertext)`.

use aes_gcm::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::PathBuf;

use pdk_core::error::{Error, Result};

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

/// Default store location under the user's home directory.
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pdk")
        .join("secrets.json")
}

/// Passphrase material tied to this account. Not a defense against a
/// local attacker with the same uid; it keeps the file opaque at rest and
/// non-portable.
fn machine_passphrase() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "pdk".to_string());
    let home = dirs::home_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    format!("pdk:{user}:{home}")
}

#[derive(Debug, Default)]
pub struct SecretStore {
    entries: BTreeMap<String, String>,
    path: PathBuf,
}

impl SecretStore {
    /// Open the store at `path`, decrypting if the file exists. A missing
    /// file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let plaintext = decrypt(content.trim(), &machine_passphrase()).map_err(|_| {
                    Error::ConfigurationInvalid(format!(
                        "secret store at {} could not be decrypted; it may be corrupt or \
                         created under a different account",
                        path.display()
                    ))
                })?;
                serde_json::from_slice(&plaintext)
                    .map_err(|e| Error::ConfigInvalidJson {
                        path: path.clone(),
                        detail: e.to_string(),
                    })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Self { entries, path })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(default_store_path())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }

    /// Encrypt and persist. Writes to a temp file and renames so a crash
    /// never leaves a half-written store.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let plaintext = serde_json::to_vec(&self.entries)
            .map_err(|e| Error::Internal(format!("secret serialization failed: {e}")))?;
        let encrypted = encrypt(&plaintext, &machine_passphrase())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &encrypted)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Encrypt `data`; returns `base64(salt || nonce || ciphertext)`.
pub fn encrypt(data: &[u8], passphrase: &str) -> Result<String> {
    use base64::Engine;

    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("cipher init failed: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| Error::Internal(format!("encryption failed: {e:?}")))?;

    let mut packed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    packed.extend_from_slice(&salt);
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(packed))
}

/// Decrypt `base64(salt || nonce || ciphertext)`.
pub fn decrypt(encrypted: &str, passphrase: &str) -> Result<Vec<u8>> {
    use base64::Engine;

    let data = base64::engine::general_purpose::STANDARD
        .decode(encrypted)
        .map_err(|e| Error::InvalidInput(format!("invalid base64: {e}")))?;
    if data.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(Error::InvalidInput("encrypted data too short".into()));
    }

    let salt = &data[..SALT_SIZE];
    let nonce_bytes = &data[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("cipher init failed: {e}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::InvalidInput("decryption failed: wrong key or corrupted data".into()))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let data = b"token=hunter2-xyz";
        let encrypted = encrypt(data, "phrase").unwrap();
        let decrypted = decrypt(&encrypted, "phrase").unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let encrypted = encrypt(b"data", "right").unwrap();
        assert!(decrypt(&encrypted, "wrong").is_err());
    }

    #[test]
    fn ciphertext_differs_per_encryption() {
        let a = encrypt(b"same", "p").unwrap();
        let b = encrypt(b"same", "p").unwrap();
        assert_ne!(a, b, "salt and nonce must be random per call");
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let mut store = SecretStore::open(&path).unwrap();
        store.set("API_KEY", "hunter2-xyz");
        store.set("DB_PASSWORD", "swordfish9");
        store.save().unwrap();

        // file content must be opaque
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hunter2-xyz"));

        let reopened = SecretStore::open(&path).unwrap();
        assert_eq!(reopened.get("API_KEY"), Some("hunter2-xyz"));
        assert_eq!(reopened.get("DB_PASSWORD"), Some("swordfish9"));
    }

    #[test]
    fn missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("none.json")).unwrap();
        assert_eq!(store.names().count(), 0);
    }

    #[test]
    fn tampered_store_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let mut store = SecretStore::open(&path).unwrap();
        store.set("A", "value-123");
        store.save().unwrap();

        std::fs::write(&path, "not-a-valid-store").unwrap();
        assert!(SecretStore::open(&path).is_err());
    }
}
