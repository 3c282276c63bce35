//! AES-256-CTR database envelope.
//!
//! On close the plaintext `memory.db` is replaced by a JSON envelope
//! (`memory.db.enc`) carrying the ciphertext, the IV, the PBKDF2 salt, and
//! a SHA-256 of the plaintext for integrity verification. On open the
//! envelope is decrypted back to `memory.db`.
//!
//! Key derivation is PBKDF2-HMAC-SHA256 with 200 000 iterations over the
//! machine identity password; a fresh 16-byte salt is drawn per envelope.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use sm_common::{Error, ProjectLayout, Result};

use crate::identity::MachineIdentity;

/// PBKDF2 iteration count. Part of the envelope format.
pub const PBKDF2_ITERATIONS: u32 = 200_000;

/// Encrypt-on-close retry bound.
pub const MAX_ENCRYPT_ATTEMPTS: u32 = 5;

/// First backoff delay; doubles per attempt.
pub const ENCRYPT_BACKOFF_BASE: Duration = Duration::from_millis(500);

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// On-disk envelope format. Field names are part of the format.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Ciphertext, base64.
    pub encrypted: String,
    /// 16-byte CTR IV, hex.
    pub iv: String,
    /// SHA-256 of the plaintext, hex.
    pub integrity_hash: String,
    pub algorithm: String,
    pub key_derivation: String,
    /// 16-byte PBKDF2 salt, hex.
    pub salt: String,
}

impl EncryptedEnvelope {
    /// Encrypt `plaintext` under `password` with fresh salt and IV.
    pub fn seal(plaintext: &[u8], password: &str) -> Result<Self> {
        let mut salt = [0u8; 16];
        let mut iv = [0u8; 16];
        getrandom::getrandom(&mut salt).map_err(|e| Error::internal(e))?;
        getrandom::getrandom(&mut iv).map_err(|e| Error::internal(e))?;

        let key = derive_key(password, &salt);
        let mut buf = plaintext.to_vec();
        apply_ctr(&key, &iv, &mut buf);

        Ok(EncryptedEnvelope {
            encrypted: base64::engine::general_purpose::STANDARD.encode(&buf),
            iv: hex::encode(iv),
            integrity_hash: hex::encode(Sha256::digest(plaintext)),
            algorithm: "aes-256-ctr".to_string(),
            key_derivation: format!("pbkdf2-sha256-{}", PBKDF2_ITERATIONS),
            salt: hex::encode(salt),
        })
    }

    /// Decrypt with `password` and verify the plaintext integrity hash.
    pub fn open(&self, password: &str) -> Result<Vec<u8>> {
        if self.algorithm != "aes-256-ctr" {
            return Err(Error::DecryptionFailed(format!(
                "unsupported algorithm '{}'",
                self.algorithm
            )));
        }
        let iv = decode_fixed::<16>(&self.iv, "iv")?;
        let salt = decode_fixed::<16>(&self.salt, "salt")?;
        let mut buf = base64::engine::general_purpose::STANDARD
            .decode(&self.encrypted)
            .map_err(|e| Error::DecryptionFailed(format!("ciphertext is not base64: {e}")))?;

        let key = derive_key(password, &salt);
        apply_ctr(&key, &iv, &mut buf);

        let actual = hex::encode(Sha256::digest(&buf));
        if actual != self.integrity_hash {
            return Err(Error::DecryptionFailed(
                "integrity hash mismatch after decryption".to_string(),
            ));
        }
        Ok(buf)
    }
}

/// Encrypt the plaintext DB into its envelope and remove the plaintext.
///
/// Failures are recoverable: the plaintext stays in place and the attempt
/// is retried with bounded exponential backoff before giving up. Callers
/// must never crash on an `Err` from here.
pub fn encrypt_on_close(layout: &ProjectLayout, identity: &MachineIdentity) -> Result<()> {
    let db = layout.db_path();
    if !db.exists() {
        return Ok(());
    }

    let mut delay = ENCRYPT_BACKOFF_BASE;
    let mut last_err = None;
    for attempt in 1..=MAX_ENCRYPT_ATTEMPTS {
        match try_encrypt(layout, &db, identity) {
            Ok(()) => {
                debug!(attempt, "database encrypted at rest");
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, error = %e, "encrypt-on-close failed; plaintext left in place");
                last_err = Some(e);
                if attempt < MAX_ENCRYPT_ATTEMPTS {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::internal("encrypt-on-close failed")))
}

fn try_encrypt(layout: &ProjectLayout, db: &Path, identity: &MachineIdentity) -> Result<()> {
    let plaintext = std::fs::read(db)?;
    let envelope = EncryptedEnvelope::seal(&plaintext, &identity.primary_password())?;
    let enc_path = layout.encrypted_db_path();

    // Write-temp-then-rename so a torn write never clobbers a valid envelope.
    let tmp = enc_path.with_extension("enc.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&envelope)?)?;
    std::fs::rename(&tmp, &enc_path)?;
    std::fs::remove_file(db)?;
    Ok(())
}

/// Decrypt the envelope back to the plaintext DB if one is present.
///
/// Tries the primary (with-username) password first, then the stable
/// fallback. Integrity mismatch under both passwords is fatal for the
/// session. Returns `true` when a decryption happened.
pub fn decrypt_on_open(layout: &ProjectLayout, identity: &MachineIdentity) -> Result<bool> {
    let enc_path = layout.encrypted_db_path();
    if !enc_path.exists() {
        return Ok(false);
    }

    let raw = std::fs::read_to_string(&enc_path)?;
    let envelope: EncryptedEnvelope = serde_json::from_str(&raw)
        .map_err(|e| Error::DecryptionFailed(format!("unreadable envelope: {e}")))?;

    let plaintext = match envelope.open(&identity.primary_password()) {
        Ok(p) => p,
        Err(_) => {
            debug!("primary key derivation failed, trying stable fallback");
            envelope.open(&identity.fallback_password())?
        }
    };

    std::fs::write(layout.db_path(), plaintext)?;
    std::fs::remove_file(&enc_path)?;
    debug!("database decrypted from envelope");
    Ok(true)
}

fn derive_key(password: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn apply_ctr(key: &[u8; 32], iv: &[u8; 16], buf: &mut [u8]) {
    use ctr::cipher::{KeyIvInit, StreamCipher};
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

fn decode_fixed<const N: usize>(hex_str: &str, field: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::DecryptionFailed(format!("{field} is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::DecryptionFailed(format!("{field} has wrong length")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_common::ErrorKind;
    use tempfile::TempDir;

    fn identity() -> MachineIdentity {
        MachineIdentity {
            hostname: "devbox".into(),
            platform: "linux".into(),
            arch: "x86_64".into(),
            cpu_model: "TestCPU".into(),
            macs: vec!["aa:bb:cc:dd:ee:ff".into()],
            username: Some("alice".into()),
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let envelope = EncryptedEnvelope::seal(b"sqlite page data", "pw").unwrap();
        assert_eq!(envelope.algorithm, "aes-256-ctr");
        let plain = envelope.open("pw").unwrap();
        assert_eq!(plain, b"sqlite page data");
    }

    #[test]
    fn test_open_wrong_password_fails_integrity() {
        let envelope = EncryptedEnvelope::seal(b"data", "right").unwrap();
        let err = envelope.open("wrong").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut envelope = EncryptedEnvelope::seal(b"data data data", "pw").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&envelope.encrypted)
            .unwrap();
        raw[0] ^= 0xff;
        envelope.encrypted = base64::engine::general_purpose::STANDARD.encode(&raw);
        assert!(envelope.open("pw").is_err());
    }

    #[test]
    fn test_encrypt_decrypt_on_disk_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        layout.ensure().unwrap();
        let id = identity();

        std::fs::write(layout.db_path(), b"db bytes").unwrap();
        encrypt_on_close(&layout, &id).unwrap();
        assert!(!layout.db_path().exists());
        assert!(layout.encrypted_db_path().exists());

        let decrypted = decrypt_on_open(&layout, &id).unwrap();
        assert!(decrypted);
        assert_eq!(std::fs::read(layout.db_path()).unwrap(), b"db bytes");
        assert!(!layout.encrypted_db_path().exists());
    }

    #[test]
    fn test_decrypt_with_fallback_after_username_change() {
        let tmp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        layout.ensure().unwrap();

        // Sealed under the fallback password simulates an envelope written
        // before the user account was renamed.
        let plaintext = b"old account data";
        let old = identity();
        let envelope =
            EncryptedEnvelope::seal(plaintext, &old.fallback_password()).unwrap();
        std::fs::write(
            layout.encrypted_db_path(),
            serde_json::to_vec(&envelope).unwrap(),
        )
        .unwrap();

        let mut renamed = identity();
        renamed.username = Some("bob".into());
        assert!(decrypt_on_open(&layout, &renamed).unwrap());
        assert_eq!(std::fs::read(layout.db_path()).unwrap(), plaintext);
    }

    #[test]
    fn test_decrypt_without_envelope_is_noop() {
        let tmp = TempDir::new().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        layout.ensure().unwrap();
        assert!(!decrypt_on_open(&layout, &identity()).unwrap());
    }
}
