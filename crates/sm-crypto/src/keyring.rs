//! Ed25519 signing keyring.
//!
//! The active keypair lives under `keys/active/` as a 32-byte seed plus
//! its public key; rotation moves the pair into `keys/archive/` named by
//! key ID. The key ID is the first 16 hex characters of
//! SHA-256(public key bytes) and identifies signers in bundle manifests.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use sm_common::{Error, ProjectLayout, Result};

const SEED_FILE: &str = "signing.key";
const PUB_FILE: &str = "signing.pub";

/// ASN.1 SubjectPublicKeyInfo prefix for an Ed25519 raw key.
const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Active signing keypair plus the archive directory.
pub struct KeyRing {
    signing: SigningKey,
    active_dir: PathBuf,
    archive_dir: PathBuf,
}

impl KeyRing {
    /// Load the active keypair, generating one if none exists.
    pub fn load_or_create(layout: &ProjectLayout) -> Result<Self> {
        let active_dir = layout.active_keys_dir();
        let archive_dir = layout.archive_keys_dir();
        std::fs::create_dir_all(&active_dir)?;
        std::fs::create_dir_all(&archive_dir)?;

        let seed_path = active_dir.join(SEED_FILE);
        let signing = if seed_path.exists() {
            let seed = read_exact32(&seed_path)?;
            SigningKey::from_bytes(&seed)
        } else {
            let signing = SigningKey::generate(&mut rand_core::OsRng);
            write_keypair(&active_dir, &signing)?;
            info!("generated new signing keypair");
            signing
        };

        Ok(KeyRing {
            signing,
            active_dir,
            archive_dir,
        })
    }

    /// First 16 hex chars of SHA-256(public key).
    pub fn key_id(&self) -> String {
        key_id_of(&self.signing.verifying_key())
    }

    /// Public key bytes (raw 32).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Public key as SubjectPublicKeyInfo DER (for `publickey.der`).
    pub fn public_key_der(&self) -> Vec<u8> {
        let mut der = SPKI_PREFIX.to_vec();
        der.extend_from_slice(&self.public_key_bytes());
        der
    }

    /// Sign a message, returning the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Rotate: archive the current pair under its key ID, generate fresh.
    pub fn rotate(&mut self) -> Result<String> {
        let old_id = self.key_id();
        let archived_seed = self.archive_dir.join(format!("{old_id}.key"));
        let archived_pub = self.archive_dir.join(format!("{old_id}.pub"));
        std::fs::rename(self.active_dir.join(SEED_FILE), archived_seed)?;
        std::fs::rename(self.active_dir.join(PUB_FILE), archived_pub)?;

        self.signing = SigningKey::generate(&mut rand_core::OsRng);
        write_keypair(&self.active_dir, &self.signing)?;
        let new_id = self.key_id();
        info!(old = %old_id, new = %new_id, "rotated signing keypair");
        Ok(new_id)
    }

    /// Key IDs of archived pairs, oldest first.
    pub fn archived_ids(&self) -> Result<Vec<String>> {
        let mut entries: Vec<(std::time::SystemTime, String)> = Vec::new();
        for entry in std::fs::read_dir(&self.archive_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".key") {
                let mtime = entry
                    .metadata()?
                    .modified()
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                entries.push((mtime, id.to_string()));
            }
        }
        entries.sort();
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    /// Delete archived pairs beyond the `keep` most recent.
    /// Returns the pruned key IDs.
    pub fn prune_archive(&self, keep: usize) -> Result<Vec<String>> {
        let ids = self.archived_ids()?;
        let prune_count = ids.len().saturating_sub(keep);
        let mut pruned = Vec::new();
        for id in ids.into_iter().take(prune_count) {
            std::fs::remove_file(self.archive_dir.join(format!("{id}.key")))?;
            let pub_path = self.archive_dir.join(format!("{id}.pub"));
            if pub_path.exists() {
                std::fs::remove_file(pub_path)?;
            }
            debug!(key_id = %id, "pruned archived keypair");
            pruned.push(id);
        }
        Ok(pruned)
    }
}

/// Verify a detached signature with a raw-or-DER public key.
pub fn verify_detached(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let raw = strip_spki(public_key)?;
    let verifying = VerifyingKey::from_bytes(&raw)
        .map_err(|e| Error::SignatureInvalid(format!("bad public key: {e}")))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| Error::SignatureInvalid("signature must be 64 bytes".to_string()))?;
    let sig = Signature::from_bytes(&sig_bytes);
    verifying
        .verify(message, &sig)
        .map_err(|e| Error::SignatureInvalid(e.to_string()))
}

/// Key ID for arbitrary public key bytes (raw or DER).
pub fn key_id_for(public_key: &[u8]) -> Result<String> {
    let raw = strip_spki(public_key)?;
    let verifying = VerifyingKey::from_bytes(&raw)
        .map_err(|e| Error::SignatureInvalid(format!("bad public key: {e}")))?;
    Ok(key_id_of(&verifying))
}

fn key_id_of(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.to_bytes()))[..16].to_string()
}

fn strip_spki(bytes: &[u8]) -> Result<[u8; 32]> {
    let raw: &[u8] = if bytes.len() == SPKI_PREFIX.len() + 32 && bytes[..12] == SPKI_PREFIX {
        &bytes[12..]
    } else {
        bytes
    };
    raw.try_into()
        .map_err(|_| Error::SignatureInvalid("public key must be 32 bytes".to_string()))
}

fn write_keypair(dir: &Path, signing: &SigningKey) -> Result<()> {
    write_atomic(&dir.join(SEED_FILE), &signing.to_bytes())?;
    write_atomic(&dir.join(PUB_FILE), &signing.verifying_key().to_bytes())?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_exact32(path: &Path) -> Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    bytes
        .try_into()
        .map_err(|_| Error::StorageCorrupt(format!("malformed key file {}", path.display())))
}
