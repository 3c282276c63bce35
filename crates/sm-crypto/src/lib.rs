//! At-rest encryption and the signing keyring.
//!
//! Two independent trust facilities live here:
//!
//! - [`envelope`]: the database file is encrypted on close with
//!   AES-256-CTR under a machine-bound PBKDF2 key, and decrypted on open
//!   with an integrity check over the plaintext. Encryption failures are
//!   recoverable (plaintext stays, retried with backoff); decryption
//!   failures are fatal for the session.
//! - [`keyring`]: an Ed25519 keypair for signing exported context bundles,
//!   with rotation into an archive directory.
//!
//! [`identity`] builds the machine identity string both derivations hang
//! off. Identity components that can change under account migration
//! (username) only appear in the primary derivation; the fallback omits
//! them so a renamed user can still open their store.

pub mod envelope;
pub mod identity;
pub mod keyring;

pub use envelope::{decrypt_on_open, encrypt_on_close, EncryptedEnvelope};
pub use identity::MachineIdentity;
pub use keyring::KeyRing;
