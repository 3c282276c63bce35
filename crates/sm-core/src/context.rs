//! Per-project context handles.
//!
//! A [`ProjectContext`] is created per invocation from the working
//! directory; nothing in the engine is a process-global, so tests run
//! against isolated temp dirs. The context owns lazy storage opening
//! (with decrypt-on-open in secure mode) and encrypt-on-close.

use std::path::PathBuf;

use tracing::{debug, warn};

use sm_common::{ProjectLayout, Result};
use sm_crypto::{decrypt_on_open, encrypt_on_close, KeyRing, MachineIdentity};
use sm_embed::Embedder;
use sm_policy::{PolicyDocument, TrustTokenStore};
use sm_storage::Store;

/// Environment toggle for at-rest encryption.
pub const SECURE_MODE_ENV: &str = "SMEM_SECURE";

/// Environment toggle for dev mode (encryption disabled entirely).
pub const DEV_MODE_ENV: &str = "SMEM_DEV";

/// One project's handles, created per invocation.
pub struct ProjectContext {
    pub layout: ProjectLayout,
    pub policy: PolicyDocument,
    pub dry_run: bool,
    pub json: bool,
    pub explain: bool,
    store: Option<Store>,
    embedder: Option<Embedder>,
    identity: MachineIdentity,
    secure_mode: bool,
}

impl ProjectContext {
    /// Open the context for `root`: migrate legacy artifacts and load
    /// the policy. Environment scrubbing happens in `main` before any
    /// threads exist ([`scrub_env`]).
    pub fn open(root: PathBuf, dry_run: bool, json: bool, explain: bool) -> Result<Self> {
        let layout = ProjectLayout::new(root);
        layout.migrate_legacy()?;
        let policy = PolicyDocument::load(&layout.policy_path())?;

        let secure_mode = std::env::var(SECURE_MODE_ENV).map(|v| v == "1").unwrap_or(false)
            && std::env::var(DEV_MODE_ENV).map(|v| v != "1").unwrap_or(true);

        Ok(ProjectContext {
            layout,
            policy,
            dry_run,
            json,
            explain,
            store: None,
            embedder: Some(Embedder::default()),
            identity: MachineIdentity::collect(),
            secure_mode,
        })
    }

    /// Whether at-rest encryption is active.
    pub fn secure_mode(&self) -> bool {
        self.secure_mode
    }

    /// The storage engine, opened (and decrypted) on first use.
    pub fn store(&mut self) -> Result<&Store> {
        if self.store.is_none() {
            self.layout.ensure()?;
            if self.secure_mode {
                decrypt_on_open(&self.layout, &self.identity)?;
            }
            self.store = Some(Store::open(&self.layout.db_path())?);
        }
        Ok(self.store.as_ref().expect("store just opened"))
    }

    /// The embedding provider, when it initialized. Indexing proceeds
    /// without vectors when this is `None`.
    pub fn embedder(&self) -> Option<&Embedder> {
        self.embedder.as_ref()
    }

    /// The signing keyring (created on first use).
    pub fn keyring(&self) -> Result<KeyRing> {
        self.layout.ensure()?;
        KeyRing::load_or_create(&self.layout)
    }

    /// The trust token store.
    pub fn trust_tokens(&self) -> Result<TrustTokenStore> {
        TrustTokenStore::load(&self.layout.trust_tokens_path())
    }

    /// Persist the (possibly mutated) policy document.
    pub fn save_policy(&self) -> Result<()> {
        self.layout.ensure()?;
        self.policy.save(&self.layout.policy_path())
    }

    /// Close storage and, in secure mode, encrypt the DB at rest.
    ///
    /// Encryption failures are recoverable: the plaintext stays and the
    /// next close retries. This never panics the caller.
    pub fn close(&mut self) {
        if let Some(store) = self.store.take() {
            store.close();
            drop(store);
        }
        if self.secure_mode {
            if let Err(e) = encrypt_on_close(&self.layout, &self.identity) {
                warn!(error = %e, "encrypt-on-close deferred; plaintext database left in place");
            } else {
                debug!("database encrypted at rest");
            }
        }
    }
}

impl Drop for ProjectContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Remove every environment variable not in the passthrough list.
///
/// Must run on the main thread before any other thread starts (process
/// environment mutation is not thread-safe), so `main` calls this right
/// after the policy loads. The secure/dev/log toggles stay visible.
pub fn scrub_env(policy: &PolicyDocument) {
    let names: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for name in names {
        if name.starts_with("SMEM_") || policy.is_env_allowed(&name) {
            continue;
        }
        std::env::remove_var(&name);
    }
}
