//! Short-lived trust tokens.
//!
//! A token authorizes exactly one command to take a narrowly scoped
//! policy relaxation (e.g. `import-context --allow-unsigned` under
//! `requireSignedContext`). Tokens are minute-bounded and single-use:
//! consuming one removes it. The store persists so that `policy trust`
//! in one invocation is visible to the next.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sm_common::Result;

/// One granted trust token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrustToken {
    pub command: String,
    pub expires_at: DateTime<Utc>,
}

impl TrustToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Persistent token store (`trust-tokens.json`).
#[derive(Debug)]
pub struct TrustTokenStore {
    path: PathBuf,
    tokens: Vec<TrustToken>,
}

impl TrustTokenStore {
    /// Load the store, pruning tokens that have already expired.
    pub fn load(path: &Path) -> Result<Self> {
        let tokens: Vec<TrustToken> = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Vec::new()
        };
        let now = Utc::now();
        let live: Vec<TrustToken> = tokens.into_iter().filter(|t| !t.is_expired(now)).collect();
        Ok(TrustTokenStore {
            path: path.to_path_buf(),
            tokens: live,
        })
    }

    /// Grant a token for `command`, valid for `minutes`.
    pub fn grant(&mut self, command: &str, minutes: i64) -> Result<TrustToken> {
        let token = TrustToken {
            command: command.to_string(),
            expires_at: Utc::now() + Duration::minutes(minutes.max(1)),
        };
        // One live token per command.
        self.tokens.retain(|t| t.command != command);
        self.tokens.push(token.clone());
        self.save()?;
        info!(command, minutes, "trust token granted");
        Ok(token)
    }

    /// Check for a live token without consuming it.
    pub fn peek(&self, command: &str) -> Option<&TrustToken> {
        let now = Utc::now();
        self.tokens
            .iter()
            .find(|t| t.command == command && !t.is_expired(now))
    }

    /// Consume a live token for `command`. Returns whether one existed.
    pub fn consume(&mut self, command: &str) -> Result<bool> {
        let now = Utc::now();
        let before = self.tokens.len();
        let mut consumed = false;
        self.tokens.retain(|t| {
            if !consumed && t.command == command && !t.is_expired(now) {
                consumed = true;
                return false;
            }
            !t.is_expired(now)
        });
        if self.tokens.len() != before {
            self.save()?;
        }
        if consumed {
            debug!(command, "trust token consumed");
        }
        Ok(consumed)
    }

    /// All live tokens.
    pub fn list(&self) -> &[TrustToken] {
        &self.tokens
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.tokens)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_grant_peek_consume() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trust-tokens.json");
        let mut store = TrustTokenStore::load(&path).unwrap();

        store.grant("import-context", 5).unwrap();
        assert!(store.peek("import-context").is_some());
        assert!(store.peek("export-context").is_none());

        assert!(store.consume("import-context").unwrap());
        // Single use.
        assert!(!store.consume("import-context").unwrap());
    }

    #[test]
    fn test_tokens_persist_across_loads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trust-tokens.json");
        {
            let mut store = TrustTokenStore::load(&path).unwrap();
            store.grant("import-context", 5).unwrap();
        }
        let mut reloaded = TrustTokenStore::load(&path).unwrap();
        assert!(reloaded.consume("import-context").unwrap());
    }

    #[test]
    fn test_expired_tokens_are_pruned_on_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trust-tokens.json");
        let stale = vec![TrustToken {
            command: "import-context".to_string(),
            expires_at: Utc::now() - Duration::minutes(1),
        }];
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let store = TrustTokenStore::load(&path).unwrap();
        assert!(store.list().is_empty());
        assert!(store.peek("import-context").is_none());
    }

    #[test]
    fn test_regrant_replaces_existing_token() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("trust-tokens.json");
        let mut store = TrustTokenStore::load(&path).unwrap();
        store.grant("import-context", 1).unwrap();
        store.grant("import-context", 10).unwrap();
        assert_eq!(store.list().len(), 1);
    }
}
