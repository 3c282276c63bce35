//! The policy document and its persistence.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use sm_common::{Error, Result};

/// Commands every invocation may run regardless of the allow-list.
pub const ALWAYS_ALLOWED: &[&str] = &["help", "--help", "-h", "version", "--version", "-V"];

/// The default command allow-list written by `init`.
pub const DEFAULT_COMMANDS: &[&str] = &[
    "init",
    "status",
    "vector-status",
    "health",
    "remember",
    "recall",
    "index-code",
    "watch-code",
    "reindex-file",
    "reindex-folder",
    "search-code",
    "digest-cache",
    "gc",
    "journal",
    "replay",
    "receipt-show",
    "policy",
    "key",
    "export-context",
    "import-context",
    "prove-offline",
];

/// Policy document persisted as `policy.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub allowed_commands: BTreeSet<String>,
    /// Ordered list; first match wins is irrelevant (any match allows).
    pub allowed_globs: Vec<String>,
    pub env_passthrough: BTreeSet<String>,
    pub network_egress: bool,
    pub audit_trail: bool,
    pub require_signed_context: bool,
    pub sign_exports: bool,
    pub force_signed_exports: bool,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        PolicyDocument {
            allowed_commands: DEFAULT_COMMANDS.iter().map(|s| s.to_string()).collect(),
            allowed_globs: vec!["**".to_string()],
            env_passthrough: ["PATH"].iter().map(|s| s.to_string()).collect(),
            network_egress: false,
            audit_trail: true,
            require_signed_context: false,
            sign_exports: false,
            force_signed_exports: false,
        }
    }
}

impl PolicyDocument {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no policy file, using defaults");
            return Ok(PolicyDocument::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::InputInvalid(format!("unreadable policy document: {e}")))
    }

    /// Persist with write-temp-then-rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn allow_command(&mut self, command: impl Into<String>) {
        self.allowed_commands.insert(command.into());
    }

    pub fn allow_glob(&mut self, glob: impl Into<String>) {
        let glob = glob.into();
        if !self.allowed_globs.contains(&glob) {
            self.allowed_globs.push(glob);
        }
    }
}

/// Severity of a doctor finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingLevel {
    Error,
    Warning,
    Info,
}

/// One doctor finding.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub level: FindingLevel,
    pub message: String,
}

/// Validate a policy file: unknown keys, glob syntax, degenerate
/// allow-lists. Returns findings rather than failing fast so the operator
/// sees everything at once.
pub fn doctor(path: &Path) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();

    if !path.exists() {
        findings.push(Finding {
            level: FindingLevel::Info,
            message: "no policy.json present; defaults apply".to_string(),
        });
        return Ok(findings);
    }

    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            findings.push(Finding {
                level: FindingLevel::Error,
                message: format!("policy.json is not valid JSON: {e}"),
            });
            return Ok(findings);
        }
    };

    const KNOWN_KEYS: &[&str] = &[
        "allowedCommands",
        "allowedGlobs",
        "envPassthrough",
        "networkEgress",
        "auditTrail",
        "requireSignedContext",
        "signExports",
        "forceSignedExports",
    ];
    if let Some(map) = value.as_object() {
        for key in map.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                findings.push(Finding {
                    level: FindingLevel::Warning,
                    message: format!("unknown policy key '{key}' is ignored"),
                });
            }
        }
    }

    match serde_json::from_value::<PolicyDocument>(value) {
        Ok(policy) => {
            if policy.allowed_commands.is_empty() {
                findings.push(Finding {
                    level: FindingLevel::Error,
                    message: "allowedCommands is empty; every command will be denied".to_string(),
                });
            }
            if policy.allowed_globs.is_empty() {
                findings.push(Finding {
                    level: FindingLevel::Error,
                    message: "allowedGlobs is empty; every path will be denied".to_string(),
                });
            }
            for glob in &policy.allowed_globs {
                if globset::Glob::new(glob).is_err() {
                    findings.push(Finding {
                        level: FindingLevel::Error,
                        message: format!("invalid glob '{glob}'"),
                    });
                }
            }
            if policy.network_egress {
                findings.push(Finding {
                    level: FindingLevel::Warning,
                    message: "networkEgress is enabled; offline proofs will fail".to_string(),
                });
            }
        }
        Err(e) => findings.push(Finding {
            level: FindingLevel::Error,
            message: format!("policy.json does not match the schema: {e}"),
        }),
    }

    Ok(findings)
}
