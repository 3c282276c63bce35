//! The four policy gates.
//!
//! Denials map to exit code 2 (command/path), 3 (signature), and are
//! always surfaced as `PolicyDenied`/`SignatureRequired` errors with the
//! offending subject in the message.

use globset::{Glob, GlobMatcher};
use tracing::debug;

use sm_common::{Error, Result};

use crate::document::{PolicyDocument, ALWAYS_ALLOWED};

impl PolicyDocument {
    /// Gate 1: the command allow-list. Help/version are always allowed.
    pub fn check_command(&self, command: &str) -> Result<()> {
        if ALWAYS_ALLOWED.contains(&command) || self.allowed_commands.contains(command) {
            return Ok(());
        }
        Err(Error::PolicyDenied(format!(
            "command '{command}' is not in allowedCommands"
        )))
    }

    /// Gate 2: every filesystem path the command reads or writes must
    /// match some allowed glob.
    ///
    /// Globs support `*` and `**`. A glob without `**` also matches
    /// against the path's final segment, so `*.json` admits any JSON file
    /// at any depth.
    pub fn check_path(&self, path: &str) -> Result<()> {
        let normalized = path.replace('\\', "/");
        for glob in &self.allowed_globs {
            if glob_matches(glob, &normalized) {
                debug!(path = %normalized, glob = %glob, "path allowed");
                return Ok(());
            }
        }
        Err(Error::PolicyDenied(format!(
            "path '{normalized}' matches no glob in allowedGlobs"
        )))
    }

    /// Gate 3: environment passthrough.
    pub fn is_env_allowed(&self, name: &str) -> bool {
        self.env_passthrough.contains(name)
    }

    /// Env var names visible under this policy, from an arbitrary list.
    pub fn filter_env<'a>(&self, names: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
        names.filter(|n| self.is_env_allowed(n)).collect()
    }
}

fn glob_matches(glob: &str, path: &str) -> bool {
    let Ok(compiled) = Glob::new(glob) else {
        return false;
    };
    let matcher: GlobMatcher = compiled.compile_matcher();
    if matcher.is_match(path) {
        return true;
    }
    // Segment semantics for globs without `**`.
    if !glob.contains("**") {
        if let Some(name) = path.rsplit('/').next() {
            return matcher.is_match(name);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_gate() {
        let policy = PolicyDocument::default();
        assert!(policy.check_command("remember").is_ok());
        assert!(policy.check_command("--help").is_ok());
        assert!(policy.check_command("version").is_ok());

        let err = policy.check_command("rm-rf-everything").unwrap_err();
        assert_eq!(err.kind(), sm_common::ErrorKind::PolicyDenied);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_path_gate_with_doublestar() {
        let mut policy = PolicyDocument::default();
        policy.allowed_globs = vec!["src/**".into()];
        assert!(policy.check_path("src/deep/nested/file.rs").is_ok());
        assert!(policy.check_path("other/file.rs").is_err());
    }

    #[test]
    fn test_path_gate_segment_semantics_without_doublestar() {
        let mut policy = PolicyDocument::default();
        policy.allowed_globs = vec!["*.json".into()];
        // No `**`: the glob also applies to the basename at any depth.
        assert!(policy.check_path("deep/nested/config.json").is_ok());
        assert!(policy.check_path("deep/nested/config.yaml").is_err());
    }

    #[test]
    fn test_path_gate_normalizes_backslashes() {
        let mut policy = PolicyDocument::default();
        policy.allowed_globs = vec!["src/**".into()];
        assert!(policy.check_path("src\\lib.rs").is_ok());
    }

    #[test]
    fn test_env_gate() {
        let policy = PolicyDocument::default();
        assert!(policy.is_env_allowed("PATH"));
        assert!(!policy.is_env_allowed("AWS_SECRET_ACCESS_KEY"));
        let visible = policy.filter_env(["PATH", "HOME", "EDITOR"].into_iter());
        assert_eq!(visible, vec!["PATH"]);
    }
}
