//! Replay selection over the journal.
//!
//! Selection and digesting live here; re-execution is the CLI's job and
//! defaults to dry-run. `journal` and `replay` never replay themselves.

use sha2::{Digest, Sha256};

use crate::journal::JournalEntry;

/// Commands excluded from replay.
pub const NON_REPLAYABLE: &[&str] = &["journal", "replay"];

/// Which journal entries to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaySelector {
    /// The most recent replayable entry.
    Last,
    /// The entry whose receipt id matches.
    Id(String),
    /// The last `n` replayable entries, oldest first.
    Range(usize),
}

/// Select replayable entries from the journal (oldest first).
pub fn select_entries(entries: &[JournalEntry], selector: &ReplaySelector) -> Vec<JournalEntry> {
    let replayable: Vec<&JournalEntry> = entries
        .iter()
        .filter(|e| !NON_REPLAYABLE.contains(&e.cmd.as_str()))
        .collect();

    match selector {
        ReplaySelector::Last => replayable.last().map(|e| vec![(*e).clone()]).unwrap_or_default(),
        ReplaySelector::Id(id) => replayable
            .iter()
            .filter(|e| e.receipt_id() == Some(id.as_str()))
            .map(|e| (*e).clone())
            .collect(),
        ReplaySelector::Range(n) => {
            let skip = replayable.len().saturating_sub(*n);
            replayable[skip..].iter().map(|e| (*e).clone()).collect()
        }
    }
}

/// SHA-256 digest of the replayed receipt-id batch, recorded in the
/// replay receipt.
pub fn batch_digest(receipt_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in receipt_ids {
        hasher.update(id.as_bytes());
        hasher.update([0x0a]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cmd: &str, receipt: &str) -> JournalEntry {
        JournalEntry::ok(cmd, serde_json::json!({}), receipt)
    }

    fn journal() -> Vec<JournalEntry> {
        vec![
            entry("remember", "r/a.json"),
            entry("journal", "r/b.json"),
            entry("index-code", "r/c.json"),
            entry("replay", "r/d.json"),
            entry("gc", "r/e.json"),
        ]
    }

    #[test]
    fn test_last_skips_non_replayable() {
        let selected = select_entries(&journal(), &ReplaySelector::Last);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].cmd, "gc");
    }

    #[test]
    fn test_range_takes_trailing_replayable() {
        let selected = select_entries(&journal(), &ReplaySelector::Range(2));
        let cmds: Vec<&str> = selected.iter().map(|e| e.cmd.as_str()).collect();
        assert_eq!(cmds, vec!["index-code", "gc"]);
    }

    #[test]
    fn test_range_larger_than_journal() {
        let selected = select_entries(&journal(), &ReplaySelector::Range(99));
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_id_selector() {
        let selected = select_entries(&journal(), &ReplaySelector::Id("c".to_string()));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].cmd, "index-code");

        assert!(select_entries(&journal(), &ReplaySelector::Id("b".to_string())).is_empty());
    }

    #[test]
    fn test_batch_digest_is_order_sensitive() {
        let a = batch_digest(&["one".into(), "two".into()]);
        let b = batch_digest(&["two".into(), "one".into()]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, batch_digest(&["one".into(), "two".into()]));
    }
}
