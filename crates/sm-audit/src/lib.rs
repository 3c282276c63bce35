//! The audit plane: receipts, journal, replay.
//!
//! Every side-effecting command produces exactly one [`Receipt`] (an
//! immutable JSON file, fsynced before anything references it) and one
//! [`journal`] line pointing at it. [`replay`] selects journal entries
//! for re-execution; actual re-execution happens in the CLI, dry-run by
//! default.

pub mod journal;
pub mod receipt;
pub mod replay;

pub use journal::{Journal, JournalEntry};
pub use receipt::{Receipt, ReceiptDigests, RECEIPT_SCHEMA};
pub use replay::{batch_digest, select_entries, ReplaySelector, NON_REPLAYABLE};
