//! ID generation for receipts and runs.
//!
//! Receipt IDs are timestamped-random so that the receipts directory sorts
//! chronologically and IDs never collide across concurrent invocations.

use chrono::Utc;

/// Generate a receipt ID: `<yyyymmdd>-<hhmmss>-<4 random hex>`.
///
/// Example: `20260801-143022-a7f3`.
pub fn generate_receipt_id() -> String {
    let ts = Utc::now().format("%Y%m%d-%H%M%S");
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", ts, &rand[..4])
}

/// Generate a unique run ID for this invocation.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // Shorten to first 12 hex chars for readability
    format!("run-{}", &uuid.simple().to_string()[..12])
}
