//! Daily rotation of the exporter's backing file.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::SqliteExporter;

/// The next 00:00 UTC strictly after `now`.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

/// Sleep to the next UTC midnight, rotate, repeat. Recomputing the target
/// each round keeps the rotation aligned to the calendar rather than to a
/// fixed 24 h stride.
pub async fn run_daily_rotation(exporter: Arc<SqliteExporter>, cancel: CancellationToken) {
    loop {
        let now = Utc::now();
        let wait = (next_utc_midnight(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                info!("rotating exporter database for the new UTC day");
                if let Err(e) = exporter.init_daily() {
                    error!(error = %e, "daily exporter rotation failed");
                }
            }
        }
    }
}
