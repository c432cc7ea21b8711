//! Append-only result sink: record types, the SQLite exporter and the
//! daily rotation task.

pub mod rotate;
pub mod sqlite;

use chrono::{DateTime, Utc};

pub use rotate::run_daily_rotation;
pub use sqlite::SqliteExporter;

/// One fast-cadence tick for one SCION destination: the best observed RTT
/// across the selected path subset.
#[derive(Debug, Clone)]
pub struct PingResult {
    pub src: String,
    pub dst: String,
    pub success: bool,
    pub rtt_ms: f64,
    /// Fingerprint of the path that achieved the RTT; empty when no probe
    /// succeeded.
    pub fingerprint: String,
    pub ping_time: DateTime<Utc>,
    pub successful_pings: usize,
    pub max_pings: usize,
}

/// One raw-ICMP ping attempt against a plain IP destination.
#[derive(Debug, Clone)]
pub struct IpPingResult {
    pub src: String,
    pub dst: String,
    pub success: bool,
    pub rtt_ms: f64,
    pub ping_time: DateTime<Utc>,
}

/// One slow-sweep summary for one SCION destination.
#[derive(Debug, Clone)]
pub struct PathStatistics {
    pub src: String,
    pub dst: String,
    /// Interface sequences of all probed paths, comma separated.
    pub paths: String,
    /// Fingerprints of all probed paths, comma separated.
    pub fingerprints: String,
    pub success: bool,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub min_hops: usize,
    pub max_hops: usize,
    pub lookup_time: DateTime<Utc>,
    pub active_paths: usize,
    pub probed_paths: usize,
    pub available_paths: usize,
}
