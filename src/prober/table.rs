//! Per-destination path state table.

use parking_lot::Mutex;

use crate::scion::addr::ScionAddr;
use crate::scion::path::{Fingerprint, Path};

/// Probe-derived state of one path. The selector treats `Down` and
/// `Timeout` as inactive; `Unknown` stays in the pool deliberately (an
/// unclassified SCMP error says nothing about the forward path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// Known to exist, never probed.
    Idle,
    /// Probed successfully; `last_rtt_ms` is valid.
    Probed,
    /// The last probe hit its deadline.
    Timeout,
    /// A router reported the path down.
    Down,
    /// The last probe drew an unclassified SCMP error.
    Unknown,
}

/// One row of the path table.
#[derive(Debug, Clone)]
pub struct PathStatus {
    pub state: PathState,
    pub path: Path,
    pub fingerprint: Fingerprint,
    /// Strictly positive exactly when `state` is `Probed`.
    pub last_rtt_ms: f64,
}

/// A probe destination and everything learned about its paths. Created
/// once from configuration; only the path list mutates afterwards.
pub struct Destination {
    pub remote: ScionAddr,
    pub name: Option<String>,
    paths: Mutex<Vec<PathStatus>>,
}

impl Destination {
    pub fn new(remote: ScionAddr, name: Option<String>) -> Self {
        Self {
            remote,
            name,
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Merge a fresh path lookup into the table. Paths are keyed by
    /// fingerprint: a known fingerprint only refreshes the dataplane
    /// handle (state and RTT survive), a new one is appended as `Idle`.
    /// Paths that disappeared from the lookup are retained; they age out
    /// through probing instead.
    pub fn upsert_paths(&self, fresh: Vec<Path>) {
        let mut entries = self.paths.lock();
        for path in fresh {
            let fingerprint = Fingerprint::of(&path);
            match entries.iter_mut().find(|e| e.fingerprint == fingerprint) {
                Some(entry) => entry.path = path,
                None => entries.push(PathStatus {
                    state: PathState::Idle,
                    path,
                    fingerprint,
                    last_rtt_ms: 0.0,
                }),
            }
        }
    }

    /// Write a probe outcome back into the table.
    pub fn record_outcome(&self, fingerprint: &Fingerprint, state: PathState, rtt_ms: f64) {
        let mut entries = self.paths.lock();
        if let Some(entry) = entries.iter_mut().find(|e| &e.fingerprint == fingerprint) {
            entry.state = state;
            entry.last_rtt_ms = if state == PathState::Probed { rtt_ms } else { 0.0 };
        }
    }

    /// Copy of the table, taken under the lock so probing never holds it.
    pub fn snapshot(&self) -> Vec<PathStatus> {
        self.paths.lock().clone()
    }

    pub fn available_paths(&self) -> usize {
        self.paths.lock().len()
    }
}
