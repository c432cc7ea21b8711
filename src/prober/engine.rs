//! The probe orchestrator.
//!
//! Two interleaved cadences run over the same destinations: a slow full
//! sweep that refreshes the path table and probes a broad slice of it,
//! and a fast tick that probes only the selected best subset. All
//! per-destination work inside a tick runs in parallel, so one slow
//! destination never stalls the others, and every fast tick is supervised
//! by a wall-clock watchdog so a wedged send cannot freeze the cadence.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::{IpPingResult, PathStatistics, PingResult, SqliteExporter};
use crate::host::HostContext;
use crate::probe::echo::{EchoClient, ReplyState};
use crate::probe::ip::{self, IpPinger};
use crate::prober::select::select_optimal_paths;
use crate::prober::table::{Destination, PathState, PathStatus};
use crate::scion::addr::ScionAddr;
use crate::scion::path::Path;

/// Engine timing and sizing. The watchdog must exceed the probe deadline
/// with margin for scheduling.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
    pub probe_deadline: Duration,
    pub watchdog: Duration,
    /// Reply-classification timeout handed to each echo client.
    pub client_timeout: Duration,
    /// Upper bound on paths probed per destination per sweep.
    pub max_paths_to_probe: usize,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(1),
            probe_deadline: Duration::from_millis(700),
            watchdog: Duration::from_secs(2),
            client_timeout: Duration::from_secs(1),
            max_paths_to_probe: 100,
        }
    }
}

/// Deadline for one raw-ICMP attempt on the IP side.
const IP_PROBE_DEADLINE: Duration = Duration::from_secs(1);

pub struct PathProber {
    host: Arc<HostContext>,
    exporter: Arc<SqliteExporter>,
    config: ProberConfig,
    local: ScionAddr,
    destinations: HashMap<String, Arc<Destination>>,
    clients: HashMap<String, Arc<EchoClient>>,
    /// Destination key → best subset, refreshed after each sweep. The
    /// fast cadence clones the map under the lock and works on the copy.
    best: Mutex<HashMap<String, Vec<PathStatus>>>,
    cancel: CancellationToken,
}

impl PathProber {
    /// Open the exporter, look up paths and spin up one echo client per
    /// destination, then run the initial sweep and selection so the fast
    /// cadence has a non-empty set on its first tick.
    ///
    /// A failed path lookup or socket setup degrades that destination but
    /// never fails init; only the exporter open is fatal here.
    pub async fn init(
        host: Arc<HostContext>,
        exporter: Arc<SqliteExporter>,
        remotes: Vec<(ScionAddr, Option<String>)>,
        config: ProberConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, crate::error::InitError> {
        exporter
            .init_daily()
            .map_err(crate::error::InitError::ExporterOpen)?;

        let local = ScionAddr::new(host.local_ia(), host.local_ip());
        let mut destinations = HashMap::new();
        let mut clients = HashMap::new();

        for (remote, name) in remotes {
            let key = remote.to_string();
            let dest = Arc::new(Destination::new(remote, name));

            info!(
                dest = %key,
                name = dest.name.as_deref().unwrap_or(""),
                "querying paths"
            );
            match host.query_paths(remote.ia).await {
                Ok(paths) => {
                    info!(dest = %key, count = paths.len(), "found paths");
                    dest.upsert_paths(paths);
                }
                Err(e) => warn!(dest = %key, error = %e, "initial path lookup failed"),
            }

            match EchoClient::new(local, config.client_timeout, cancel.child_token()).await {
                Ok((client, port)) => {
                    debug!(dest = %key, port, "echo client ready");
                    clients.insert(key.clone(), client);
                }
                // The destination stays in the table so the failure is
                // visible, but its probes will no-op.
                Err(e) => error!(dest = %key, error = %e, "echo client setup failed"),
            }

            destinations.insert(key, dest);
        }

        let prober = Arc::new(Self {
            host,
            exporter,
            config,
            local,
            destinations,
            clients,
            best: Mutex::new(HashMap::new()),
            cancel,
        });

        info!("running initial full sweep");
        prober.sweep_all().await;
        prober.update_paths_to_ping();
        Ok(prober)
    }

    /// Slow cadence: full sweep then reselection, every `sweep_interval`.
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The initial sweep already ran during init.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_all().await;
                    self.update_paths_to_ping();
                }
            }
        }
    }

    /// Fast cadence: probe the best subsets every `ping_interval`. Each
    /// tick runs as its own task under the watchdog, so a tick that wedges
    /// is abandoned and the next one still starts on schedule.
    pub async fn run_fast_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let prober = self.clone();
                    tokio::spawn(async move {
                        let watchdog = prober.config.watchdog;
                        if tokio::time::timeout(watchdog, prober.ping_best_tick())
                            .await
                            .is_err()
                        {
                            warn!("fast probe tick exceeded its watchdog; abandoning it");
                        }
                    });
                }
            }
        }
    }

    /// Probe every destination's full path slice in parallel.
    pub async fn sweep_all(self: &Arc<Self>) {
        let mut tasks = JoinSet::new();
        for (key, dest) in &self.destinations {
            let prober = self.clone();
            let key = key.clone();
            let dest = dest.clone();
            tasks.spawn(async move { prober.sweep_destination(&key, &dest).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "sweep task failed");
            }
        }
    }

    async fn sweep_destination(&self, key: &str, dest: &Destination) {
        let lookup_time = Utc::now();

        // Refresh the table first so new paths enter the rotation and
        // existing ones get current dataplane handles.
        match self.host.query_paths(dest.remote.ia).await {
            Ok(paths) => dest.upsert_paths(paths),
            Err(e) => warn!(dest = %key, error = %e, "path lookup failed; probing stale table"),
        }

        let snapshot = dest.snapshot();
        if snapshot.is_empty() {
            info!(dest = %key, "no paths known; skipping sweep");
            return;
        }
        let Some(client) = self.clients.get(key) else {
            debug!(dest = %key, "no echo client; skipping sweep");
            return;
        };

        let mut probes = JoinSet::new();
        for status in snapshot.into_iter().take(self.config.max_paths_to_probe) {
            let client = client.clone();
            let remote = dest.remote;
            let deadline = self.config.probe_deadline;
            probes.spawn(async move {
                let (state, rtt_ms) = probe_path(&client, &remote, &status.path, deadline).await;
                (status, state, rtt_ms)
            });
        }

        let mut results: Vec<PathStatus> = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let Ok((status, state, rtt_ms)) = joined else {
                continue;
            };
            dest.record_outcome(&status.fingerprint, state, rtt_ms);
            results.push(PathStatus {
                state,
                path: status.path,
                fingerprint: status.fingerprint,
                last_rtt_ms: rtt_ms,
            });
        }
        if results.is_empty() {
            return;
        }

        let successes: Vec<&PathStatus> = results.iter().filter(|r| r.last_rtt_ms > 0.0).collect();
        let min_rtt_ms = fold_min(successes.iter().map(|r| r.last_rtt_ms));
        let max_rtt_ms = successes.iter().map(|r| r.last_rtt_ms).fold(0.0, f64::max);
        let min_hops = successes.iter().map(|r| r.path.hop_count()).min().unwrap_or(0);
        let max_hops = successes.iter().map(|r| r.path.hop_count()).max().unwrap_or(0);

        let row = PathStatistics {
            src: self.local.to_string(),
            dst: key.to_string(),
            paths: join_comma(results.iter().map(|r| r.path.interfaces_string())),
            fingerprints: join_comma(results.iter().map(|r| r.fingerprint.to_string())),
            success: !successes.is_empty(),
            min_rtt_ms,
            max_rtt_ms,
            min_hops,
            max_hops,
            lookup_time,
            active_paths: successes.len(),
            probed_paths: results.len(),
            available_paths: dest.available_paths(),
        };
        if let Err(e) = self.exporter.write_path_statistics(row) {
            error!(dest = %key, error = %e, "failed to write path statistics");
        }
    }

    /// Recompute every destination's best subset from the current table.
    /// Called after each sweep; the single lock write publishes the whole
    /// refresh at once.
    pub fn update_paths_to_ping(&self) {
        let mut fresh = HashMap::new();
        for (key, dest) in &self.destinations {
            let selected = select_optimal_paths(&dest.snapshot());
            debug!(dest = %key, selected = selected.len(), "best path subset updated");
            fresh.insert(key.clone(), selected);
        }
        *self.best.lock() = fresh;
    }

    /// One fast-cadence tick over a copy of the best-path set.
    async fn ping_best_tick(self: &Arc<Self>) {
        let best = self.best.lock().clone();
        let mut tasks = JoinSet::new();
        for (key, paths) in best {
            if paths.is_empty() {
                continue;
            }
            let prober = self.clone();
            tasks.spawn(async move { prober.ping_destination_best(&key, paths).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "best-path probe task failed");
            }
        }
    }

    async fn ping_destination_best(&self, key: &str, paths: Vec<PathStatus>) {
        let Some(client) = self.clients.get(key) else {
            return;
        };
        let Some(dest) = self.destinations.get(key) else {
            return;
        };

        let max_pings = paths.len();
        let mut probes = JoinSet::new();
        for status in paths {
            let client = client.clone();
            let remote = dest.remote;
            let deadline = self.config.probe_deadline;
            probes.spawn(async move {
                let (state, rtt_ms) = probe_path(&client, &remote, &status.path, deadline).await;
                (status.fingerprint, state, rtt_ms)
            });
        }

        let mut successful = 0usize;
        let mut best_rtt_ms = 0.0f64;
        let mut best_fingerprint = String::new();
        while let Some(joined) = probes.join_next().await {
            let Ok((fingerprint, _state, rtt_ms)) = joined else {
                continue;
            };
            if rtt_ms > 0.0 {
                successful += 1;
                if best_rtt_ms == 0.0 || rtt_ms < best_rtt_ms {
                    best_rtt_ms = rtt_ms;
                    best_fingerprint = fingerprint.to_string();
                }
            }
        }

        let row = PingResult {
            src: self.local.to_string(),
            dst: key.to_string(),
            success: successful > 0,
            rtt_ms: best_rtt_ms,
            fingerprint: best_fingerprint,
            ping_time: Utc::now(),
            successful_pings: successful,
            max_pings,
        };
        if let Err(e) = self.exporter.write_ping_result(row) {
            error!(dest = %key, error = %e, "failed to write ping result");
        }
    }
}

/// One probe over one path: send, then race the reply against the
/// deadline. A send failure counts as a probe failure, not an abort.
async fn probe_path(
    client: &EchoClient,
    remote: &ScionAddr,
    path: &Path,
    deadline: Duration,
) -> (PathState, f64) {
    let (tx, rx) = oneshot::channel();
    let sequence = match client.send(remote, Some(path), tx).await {
        Ok(sequence) => sequence,
        Err(e) => {
            warn!(dest = %remote, error = %e, "echo send failed");
            return (PathState::Timeout, 0.0);
        }
    };
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(update)) => match update.state {
            ReplyState::PathDown => (PathState::Down, 0.0),
            ReplyState::ScmpUnknown => (PathState::Unknown, 0.0),
            _ => (PathState::Probed, update.rtt.as_secs_f64() * 1000.0),
        },
        Ok(Err(_)) | Err(_) => {
            client.forget(sequence);
            (PathState::Timeout, 0.0)
        }
    }
}

/// Drive the IP side pinger: one probe per configured destination per
/// second, one row per attempt.
pub async fn run_ip_loop(
    pinger: Arc<IpPinger>,
    destinations: Vec<(IpAddr, String)>,
    exporter: Arc<SqliteExporter>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                for (addr, label) in &destinations {
                    let pinger = pinger.clone();
                    let exporter = exporter.clone();
                    let addr = *addr;
                    let label = label.clone();
                    tokio::spawn(async move {
                        let row = ping_ip_once(&pinger, addr, label).await;
                        if let Err(e) = exporter.write_ip_ping_result(row) {
                            error!(error = %e, "failed to write IP ping result");
                        }
                    });
                }
            }
        }
    }
}

async fn ping_ip_once(pinger: &IpPinger, addr: IpAddr, label: String) -> IpPingResult {
    let src = ip::local_source_for(addr)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let ping_time = Utc::now();

    let (tx, rx) = oneshot::channel();
    let sequence = match pinger.send(addr, tx) {
        Ok(sequence) => sequence,
        Err(e) => {
            warn!(dest = %label, error = %e, "ICMP send failed");
            return IpPingResult {
                src,
                dst: label,
                success: false,
                rtt_ms: 0.0,
                ping_time,
            };
        }
    };

    match tokio::time::timeout(IP_PROBE_DEADLINE, rx).await {
        Ok(Ok(update)) => IpPingResult {
            src,
            dst: label,
            success: true,
            rtt_ms: update.rtt.as_secs_f64() * 1000.0,
            ping_time,
        },
        Ok(Err(_)) | Err(_) => {
            pinger.forget(sequence);
            IpPingResult {
                src,
                dst: label,
                success: false,
                rtt_ms: 0.0,
                ping_time,
            }
        }
    }
}

fn fold_min(values: impl Iterator<Item = f64>) -> f64 {
    let mut min = f64::MAX;
    let mut any = false;
    for v in values {
        any = true;
        if v < min {
            min = v;
        }
    }
    if any {
        min
    } else {
        0.0
    }
}

fn join_comma(parts: impl Iterator<Item = String>) -> String {
    parts.collect::<Vec<_>>().join(",")
}
