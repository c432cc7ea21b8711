//! SQLite-backed exporter with per-table batch queues and daily rotation.
//!
//! Locking: each logical table has its own queue behind a mutex, and the
//! connection sits behind a separate lifecycle mutex so rotation can swap
//! the backing file atomically. Lock order is always queue, then
//! connection; no lock is ever held across anything that blocks on the
//! network.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use super::{IpPingResult, PathStatistics, PingResult};
use crate::error::ExporterWriteError;

pub struct SqliteExporter {
    base_path: PathBuf,
    batch_size: usize,
    conn: Mutex<Option<Connection>>,
    ping_queue: Mutex<Vec<PingResult>>,
    ip_queue: Mutex<Vec<IpPingResult>>,
    stats_queue: Mutex<Vec<PathStatistics>>,
}

impl SqliteExporter {
    pub fn new(base_path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            base_path: base_path.into(),
            batch_size: batch_size.max(1),
            conn: Mutex::new(None),
            ping_queue: Mutex::new(Vec::new()),
            ip_queue: Mutex::new(Vec::new()),
            stats_queue: Mutex::new(Vec::new()),
        }
    }

    /// Open (or switch to) the backing file for the current UTC day.
    /// Queued rows are flushed to the old file first, so every row lands
    /// in the file matching its tick's wall clock.
    pub fn init_daily(&self) -> Result<(), rusqlite::Error> {
        self.rotate_to(Utc::now().date_naive())
    }

    /// Switch the backing file to the one for `date`. Taking the target
    /// day as a parameter lets a rotation across the midnight boundary be
    /// driven deterministically; `init_daily` is this with the current
    /// UTC day.
    pub fn rotate_to(&self, date: NaiveDate) -> Result<(), rusqlite::Error> {
        let mut stats = self.stats_queue.lock();
        let mut pings = self.ping_queue.lock();
        let mut ips = self.ip_queue.lock();
        let mut conn = self.conn.lock();

        if let Some(old) = conn.as_ref() {
            flush_path_statistics(old, &mut stats)?;
            flush_ping_results(old, &mut pings)?;
            flush_ip_ping_results(old, &mut ips)?;
        }

        let path = daily_path(&self.base_path, date);
        info!(path = %path.display(), "connecting exporter database");
        let new_conn = Connection::open(&path)?;
        new_conn.execute_batch(concat!(
            "PRAGMA synchronous=OFF;",
            "CREATE TABLE IF NOT EXISTS ping_results (
                id INTEGER PRIMARY KEY,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                success INTEGER NOT NULL,
                rtt_ms REAL NOT NULL,
                fingerprint TEXT NOT NULL,
                ping_time TEXT NOT NULL,
                successful_pings INTEGER NOT NULL,
                max_pings INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS ip_ping_results (
                id INTEGER PRIMARY KEY,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                success INTEGER NOT NULL,
                rtt_ms REAL NOT NULL,
                ping_time TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS path_statistics (
                id INTEGER PRIMARY KEY,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                paths TEXT NOT NULL,
                fingerprints TEXT NOT NULL,
                success INTEGER NOT NULL,
                min_rtt_ms REAL NOT NULL,
                max_rtt_ms REAL NOT NULL,
                min_hops INTEGER NOT NULL,
                max_hops INTEGER NOT NULL,
                lookup_time TEXT NOT NULL,
                active_paths INTEGER NOT NULL,
                probed_paths INTEGER NOT NULL,
                available_paths INTEGER NOT NULL
            );",
        ))?;

        *conn = Some(new_conn);
        Ok(())
    }

    pub fn write_ping_result(&self, row: PingResult) -> Result<(), ExporterWriteError> {
        let mut queue = self.ping_queue.lock();
        queue.push(row);
        if queue.len() >= self.batch_size {
            let conn = self.conn.lock();
            if let Some(conn) = conn.as_ref() {
                flush_ping_results(conn, &mut queue)?;
            }
        }
        Ok(())
    }

    pub fn write_ip_ping_result(&self, row: IpPingResult) -> Result<(), ExporterWriteError> {
        let mut queue = self.ip_queue.lock();
        queue.push(row);
        if queue.len() >= self.batch_size {
            let conn = self.conn.lock();
            if let Some(conn) = conn.as_ref() {
                flush_ip_ping_results(conn, &mut queue)?;
            }
        }
        Ok(())
    }

    pub fn write_path_statistics(&self, row: PathStatistics) -> Result<(), ExporterWriteError> {
        let mut queue = self.stats_queue.lock();
        queue.push(row);
        if queue.len() >= self.batch_size {
            let conn = self.conn.lock();
            if let Some(conn) = conn.as_ref() {
                flush_path_statistics(conn, &mut queue)?;
            }
        }
        Ok(())
    }

    /// Flush everything still queued and drop the connection. Called once
    /// at shutdown.
    pub fn close(&self) -> Result<(), rusqlite::Error> {
        let mut stats = self.stats_queue.lock();
        let mut pings = self.ping_queue.lock();
        let mut ips = self.ip_queue.lock();
        let mut conn = self.conn.lock();
        if let Some(old) = conn.as_ref() {
            flush_path_statistics(old, &mut stats)?;
            flush_ping_results(old, &mut pings)?;
            flush_ip_ping_results(old, &mut ips)?;
        }
        *conn = None;
        Ok(())
    }

    /// The file currently backing the exporter, if one is open. Test
    /// support; production code never inspects it.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.conn.lock().as_ref().and_then(|c| c.path().map(PathBuf::from))
    }
}

/// `metrics.db` + 2025-01-14 → `metrics_2025-01-14.db`. Always derived
/// from the configured base path, never from a previously dated name.
pub fn daily_path(base: &Path, date: NaiveDate) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}_{}", date.format("%Y-%m-%d"));
    if let Some(ext) = base.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    base.with_file_name(name)
}

fn flush_ping_results(
    conn: &Connection,
    queue: &mut Vec<PingResult>,
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO ping_results
         (src, dst, success, rtt_ms, fingerprint, ping_time, successful_pings, max_pings)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for row in queue.drain(..) {
        stmt.execute(params![
            row.src,
            row.dst,
            row.success,
            row.rtt_ms,
            row.fingerprint,
            row.ping_time.to_rfc3339(),
            row.successful_pings as i64,
            row.max_pings as i64,
        ])?;
    }
    Ok(())
}

fn flush_ip_ping_results(
    conn: &Connection,
    queue: &mut Vec<IpPingResult>,
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO ip_ping_results (src, dst, success, rtt_ms, ping_time)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for row in queue.drain(..) {
        stmt.execute(params![
            row.src,
            row.dst,
            row.success,
            row.rtt_ms,
            row.ping_time.to_rfc3339(),
        ])?;
    }
    Ok(())
}

fn flush_path_statistics(
    conn: &Connection,
    queue: &mut Vec<PathStatistics>,
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO path_statistics
         (src, dst, paths, fingerprints, success, min_rtt_ms, max_rtt_ms,
          min_hops, max_hops, lookup_time, active_paths, probed_paths, available_paths)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?;
    for row in queue.drain(..) {
        stmt.execute(params![
            row.src,
            row.dst,
            row.paths,
            row.fingerprints,
            row.success,
            row.min_rtt_ms,
            row.max_rtt_ms,
            row.min_hops as i64,
            row.max_hops as i64,
            row.lookup_time.to_rfc3339(),
            row.active_paths as i64,
            row.probed_paths as i64,
            row.available_paths as i64,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ping_row(dst: &str) -> PingResult {
        PingResult {
            src: "64-2:0:9,192.0.2.1".into(),
            dst: dst.into(),
            success: true,
            rtt_ms: 20.5,
            fingerprint: "ab".repeat(32),
            ping_time: Utc.with_ymd_and_hms(2025, 1, 14, 12, 0, 0).unwrap(),
            successful_pings: 2,
            max_pings: 3,
        }
    }

    #[test]
    fn daily_path_appends_date_before_extension() {
        let base = Path::new("/tmp/pingmetrics.db");
        let date = NaiveDate::from_ymd_opt(2025, 1, 14).unwrap();
        assert_eq!(
            daily_path(base, date),
            PathBuf::from("/tmp/pingmetrics_2025-01-14.db")
        );
    }

    #[test]
    fn daily_path_is_stable_across_rotations() {
        // Deriving from the base path must not accumulate suffixes.
        let base = Path::new("pingmetrics.db");
        let first = daily_path(base, NaiveDate::from_ymd_opt(2025, 1, 14).unwrap());
        let second = daily_path(base, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        assert_eq!(first, PathBuf::from("pingmetrics_2025-01-14.db"));
        assert_eq!(second, PathBuf::from("pingmetrics_2025-01-15.db"));
    }

    #[test]
    fn writes_and_reads_back_a_ping_result() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = SqliteExporter::new(dir.path().join("test.db"), 1);
        exporter.init_daily().unwrap();

        exporter.write_ping_result(ping_row("71-559,192.0.2.7")).unwrap();

        let conn = Connection::open(exporter.current_path().unwrap()).unwrap();
        let (dst, rtt_ms, successful): (String, f64, i64) = conn
            .query_row(
                "SELECT dst, rtt_ms, successful_pings FROM ping_results",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(dst, "71-559,192.0.2.7");
        assert_eq!(rtt_ms, 20.5);
        assert_eq!(successful, 2);
    }

    #[test]
    fn batching_defers_until_the_batch_fills() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = SqliteExporter::new(dir.path().join("test.db"), 3);
        exporter.init_daily().unwrap();
        let db = exporter.current_path().unwrap();

        let count = || -> i64 {
            Connection::open(&db)
                .unwrap()
                .query_row("SELECT COUNT(*) FROM ping_results", [], |r| r.get(0))
                .unwrap()
        };

        exporter.write_ping_result(ping_row("a")).unwrap();
        exporter.write_ping_result(ping_row("b")).unwrap();
        assert_eq!(count(), 0);

        exporter.write_ping_result(ping_row("c")).unwrap();
        assert_eq!(count(), 3);
    }

    #[test]
    fn close_flushes_the_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = SqliteExporter::new(dir.path().join("test.db"), 100);
        exporter.init_daily().unwrap();
        let db = exporter.current_path().unwrap();

        exporter.write_ping_result(ping_row("a")).unwrap();
        exporter
            .write_ip_ping_result(IpPingResult {
                src: "192.0.2.1".into(),
                dst: "198.51.100.9".into(),
                success: false,
                rtt_ms: 0.0,
                ping_time: Utc::now(),
            })
            .unwrap();
        exporter.close().unwrap();

        let conn = Connection::open(&db).unwrap();
        let pings: i64 = conn
            .query_row("SELECT COUNT(*) FROM ping_results", [], |r| r.get(0))
            .unwrap();
        let ips: i64 = conn
            .query_row("SELECT COUNT(*) FROM ip_ping_results", [], |r| r.get(0))
            .unwrap();
        assert_eq!((pings, ips), (1, 1));
    }

    #[test]
    fn path_statistics_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = SqliteExporter::new(dir.path().join("test.db"), 1);
        exporter.init_daily().unwrap();

        exporter
            .write_path_statistics(PathStatistics {
                src: "64-2:0:9,192.0.2.1".into(),
                dst: "71-559,192.0.2.7".into(),
                paths: "64-2:0:9#3 71-559#12".into(),
                fingerprints: "aa,bb".into(),
                success: true,
                min_rtt_ms: 10.2,
                max_rtt_ms: 50.8,
                min_hops: 2,
                max_hops: 4,
                lookup_time: Utc::now(),
                active_paths: 3,
                probed_paths: 5,
                available_paths: 9,
            })
            .unwrap();

        let conn = Connection::open(exporter.current_path().unwrap()).unwrap();
        let (active, probed, available): (i64, i64, i64) = conn
            .query_row(
                "SELECT active_paths, probed_paths, available_paths FROM path_statistics",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((active, probed, available), (3, 5, 9));
    }
}
