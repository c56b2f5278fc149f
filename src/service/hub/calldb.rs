//! Per-URI call history used for admission control.
//!
//! The store is a single JSON document shared by every hub on the host. Each operation takes
//! an exclusive `flock` on `<path>.lock` for its whole read-modify-write and replaces the
//! document through `<path>.tmp` + rename, so a crash never leaves a half-written file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::config::HubConfig;
use crate::shared::error::CallDbError;
use crate::shared::utils::unix_now;

/// `(start, end, length)` in seconds since the epoch; `end == length == 0` while in progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallRow(pub f64, pub f64, pub f64);

impl CallRow {
    pub fn start(&self) -> f64 {
        self.0
    }

    pub fn length(&self) -> f64 {
        self.2
    }

    pub fn in_progress(&self) -> bool {
        self.1 == 0.0 && self.2 == 0.0
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    calls: BTreeMap<String, Vec<CallRow>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UriStats {
    pub total_calls: u32,
    pub total_time: Duration,
    pub period_calls: u32,
    pub period_time: Duration,
    pub period_short_calls: u32,
}

impl UriStats {
    /// The multi-line block written to the log around admission decisions.
    pub fn report(&self, title: &str, verdict: Option<&str>) -> String {
        let rule = "=".repeat(120);
        let thin = "-".repeat(120);
        let mut lines = vec![
            String::new(),
            rule.clone(),
            title.to_string(),
            thin.clone(),
            format!("Total calls:                  {}", self.total_calls),
            format!("Total time (min):             {:.1}", minutes(self.total_time)),
            format!("Last period short calls:      {}", self.period_short_calls),
            format!("Last period total calls:      {}", self.period_calls),
            format!("Last period total time (min): {:.1}", minutes(self.period_time)),
        ];
        if let Some(verdict) = verdict {
            lines.push(thin);
            lines.push(verdict.to_string());
        }
        lines.push(rule);
        lines.push(String::new());
        lines.join("\n")
    }
}

fn minutes(d: Duration) -> f64 {
    d.as_secs_f64() / 60.0
}

#[derive(Debug, Clone)]
pub struct CallDb {
    path: PathBuf,
    period: Duration,
    short_threshold: Duration,
}

impl CallDb {
    pub fn new(cfg: &HubConfig) -> Self {
        Self {
            path: cfg.call_db.clone(),
            period: cfg.period,
            short_threshold: cfg.short_call_threshold,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_uri_stats(&self, remote_uri: &str) -> Result<UriStats, CallDbError> {
        self.uri_stats_at(remote_uri, unix_now())
    }

    /// Statistics over completed calls; a call counts for the period iff `now - start < period`.
    pub fn uri_stats_at(&self, remote_uri: &str, now: f64) -> Result<UriStats, CallDbError> {
        let _lock = FileLock::acquire(&self.path)?;
        let snapshot = self.load()?;
        Ok(self.stats(snapshot.calls.get(remote_uri).map(Vec::as_slice), now))
    }

    fn stats(&self, rows: Option<&[CallRow]>, now: f64) -> UriStats {
        let mut stats = UriStats::default();
        let period = self.period.as_secs_f64();
        let short = self.short_threshold.as_secs_f64();
        let mut total = 0.0;
        let mut in_period = 0.0;
        for row in rows.unwrap_or_default().iter().filter(|r| r.length() > 0.0) {
            stats.total_calls += 1;
            total += row.length();
            if now - row.start() < period {
                stats.period_calls += 1;
                in_period += row.length();
                if row.length() < short {
                    stats.period_short_calls += 1;
                }
            }
        }
        stats.total_time = saturating_secs(total);
        stats.period_time = saturating_secs(in_period);
        stats
    }

    pub fn track_confirmed_call(&self, remote_uri: &str) -> Result<(), CallDbError> {
        self.track_confirmed_call_at(remote_uri, unix_now())
    }

    pub fn track_confirmed_call_at(&self, remote_uri: &str, now: f64) -> Result<(), CallDbError> {
        self.update(|snapshot| {
            snapshot
                .calls
                .entry(remote_uri.to_string())
                .or_default()
                .push(CallRow(now, 0.0, 0.0));
        })
    }

    pub fn track_disconnected_call(&self, remote_uri: &str) -> Result<(), CallDbError> {
        self.track_disconnected_call_at(remote_uri, unix_now())
    }

    /// Completes the URI's last row if it is still in progress; anything else is left alone.
    pub fn track_disconnected_call_at(
        &self,
        remote_uri: &str,
        now: f64,
    ) -> Result<(), CallDbError> {
        self.update(|snapshot| {
            let last = snapshot
                .calls
                .get_mut(remote_uri)
                .and_then(|rows| rows.last_mut());
            match last {
                Some(row) if row.in_progress() => *row = CallRow(row.0, now, now - row.0),
                _ => log::debug!("[calldb] no call in progress for {}", remote_uri),
            }
        })
    }

    /// Writes the statistics block of every known URI to the log.
    pub fn log_all(&self) -> Result<(), CallDbError> {
        let now = unix_now();
        let snapshot = {
            let _lock = FileLock::acquire(&self.path)?;
            self.load()?
        };
        log::info!(
            "[calldb] {} known URIs in {}",
            snapshot.calls.len(),
            self.path.display()
        );
        for (uri, rows) in &snapshot.calls {
            let stats = self.stats(Some(rows), now);
            log::info!(
                "{}",
                stats.report(&format!("Remote SIP URI: {}", uri), None)
            );
        }
        Ok(())
    }

    fn update(&self, mutate: impl FnOnce(&mut Snapshot)) -> Result<(), CallDbError> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut snapshot = self.load()?;
        mutate(&mut snapshot);
        self.store(&snapshot)
    }

    fn load(&self) -> Result<Snapshot, CallDbError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(e) => return Err(io_error(&self.path, e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                log::warn!(
                    "[calldb] {} is unreadable, starting empty: {}",
                    self.path.display(),
                    e
                );
                Ok(Snapshot::default())
            }
        }
    }

    fn store(&self, snapshot: &Snapshot) -> Result<(), CallDbError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = sibling(&self.path, "tmp");
        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Rows are hand-editable, so sums may be huge or not finite.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn io_error(path: &Path, source: io::Error) -> CallDbError {
    CallDbError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Exclusive advisory lock on `<path>.lock`, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(db_path: &Path) -> Result<Self, CallDbError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let path = sibling(db_path, "lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        lock_exclusive(&file).map_err(|source| CallDbError::Lock {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above; closing the file would release the lock anyway.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::test_support::test_config;

    fn db_in(dir: &tempfile::TempDir) -> CallDb {
        let mut cfg = test_config().hub;
        cfg.call_db = dir.path().join("db").join("call_db.json");
        CallDb::new(&cfg)
    }

    const DAY: f64 = 24.0 * 60.0 * 60.0;

    #[test]
    fn missing_file_has_no_history() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_in(&dir);
        assert_eq!(db.get_uri_stats("sip:1000@h").unwrap(), UriStats::default());
    }

    #[test]
    fn completed_calls_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_in(&dir);
        let uri = "sip:1000@h";
        let t0 = 1_000_000.0;
        db.track_confirmed_call_at(uri, t0).unwrap();
        db.track_disconnected_call_at(uri, t0 + 3.0).unwrap();
        db.track_confirmed_call_at(uri, t0 + 100.0).unwrap();
        db.track_disconnected_call_at(uri, t0 + 160.0).unwrap();
        // in progress, not counted
        db.track_confirmed_call_at(uri, t0 + 200.0).unwrap();

        let stats = db.uri_stats_at(uri, t0 + 300.0).unwrap();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_time, Duration::from_secs(63));
        assert_eq!(stats.period_calls, 2);
        assert_eq!(stats.period_short_calls, 1);

        assert!(dir.path().join("db/call_db.json.lock").exists());
        assert!(!dir.path().join("db/call_db.json.tmp").exists());
    }

    #[test]
    fn disconnect_completes_only_open_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_in(&dir);
        let uri = "sip:1000@h";
        db.track_disconnected_call_at(uri, 5.0).unwrap();
        db.track_confirmed_call_at(uri, 10.0).unwrap();
        db.track_disconnected_call_at(uri, 25.0).unwrap();
        db.track_disconnected_call_at(uri, 40.0).unwrap();

        let snapshot = db.load().unwrap();
        assert_eq!(snapshot.calls[uri], vec![CallRow(10.0, 25.0, 15.0)]);
    }

    #[test]
    fn period_boundary_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_in(&dir);
        let uri = "sip:old@h";
        db.track_confirmed_call_at(uri, 0.0 + 1.0).unwrap();
        db.track_disconnected_call_at(uri, 61.0).unwrap();

        let inside = db.uri_stats_at(uri, 1.0 + DAY - 0.5).unwrap();
        assert_eq!(inside.period_calls, 1);
        let edge = db.uri_stats_at(uri, 1.0 + DAY).unwrap();
        assert_eq!(edge.period_calls, 0);
        assert_eq!(edge.total_calls, 1);
    }

    #[test]
    fn corrupt_file_reads_empty_and_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_in(&dir);
        fs::create_dir_all(dir.path().join("db")).unwrap();
        fs::write(db.path(), b"{not json").unwrap();
        assert_eq!(db.get_uri_stats("sip:x@h").unwrap(), UriStats::default());

        db.track_confirmed_call_at("sip:x@h", 1.0).unwrap();
        let raw = fs::read_to_string(db.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["calls"]["sip:x@h"][0], serde_json::json!([1.0, 0.0, 0.0]));
    }

    #[test]
    fn absurd_lengths_saturate() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_in(&dir);
        fs::create_dir_all(dir.path().join("db")).unwrap();
        fs::write(
            db.path(),
            br#"{"calls": {"sip:x@h": [[1.0, 2.0, 1e300], [3.0, 4.0, 1e300]]}}"#,
        )
        .unwrap();

        let stats = db.uri_stats_at("sip:x@h", 10.0).unwrap();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_time, Duration::MAX);
        assert_eq!(stats.period_time, Duration::MAX);
        assert_eq!(saturating_secs(f64::NAN), Duration::ZERO);
        assert_eq!(saturating_secs(-1.0), Duration::ZERO);
    }

    #[test]
    fn report_lists_verdict() {
        let stats = UriStats {
            total_calls: 3,
            total_time: Duration::from_secs(90),
            ..UriStats::default()
        };
        let block = stats.report("Incoming call from :          sip:a@h", Some("CALL ACCEPTED"));
        assert!(block.contains("Total calls:                  3"));
        assert!(block.contains("Total time (min):             1.5"));
        assert!(block.trim_end().lines().rev().nth(1) == Some("CALL ACCEPTED"));
    }
}
