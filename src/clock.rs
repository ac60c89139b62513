use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Source of "now" for heartbeat comparisons.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

impl<T: Clock + ?Sized> Clock for Box<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// The node's own wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reads time off the shared storage: touches a probe file next to the
/// record and takes its modification time. On a network filesystem that is
/// the server's clock, which both nodes agree on even when theirs drift.
#[derive(Debug, Clone)]
pub struct StorageClock {
    probe: PathBuf,
}

impl StorageClock {
    /// Probe file placed beside `record_path`.
    pub fn beside(record_path: &Path) -> Self {
        let mut name = record_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".clock");
        Self {
            probe: record_path.with_file_name(name),
        }
    }

    pub fn probe_path(&self) -> &Path {
        &self.probe
    }

    fn read(&self) -> std::io::Result<DateTime<Utc>> {
        fs::write(&self.probe, std::process::id().to_string())?;
        let modified = fs::metadata(&self.probe)?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

impl Clock for StorageClock {
    fn now(&self) -> DateTime<Utc> {
        self.read().unwrap_or_else(|e| {
            tracing::warn!(
                probe = %self.probe.display(),
                "storage clock unavailable, using system clock: {e}"
            );
            Utc::now()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_clock_tracks_probe_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let clock = StorageClock::beside(&dir.path().join("state.json"));
        assert!(clock.probe_path().ends_with("state.json.clock"));

        let before = Utc::now() - chrono::Duration::seconds(5);
        let now = clock.now();
        assert!(clock.probe_path().exists());
        assert!(now >= before && now <= Utc::now() + chrono::Duration::seconds(5));
    }

    #[test]
    fn storage_clock_falls_back_when_probe_fails() {
        let dir = tempfile::tempdir().unwrap();
        let clock = StorageClock::beside(&dir.path().join("missing/dir/state.json"));
        let now = clock.now();
        assert!((Utc::now() - now).num_seconds().abs() < 5);
    }
}
