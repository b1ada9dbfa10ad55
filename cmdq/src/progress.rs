//! Incremental output accounting for running jobs.
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::job::Progress;

/// Counts the output of one running job.
///
/// Shared between the job's stdout and stderr pumps, which fold chunks in, and the scheduler,
/// which takes report snapshots.
#[derive(Debug, Default)]
pub struct OutputMeter {
    state: Mutex<MeterSnapshot>,
}

/// A point in time view of an [`OutputMeter`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct MeterSnapshot {
    pub total_bytes: u64,
    pub total_lines: u64,
    pub delta_bytes: u64,
    pub delta_lines: u64,
    pub last_output_at: Option<DateTime<Utc>>,
}

impl OutputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, chunk: &[u8]) {
        self.record_at(chunk, Utc::now());
    }

    pub(crate) fn record_at(&self, chunk: &[u8], now: DateTime<Utc>) {
        if chunk.is_empty() {
            return;
        }
        let bytes = chunk.len() as u64;
        let lines = chunk.iter().filter(|&&b| b == b'\n').count() as u64;
        let mut state = self.lock();
        state.total_bytes += bytes;
        state.total_lines += lines;
        state.delta_bytes += bytes;
        state.delta_lines += lines;
        state.last_output_at = Some(now);
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        *self.lock()
    }

    /// Returns the current counters and zeroes the deltas in the same step.
    ///
    /// Output recorded after this call is attributed to the next report.
    pub fn take_report(&self) -> MeterSnapshot {
        let mut state = self.lock();
        let snapshot = *state;
        state.delta_bytes = 0;
        state.delta_lines = 0;
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, MeterSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MeterSnapshot {
    /// Copies the cumulative counters into a job's progress.
    pub fn apply_totals(&self, progress: &mut Progress) {
        progress.total_bytes = self.total_bytes;
        progress.total_lines = self.total_lines;
        progress.last_output_at = self.last_output_at;
    }

    /// Copies everything, deltas included.
    pub fn apply(&self, progress: &mut Progress) {
        self.apply_totals(progress);
        progress.delta_bytes_since_report = self.delta_bytes;
        progress.delta_lines_since_report = self.delta_lines;
    }
}

/// Records that a periodic report went out: deltas back to zero, one more report sent.
pub fn mark_reported(progress: &mut Progress, snapshot: &MeterSnapshot, now: DateTime<Utc>) {
    snapshot.apply_totals(progress);
    progress.delta_bytes_since_report = 0;
    progress.delta_lines_since_report = 0;
    progress.reports_sent += 1;
    progress.last_report_at = Some(now);
}

/// Whether a report is due, measured from the last report or from the start of the job.
pub fn report_due(progress: &Progress, interval: Duration, now: DateTime<Utc>) -> bool {
    match progress.last_report_at {
        None => true,
        Some(last) => (now - last)
            .to_std()
            .map(|since| since >= interval)
            .unwrap_or(false),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{millis}ms");
    }
    let secs = duration.as_secs();
    if secs < 60 {
        return format!("{:.1}s", duration.as_secs_f64());
    }
    if secs < 3600 {
        return format!("{}m{:02}s", secs / 60, secs % 60);
    }
    format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
}

pub(crate) fn format_delta(delta: chrono::TimeDelta) -> String {
    format_duration(delta.to_std().unwrap_or_default())
}
