//! Raw event texts for the notifier.
use chrono::{DateTime, Utc};

use crate::{
    job::Job,
    progress::{format_bytes, format_delta, format_duration, MeterSnapshot},
};

pub fn started(job: &Job, timeout_ms: u64) -> String {
    let workdir = job
        .workdir
        .as_ref()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "(default)".to_owned());
    format!(
        "Job {} started\ncommand: {}\nworkdir: {}\ntimeout: {}",
        job.id,
        job.command,
        workdir,
        format_duration(std::time::Duration::from_millis(timeout_ms))
    )
}

/// A periodic report. `report` holds the deltas being reported.
pub fn progress(job: &Job, report: &MeterSnapshot, now: DateTime<Utc>, tail: &str) -> String {
    let last_output = match report.last_output_at {
        Some(at) => format!("{} ago", format_delta(now - at)),
        None => "no output yet".to_owned(),
    };
    let mut text = format!(
        "Job {} still running ({})\nsince last report: +{} lines, +{}\ntotal: {} lines, {}\nlast output: {}",
        job.id,
        format_delta(job.elapsed()),
        report.delta_lines,
        format_bytes(report.delta_bytes),
        report.total_lines,
        format_bytes(report.total_bytes),
        last_output,
    );
    let tail = tail.trim_end();
    if !tail.is_empty() {
        text.push_str("\n--- recent output ---\n");
        text.push_str(tail);
    }
    text
}

pub fn completion(job: &Job, preview: &str) -> String {
    let exit_code = job
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "none".to_owned());
    let mut text = format!(
        "Job {} {}\ncommand: {}\nexit code: {}",
        job.id, job.status, job.command, exit_code
    );
    if let Some(error) = &job.error {
        text.push_str(&format!("\nerror: {error}"));
    }
    text.push_str(&format!("\nelapsed: {}", format_delta(job.elapsed())));
    let preview = preview.trim_end();
    if !preview.is_empty() {
        text.push_str("\n--- output ---\n");
        text.push_str(preview);
    }
    text
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use crate::job::{JobStatus, Outcome};

    use super::*;

    #[test]
    fn started_mentions_command_and_timeout() {
        let job = Job::new("sleep 5");
        let text = started(&job, 90_000);
        assert!(text.starts_with(&format!("Job {} started", job.id)));
        assert!(text.contains("command: sleep 5"));
        assert!(text.contains("workdir: (default)"));
        assert!(text.contains("timeout: 1m30s"));
    }

    #[test]
    fn progress_reports_deltas_totals_and_tail() {
        let now = Utc::now();
        let mut job = Job::new("make");
        job.mark_running(now - TimeDelta::seconds(30)).unwrap();
        let report = MeterSnapshot {
            total_bytes: 4096,
            total_lines: 120,
            delta_bytes: 2048,
            delta_lines: 60,
            last_output_at: Some(now - TimeDelta::seconds(2)),
        };

        let text = progress(&job, &report, now, "compiling foo\n");

        assert!(text.contains("since last report: +60 lines, +2.0 KiB"));
        assert!(text.contains("total: 120 lines, 4.0 KiB"));
        assert!(text.contains("last output: 2.0s ago"));
        assert!(text.ends_with("--- recent output ---\ncompiling foo"));
    }

    #[test]
    fn progress_without_output() {
        let now = Utc::now();
        let mut job = Job::new("sleep 100");
        job.mark_running(now).unwrap();

        let text = progress(&job, &MeterSnapshot::default(), now, "");

        assert!(text.contains("last output: no output yet"));
        assert!(!text.contains("recent output"));
    }

    #[test]
    fn completion_for_timeout_has_no_exit_code() {
        let now = Utc::now();
        let mut job = Job::new("sleep 10");
        job.mark_running(now - TimeDelta::seconds(1)).unwrap();
        job.finish(Outcome::TimedOut { timeout_ms: 500 }, now)
            .unwrap();

        let text = completion(&job, "");

        assert!(text.starts_with(&format!("Job {} timeout", job.id)));
        assert!(text.contains("exit code: none"));
        assert!(text.contains("error: Timed out after 500ms"));
        assert!(text.contains("elapsed: 1.0s"));
        assert_eq!(job.status, JobStatus::Timeout);
    }

    #[test]
    fn completion_includes_preview() {
        let now = Utc::now();
        let mut job = Job::new("echo done");
        job.mark_running(now).unwrap();
        job.finish(Outcome::Exited { code: Some(0) }, now).unwrap();

        let text = completion(&job, "done\n");

        assert!(text.contains("exit code: 0"));
        assert!(!text.contains("error:"));
        assert!(text.ends_with("--- output ---\ndone"));
    }
}
