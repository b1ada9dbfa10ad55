//! Per job append-only output files.
//!
//! A job's output file starts with a short header block followed by the raw, interleaved stdout
//! and stderr of the command. Files are only ever appended to; removing them is left to whatever
//! retention policy the host applies.
//!
//! The read helpers ([`tail`] and [`preview`]) seek instead of loading the whole file.
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::job::Job;

/// The append-only output file of one job.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    /// Creates the parent directory and the file, then writes the header block.
    ///
    /// An existing file is appended to, never truncated.
    pub async fn create(
        path: impl Into<PathBuf>,
        job: &Job,
        started_at: DateTime<Utc>,
    ) -> std::io::Result<Self> {
        let sink = Self { path: path.into() };
        if let Some(parent) = sink.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut header = format!(
            "# job {}\n# started {}\n# command: {}\n",
            job.id,
            started_at.to_rfc3339(),
            job.command
        );
        if let Some(workdir) = &job.workdir {
            header.push_str(&format!("# workdir: {}\n", workdir.display()));
        }
        header.push('\n');

        let mut file = sink.open_append().await?;
        file.write_all(header.as_bytes()).await?;
        file.flush().await?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a fresh append handle.
    ///
    /// Each output stream gets its own handle. Appends from different handles may interleave
    /// but never overwrite each other.
    pub async fn open_append(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }
}

/// Returns at most the last `max_bytes` bytes of the file as lossy UTF-8.
///
/// A missing file reads as empty.
pub async fn tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err),
    };
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    let bytes = read_range(&mut file, start, len - start).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Returns the whole file when it fits in `budget` bytes, otherwise its first and last
/// `budget / 2` bytes around a truncation marker.
pub async fn preview(path: &Path, budget: u64) -> std::io::Result<String> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err),
    };
    let len = file.metadata().await?.len();
    if len <= budget {
        let bytes = read_range(&mut file, 0, len).await?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }

    let head_len = budget / 2;
    let tail_len = budget - head_len;
    let head = read_range(&mut file, 0, head_len).await?;
    let tail = read_range(&mut file, len - tail_len, tail_len).await?;
    let skipped = len - head_len - tail_len;
    Ok(format!(
        "{}\n{}\n{}",
        String::from_utf8_lossy(&head),
        truncation_marker(skipped),
        String::from_utf8_lossy(&tail)
    ))
}

pub fn truncation_marker(skipped: u64) -> String {
    format!("... [truncated {skipped} bytes] ...")
}

async fn read_range(file: &mut File, start: u64, len: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(start)).await?;
    let mut bytes = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
    (&mut *file).take(len).read_to_end(&mut bytes).await?;
    Ok(bytes)
}
