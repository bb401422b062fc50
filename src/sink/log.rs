//! Per-run CSV log of every decoded sample.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use crate::data::HeartRateSample;
use crate::error::Result;
use crate::sink::Sink;

/// Header row written once at the top of every log file.
pub const CSV_HEADER: &str = "timestamp,bpm";

/// File name for a run started at `started_at`.
pub fn log_file_name(started_at: DateTime<Local>) -> String {
    format!("heart_rate_{}.csv", started_at.format("%Y-%m-%d_%H-%M-%S"))
}

/// Appends `timestamp,bpm` rows to a CSV file created for this run.
///
/// Each row is flushed immediately so `tail -f` sees it.
pub struct LogSink {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl LogSink {
    /// Create `log_dir` if needed and open a fresh log file named after `started_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub async fn create(log_dir: impl AsRef<Path>, started_at: DateTime<Local>) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir).await?;

        let path = log_dir.join(log_file_name(started_at));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        let mut writer = BufWriter::new(file);
        writer.write_all(CSV_HEADER.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        info!("Logging heart rate to {}", path.display());

        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows written after the header.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&mut self, sample: &HeartRateSample) -> Result<()> {
        let row = sample.to_csv_row();
        self.writer.write_all(row.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        self.rows += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn run_start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 42).unwrap()
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name(run_start()), "heart_rate_2024-03-09_07-05-42.csv");
    }

    #[tokio::test]
    async fn test_creates_directory_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let sink = LogSink::create(&log_dir, run_start()).await.unwrap();

        assert!(log_dir.is_dir());
        assert_eq!(
            sink.path(),
            log_dir.join("heart_rate_2024-03-09_07-05-42.csv").as_path()
        );
        assert_eq!(
            std::fs::read_to_string(sink.path()).unwrap(),
            "timestamp,bpm\n"
        );
    }

    #[tokio::test]
    async fn test_appends_rows_visible_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LogSink::create(dir.path(), run_start()).await.unwrap();

        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 6, 0).unwrap();
        sink.deliver(&HeartRateSample::at(75, at)).await.unwrap();
        sink.deliver(&HeartRateSample::at(76, at)).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(sink.path()).unwrap(),
            "timestamp,bpm\n2024-03-09 07:06:00,75\n2024-03-09 07:06:00,76\n"
        );
        assert_eq!(sink.rows(), 2);
        sink.close().await.unwrap();
    }
}
