//! Single-record text file holding the latest heart rate.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, trace};

use crate::data::HeartRateSample;
use crate::error::Result;
use crate::sink::Sink;

/// Overwrites a text file with `"<bpm> bpm"` on every sample.
///
/// Handy as a source for streaming overlays that poll a file.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    /// Create (or truncate) the output file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for writing.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        info!("Writing latest heart rate to {}", path.display());

        Ok(Self { path, file })
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&mut self, sample: &HeartRateSample) -> Result<()> {
        let record = sample.to_string();

        self.file.set_len(0).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_all(record.as_bytes()).await?;
        self.file.flush().await?;

        trace!("Wrote \"{}\" to {}", record, self.path.display());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_overwrites_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heart_rate.txt");

        let mut sink = FileSink::create(&path).await.unwrap();
        sink.deliver(&HeartRateSample::new(148)).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "148 bpm");

        sink.deliver(&HeartRateSample::new(75)).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "75 bpm");
    }

    #[tokio::test]
    async fn test_truncates_existing_file_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heart_rate.txt");
        std::fs::write(&path, "stale content from last run").unwrap();

        let _sink = FileSink::create(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("heart_rate.txt");

        assert!(FileSink::create(&path).await.is_err());
    }
}
