//! Human-readable stdout output.

use async_trait::async_trait;
use std::io::Write;

use crate::data::HeartRateSample;
use crate::error::Result;
use crate::sink::Sink;

/// Prints `Heart Rate: <bpm> bpm` per sample.
pub struct ConsoleSink<W: Write + Send = std::io::Stdout> {
    out: W,
}

impl ConsoleSink {
    /// Console sink writing to stdout.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    /// Console sink writing to an arbitrary writer.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> Sink for ConsoleSink<W> {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&mut self, sample: &HeartRateSample) -> Result<()> {
        writeln!(self.out, "Heart Rate: {}", sample)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_console_line_format() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.deliver(&HeartRateSample::new(64)).await.unwrap();
        sink.deliver(&HeartRateSample::new(65)).await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "Heart Rate: 64 bpm\nHeart Rate: 65 bpm\n");
    }
}
