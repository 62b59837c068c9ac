//! Newline-delimited JSON helpers shared by the built-in processors.

use serde_json::Value;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};

use crate::Result;

/// Rows between cancellation checks.
pub(crate) const CHECKPOINT_EVERY: i64 = 1000;

/// Line reader over an NDJSON file.
pub(crate) struct NdjsonReader {
    lines: Lines<BufReader<File>>,
    skipped: u64,
}

impl NdjsonReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            skipped: 0,
        })
    }

    /// Next parseable row. Blank and malformed lines are skipped.
    pub async fn next_row(&mut self) -> Result<Option<Value>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => return Ok(Some(value)),
                Err(_) => self.skipped += 1,
            }
        }
        Ok(None)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Buffered NDJSON writer that counts rows.
pub(crate) struct NdjsonWriter {
    writer: BufWriter<File>,
    rows: i64,
}

impl NdjsonWriter {
    pub async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
            rows: 0,
        })
    }

    pub async fn write_row(&mut self, row: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> i64 {
        self.rows
    }

    /// Flush and return the number of rows written.
    pub async fn close(mut self) -> Result<i64> {
        self.writer.flush().await?;
        Ok(self.rows)
    }
}
