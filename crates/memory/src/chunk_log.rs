use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::warn;

use narrative_core::Result;

use crate::chunk::EmbeddedChunk;

/// Append-only JSONL mirror of every chunk the vector store accepts.
#[derive(Debug, Clone)]
pub struct ChunkLog {
    path: PathBuf,
}

impl ChunkLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, chunk: &EmbeddedChunk) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_string(chunk)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read every intact record.  Corrupt lines are skipped and copied to a
    /// `.corrupt` sidecar next to the log.
    pub fn load(&self) -> Result<Vec<EmbeddedChunk>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(std::fs::File::open(&self.path)?);
        let mut chunks = Vec::new();
        let mut corrupt = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EmbeddedChunk>(&line) {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    warn!(line = idx + 1, error = %err, path = %self.path.display(), "corrupt chunk record; skipping");
                    corrupt.push(line);
                }
            }
        }

        if !corrupt.is_empty() {
            let sidecar = self.path.with_extension("jsonl.corrupt");
            match std::fs::OpenOptions::new().create(true).append(true).open(&sidecar) {
                Ok(mut file) => {
                    for line in &corrupt {
                        let _ = writeln!(file, "{line}");
                    }
                }
                Err(err) => warn!(error = %err, "could not write corrupt-line sidecar"),
            }
            warn!(corrupt_lines = corrupt.len(), path = %self.path.display(), "chunk log loaded with skipped lines");
        }

        Ok(chunks)
    }
}
