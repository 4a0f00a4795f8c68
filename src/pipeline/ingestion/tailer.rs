//! Follow an append-only byte stream from its current end.
//!
//! Works for regular files (the mirrored debug log) and character devices (the serial port).
//! Bytes are buffered until a line terminator arrives; a partially written line is never
//! yielded.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::TailConfig;
use crate::types::{RawLine, SourceKind};

#[derive(Error, Debug)]
pub enum TailError {
    #[error("source {} does not exist", .path.display())]
    NotFound { path: PathBuf },

    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read from {} failed: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TailError {
    /// Open failures end the ingestion task; read failures are retried after a reopen
    pub fn is_fatal(&self) -> bool {
        matches!(self, TailError::NotFound { .. } | TailError::Open { .. })
    }
}

/// Result of polling a tailer once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinePoll {
    Line(RawLine),
    /// No complete line is available yet
    Pending,
}

pub struct Tailer {
    path: PathBuf,
    kind: SourceKind,
    file: File,
    seekable: bool,
    /// Byte offset of the read cursor within a seekable source
    position: u64,
    pending: Vec<u8>,
    chunk: Vec<u8>,
    max_line_bytes: usize,
}

impl Tailer {
    /// Open `path` positioned at its current end. Existing content is never replayed.
    pub async fn open(path: &Path, kind: SourceKind, config: &TailConfig) -> Result<Self, TailError> {
        let (file, seekable, position) = open_at_end(path).await?;
        info!(source = %kind, path = %path.display(), offset = position, "Tailing source");

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            file,
            seekable,
            position,
            pending: Vec::new(),
            chunk: vec![0; config.read_chunk_bytes],
            max_line_bytes: config.max_line_bytes,
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Yield the next complete line, reading more bytes when none is buffered.
    pub async fn next_line(&mut self) -> Result<LinePoll, TailError> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(LinePoll::Line(line));
            }

            let n = self
                .file
                .read(&mut self.chunk)
                .await
                .map_err(|source| TailError::Read {
                    path: self.path.clone(),
                    source,
                })?;

            if n == 0 {
                self.detect_truncation().await?;
                return Ok(LinePoll::Pending);
            }

            self.position += n as u64;
            self.pending.extend_from_slice(&self.chunk[..n]);

            // Keep one byte past the limit so the overflow is still visible when the
            // terminator finally arrives
            if self.pending.len() > self.max_line_bytes && !self.pending.contains(&b'\n') {
                self.pending.truncate(self.max_line_bytes + 1);
            }
        }
    }

    /// Complete lines already read but not yet yielded
    pub fn take_buffered_lines(&mut self) -> Vec<RawLine> {
        let mut lines = Vec::new();
        while let Some(line) = self.take_line() {
            lines.push(line);
        }
        lines
    }

    /// Re-open the source after a read error, resuming at the previous offset when the
    /// file still extends that far.
    pub async fn reopen(&mut self) -> Result<(), TailError> {
        let mut file = open_existing(&self.path).await?;
        let metadata = file.metadata().await.map_err(|source| TailError::Open {
            path: self.path.clone(),
            source,
        })?;

        if metadata.is_file() {
            let resume_at = if metadata.len() >= self.position {
                self.position
            } else {
                warn!(source = %self.kind, "Source shrank while unavailable, restarting from its beginning");
                self.pending.clear();
                0
            };
            file.seek(SeekFrom::Start(resume_at))
                .await
                .map_err(|source| TailError::Open {
                    path: self.path.clone(),
                    source,
                })?;
            self.position = resume_at;
        }

        self.file = file;
        self.seekable = metadata.is_file();
        info!(source = %self.kind, offset = self.position, "Re-opened source");
        Ok(())
    }

    fn take_line(&mut self) -> Option<RawLine> {
        loop {
            let end = self.pending.iter().position(|&b| b == b'\n')?;
            let mut bytes: Vec<u8> = self.pending.drain(..=end).collect();
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }

            let truncated = bytes.len() > self.max_line_bytes;
            if truncated {
                warn!(
                    source = %self.kind,
                    limit = self.max_line_bytes,
                    "Line exceeded maximum length and was truncated"
                );
                bytes.truncate(self.max_line_bytes);
            }

            let text = String::from_utf8_lossy(&bytes).into_owned();
            if text.trim().is_empty() {
                continue;
            }
            return Some(RawLine { text, truncated });
        }
    }

    /// A log file that shrank under us was rotated or cleared; follow it from the start
    async fn detect_truncation(&mut self) -> Result<(), TailError> {
        if !self.seekable {
            return Ok(());
        }
        let len = self
            .file
            .metadata()
            .await
            .map_err(|source| TailError::Read {
                path: self.path.clone(),
                source,
            })?
            .len();

        if len < self.position {
            debug!(source = %self.kind, len, position = self.position, "Source truncated");
            self.file
                .seek(SeekFrom::Start(0))
                .await
                .map_err(|source| TailError::Read {
                    path: self.path.clone(),
                    source,
                })?;
            self.position = 0;
            self.pending.clear();
        }
        Ok(())
    }
}

async fn open_existing(path: &Path) -> Result<File, TailError> {
    File::open(path).await.map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            TailError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            TailError::Open {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

async fn open_at_end(path: &Path) -> Result<(File, bool, u64), TailError> {
    let mut file = open_existing(path).await?;
    let metadata = file.metadata().await.map_err(|source| TailError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    // Character devices have no end to seek to
    if !metadata.is_file() {
        return Ok((file, false, 0));
    }

    let position = file
        .seek(SeekFrom::End(0))
        .await
        .map_err(|source| TailError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    Ok((file, true, position))
}
