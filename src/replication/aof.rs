//! Rotating on-disk buffer for the live replication stream.
//!
//! While the snapshot is being replayed the master keeps streaming commands.
//! They are appended to segments named after the replication offset of
//! their first byte:
//!
//! ```text
//! work_dir/
//!   1000.aof          bytes [1000, 1000 + max)
//!   1073742824.aof    next segment, opened once the previous one is full
//! ```
//!
//! [`AofReader`] follows the writer: at the end of a segment it waits for
//! more data, moves on (deleting the finished segment) when the next one
//! appears, and reports end of stream only after the writer has finished.

use bytes::BytesMut;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

pub const DEFAULT_SEGMENT_SIZE: u64 = 1024 * 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 64 * 1024;

pub fn segment_path(dir: &Path, offset: u64) -> PathBuf {
    dir.join(format!("{}.aof", offset))
}

/// Start offsets of every segment in `dir`, ascending.
pub async fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut offsets = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".aof")) else {
            continue;
        };
        if let Ok(offset) = stem.parse() {
            offsets.push(offset);
        }
    }
    offsets.sort_unstable();
    Ok(offsets)
}

/// Removes every segment and snapshot file left by an earlier run.
pub async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let stale = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "aof" || e == "rdb")
            .unwrap_or(false);
        if stale {
            fs::remove_file(&path).await?;
            debug!(path = %path.display(), "removed stale file");
        }
    }
    Ok(())
}

pub struct AofWriter {
    dir: PathBuf,
    file: File,
    path: PathBuf,
    offset: u64,
    segment_size: u64,
    max_size: u64,
    done: Arc<AtomicBool>,
}

impl AofWriter {
    /// Opens the segment starting at `offset`.
    pub async fn create(dir: &Path, offset: u64, max_size: u64) -> std::io::Result<Self> {
        let path = segment_path(dir, offset);
        let file = open_append(&path).await?;
        debug!(path = %path.display(), "opened aof segment for write");
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            offset,
            segment_size: 0,
            max_size: max_size.max(1),
            done: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Offset just past the last byte written.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Flag raised once the writer has finished; hand it to the reader.
    pub fn done_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }

    pub async fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all(buf).await?;
        self.file.flush().await?;
        self.offset += buf.len() as u64;
        self.segment_size += buf.len() as u64;
        if self.segment_size >= self.max_size {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file.sync_data().await?;
        info!(path = %self.path.display(), size = self.segment_size, "aof segment full");
        self.path = segment_path(&self.dir, self.offset);
        self.file = open_append(&self.path).await?;
        self.segment_size = 0;
        debug!(path = %self.path.display(), "opened aof segment for write");
        Ok(())
    }

    /// Syncs the current segment and signals the reader.
    pub async fn finish(mut self) -> std::io::Result<()> {
        let result = async {
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;
        self.done.store(true, Ordering::Release);
        result
    }
}

impl Drop for AofWriter {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

pub struct AofReader {
    dir: PathBuf,
    file: File,
    path: PathBuf,
    offset: u64,
    done: Arc<AtomicBool>,
}

impl AofReader {
    /// Opens the segment containing `offset` and seeks to it.
    pub async fn open(dir: &Path, offset: u64, done: Arc<AtomicBool>) -> std::io::Result<Self> {
        let start = list_segments(dir)
            .await?
            .into_iter()
            .filter(|&s| s <= offset)
            .next_back()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no aof segment holds offset {}", offset),
                )
            })?;
        let path = segment_path(dir, start);
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(offset - start)).await?;
        debug!(path = %path.display(), offset, "opened aof segment for read");
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            offset,
            done,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends the next bytes to `out`. Returns 0 once the writer has
    /// finished and everything it wrote has been read.
    pub async fn read_chunk(&mut self, out: &mut BytesMut) -> std::io::Result<usize> {
        let mut writer_done = false;
        loop {
            out.reserve(READ_CHUNK);
            let n = self.file.read_buf(out).await?;
            if n > 0 {
                self.offset += n as u64;
                return Ok(n);
            }

            let next = segment_path(&self.dir, self.offset);
            if next != self.path && fs::try_exists(&next).await? {
                let finished = std::mem::replace(&mut self.path, next);
                self.file = File::open(&self.path).await?;
                fs::remove_file(&finished).await?;
                debug!(
                    removed = %finished.display(),
                    path = %self.path.display(),
                    "moved to next aof segment"
                );
                continue;
            }

            // One more read after seeing the flag, to pick up the final write.
            if writer_done {
                return Ok(0);
            }
            writer_done = self.done.load(Ordering::Acquire);
            if !writer_done {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_follow_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AofWriter::create(dir.path(), 100, 8).await.unwrap();
        let done = writer.done_flag();

        writer.write(b"0123456789").await.unwrap();
        writer.write(b"abc").await.unwrap();
        assert_eq!(writer.offset(), 113);
        assert_eq!(list_segments(dir.path()).await.unwrap(), vec![100, 110]);

        let mut reader = AofReader::open(dir.path(), 100, done).await.unwrap();
        writer.finish().await.unwrap();

        let mut out = BytesMut::new();
        while reader.read_chunk(&mut out).await.unwrap() > 0 {}
        assert_eq!(&out[..], b"0123456789abc");
        assert_eq!(reader.offset(), 113);
        // the fully consumed segment is gone
        assert_eq!(list_segments(dir.path()).await.unwrap(), vec![110]);
    }

    #[tokio::test]
    async fn test_open_mid_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AofWriter::create(dir.path(), 0, DEFAULT_SEGMENT_SIZE).await.unwrap();
        writer.write(b"hello world").await.unwrap();
        let done = writer.done_flag();
        writer.finish().await.unwrap();

        let mut reader = AofReader::open(dir.path(), 6, done).await.unwrap();
        let mut out = BytesMut::new();
        while reader.read_chunk(&mut out).await.unwrap() > 0 {}
        assert_eq!(&out[..], b"world");
    }

    #[tokio::test]
    async fn test_reader_waits_for_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AofWriter::create(dir.path(), 0, DEFAULT_SEGMENT_SIZE).await.unwrap();
        let mut reader = AofReader::open(dir.path(), 0, writer.done_flag()).await.unwrap();

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.write(b"late").await.unwrap();
            writer.finish().await.unwrap();
        });

        let mut out = BytesMut::new();
        while reader.read_chunk(&mut out).await.unwrap() > 0 {}
        feeder.await.unwrap();
        assert_eq!(&out[..], b"late");
    }

    #[tokio::test]
    async fn test_missing_segment() {
        let dir = tempfile::tempdir().unwrap();
        let done = Arc::new(AtomicBool::new(true));
        assert!(AofReader::open(dir.path(), 5, done).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_dir_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1.aof"), b"x").await.unwrap();
        fs::write(dir.path().join("dump.rdb"), b"x").await.unwrap();
        fs::write(dir.path().join("checkpoint"), b"x").await.unwrap();
        clear_dir(dir.path()).await.unwrap();
        assert!(list_segments(dir.path()).await.unwrap().is_empty());
        assert!(fs::try_exists(dir.path().join("checkpoint")).await.unwrap());
        assert!(!fs::try_exists(dir.path().join("dump.rdb")).await.unwrap());
    }
}
