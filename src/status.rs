//! Progress and Consistency Tracking
//!
//! Every reader (replication session or RDB file) and every writer connection
//! registers a status block here. The blocks are plain atomics updated from
//! the hot paths; nothing on those paths ever takes a lock.
//!
//! ```text
//!  reader "source_127.0.0.1_6379"   phase=stream_live  aof 1200/1200
//!  writer "target_127.0.0.1_7000"   unanswered 0 entries, 0 bytes
//!  entries                          allow 10234  disallow 12
//!                    │
//!                    ▼
//!           consistent() == true
//! ```
//!
//! The run is *consistent* once every reader is streaming live with nothing
//! left to hand off and every writer has all of its replies back.
//!
//! [`StatusReporter`] logs a summary line periodically, the same way a
//! background sweeper would run: a Tokio task with a watch-channel shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Where a reader is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Handshake = 0,
    WaitSnapshot = 1,
    ReceiveSnapshot = 2,
    SyncSnapshot = 3,
    StreamLive = 4,
    Done = 5,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Handshake,
            1 => Phase::WaitSnapshot,
            2 => Phase::ReceiveSnapshot,
            3 => Phase::SyncSnapshot,
            4 => Phase::StreamLive,
            _ => Phase::Done,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Handshake => "handshake",
            Phase::WaitSnapshot => "wait_snapshot",
            Phase::ReceiveSnapshot => "receive_snapshot",
            Phase::SyncSnapshot => "sync_snapshot",
            Phase::StreamLive => "stream_live",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one source.
#[derive(Debug)]
pub struct ReaderStatus {
    pub name: String,
    phase: AtomicU8,
    /// Declared snapshot size.
    pub rdb_size: AtomicU64,
    /// Snapshot bytes received from the socket.
    pub rdb_received: AtomicU64,
    /// Snapshot bytes decoded and handed off.
    pub rdb_sent: AtomicU64,
    /// Replication offset received from the socket.
    pub aof_received_offset: AtomicU64,
    /// Replication offset of the last command handed off.
    pub aof_sent_offset: AtomicU64,
}

impl ReaderStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: AtomicU8::new(Phase::Handshake as u8),
            rdb_size: AtomicU64::new(0),
            rdb_received: AtomicU64::new(0),
            rdb_sent: AtomicU64::new(0),
            aof_received_offset: AtomicU64::new(0),
            aof_sent_offset: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn set_phase(&self, phase: Phase) {
        let old = self.phase.swap(phase as u8, Ordering::Relaxed);
        if old != phase as u8 {
            debug!(name = %self.name, from = %Phase::from_u8(old), to = %phase, "reader phase changed");
        }
    }

    pub fn consistent(&self) -> bool {
        match self.phase() {
            Phase::Done => true,
            Phase::StreamLive => {
                let received = self.aof_received_offset.load(Ordering::Relaxed);
                received != 0 && received == self.aof_sent_offset.load(Ordering::Relaxed)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = self.phase();
        match phase {
            Phase::ReceiveSnapshot | Phase::SyncSnapshot => {
                let size = self.rdb_size.load(Ordering::Relaxed).max(1);
                let (done, verb) = if phase == Phase::ReceiveSnapshot {
                    (self.rdb_received.load(Ordering::Relaxed), "received")
                } else {
                    (self.rdb_sent.load(Ordering::Relaxed), "sent")
                };
                write!(
                    f,
                    "[{}] {}, rdb {} {}/{} ({:.1}%)",
                    self.name,
                    phase,
                    verb,
                    done,
                    size,
                    done as f64 * 100.0 / size as f64
                )
            }
            Phase::StreamLive => {
                let received = self.aof_received_offset.load(Ordering::Relaxed);
                let sent = self.aof_sent_offset.load(Ordering::Relaxed);
                write!(
                    f,
                    "[{}] {}, diff={} bytes",
                    self.name,
                    phase,
                    received.saturating_sub(sent)
                )
            }
            _ => write!(f, "[{}] {}", self.name, phase),
        }
    }
}

/// Outstanding work on one target connection.
#[derive(Debug)]
pub struct WriterStatus {
    pub name: String,
    pub unanswered_bytes: AtomicU64,
    pub unanswered_entries: AtomicU64,
    pub sent_entries: AtomicU64,
}

impl WriterStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unanswered_bytes: AtomicU64::new(0),
            unanswered_entries: AtomicU64::new(0),
            sent_entries: AtomicU64::new(0),
        }
    }

    pub fn sent(&self, bytes: usize) {
        self.unanswered_bytes.fetch_add(bytes as u64, Ordering::AcqRel);
        self.unanswered_entries.fetch_add(1, Ordering::AcqRel);
        self.sent_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn answered(&self, bytes: usize) {
        self.unanswered_bytes.fetch_sub(bytes as u64, Ordering::AcqRel);
        self.unanswered_entries.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn unanswered_bytes(&self) -> u64 {
        self.unanswered_bytes.load(Ordering::Acquire)
    }

    pub fn unanswered_entries(&self) -> u64 {
        self.unanswered_entries.load(Ordering::Acquire)
    }

    pub fn consistent(&self) -> bool {
        self.unanswered_bytes() == 0 && self.unanswered_entries() == 0
    }
}

impl fmt::Display for WriterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] unanswered_entries={}",
            self.name,
            self.unanswered_entries()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandCount {
    pub allow: u64,
    pub disallow: u64,
}

/// Allowed/filtered entry totals, overall and per command name.
#[derive(Debug, Default)]
pub struct EntryCounter {
    allow: AtomicU64,
    disallow: AtomicU64,
    per_command: Mutex<HashMap<String, CommandCount>>,
}

impl EntryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cmd: &str, allowed: bool) {
        if allowed {
            self.allow.fetch_add(1, Ordering::Relaxed);
        } else {
            self.disallow.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut map) = self.per_command.lock() {
            let count = map.entry(cmd.to_string()).or_default();
            if allowed {
                count.allow += 1;
            } else {
                count.disallow += 1;
            }
        }
    }

    pub fn total(&self) -> CommandCount {
        CommandCount {
            allow: self.allow.load(Ordering::Relaxed),
            disallow: self.disallow.load(Ordering::Relaxed),
        }
    }

    pub fn command(&self, cmd: &str) -> CommandCount {
        self.per_command
            .lock()
            .ok()
            .and_then(|map| map.get(cmd).copied())
            .unwrap_or_default()
    }
}

/// Registry of every reader and writer in the run.
#[derive(Debug)]
pub struct Status {
    started: Instant,
    readers: RwLock<Vec<Arc<ReaderStatus>>>,
    writers: RwLock<Vec<Arc<WriterStatus>>>,
    pub entries: Arc<EntryCounter>,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            readers: RwLock::new(Vec::new()),
            writers: RwLock::new(Vec::new()),
            entries: Arc::new(EntryCounter::new()),
        }
    }

    pub fn register_reader(&self, name: impl Into<String>) -> Arc<ReaderStatus> {
        let reader = Arc::new(ReaderStatus::new(name));
        if let Ok(mut readers) = self.readers.write() {
            readers.push(Arc::clone(&reader));
        }
        reader
    }

    pub fn register_writer(&self, name: impl Into<String>) -> Arc<WriterStatus> {
        let writer = Arc::new(WriterStatus::new(name));
        if let Ok(mut writers) = self.writers.write() {
            writers.push(Arc::clone(&writer));
        }
        writer
    }

    /// True when all readers have caught up and all writers are drained.
    pub fn consistent(&self) -> bool {
        let readers_ok = self
            .readers
            .read()
            .map(|r| !r.is_empty() && r.iter().all(|s| s.consistent()))
            .unwrap_or(false);
        let writers_ok = self
            .writers
            .read()
            .map(|w| w.iter().all(|s| s.consistent()))
            .unwrap_or(false);
        readers_ok && writers_ok
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// One line describing every reader and writer.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Ok(readers) = self.readers.read() {
            parts.extend(readers.iter().map(|r| r.to_string()));
        }
        if let Ok(writers) = self.writers.read() {
            parts.extend(writers.iter().map(|w| w.to_string()));
        }
        parts.join(", ")
    }
}

/// Handle to the periodic status logger. Dropping it stops the task.
#[derive(Debug)]
pub struct StatusReporter {
    shutdown_tx: watch::Sender<bool>,
}

impl StatusReporter {
    pub fn start(status: Arc<Status>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(reporter_loop(status, interval, shutdown_rx));
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reporter_loop(
    status: Arc<Status>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut last = status.entries.total();
    let mut last_at = Instant::now();
    let mut was_consistent = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("status reporter received shutdown signal");
                    return;
                }
            }
        }

        let now = status.entries.total();
        let secs = last_at.elapsed().as_secs_f64().max(f64::EPSILON);
        let allow_ops = (now.allow - last.allow) as f64 / secs;
        let disallow_ops = (now.disallow - last.disallow) as f64 / secs;
        last = now;
        last_at = Instant::now();

        // Two consecutive consistent samples before reporting it.
        let consistent = status.consistent();
        let stable = was_consistent && consistent;
        was_consistent = consistent;

        info!(
            allow_ops = %format!("{:.2}", allow_ops),
            disallow_ops = %format!("{:.2}", disallow_ops),
            consistent = stable,
            "{}",
            status.summary()
        );
    }
}
