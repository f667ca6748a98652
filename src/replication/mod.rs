//! Replication Source
//!
//! A [`ReplicationSession`] acts as a replica of one master and turns
//! everything it receives into [`Entry`] values on a bounded channel.
//!
//! ## Lifecycle
//!
//! ```text
//! 1. connect, AUTH, PING
//!        │
//!        ▼
//! 2. REPLCONF listening-port, PSYNC ──── +CONTINUE ─────────────┐
//!        │ +FULLRESYNC                                           │
//!        ▼                                                       │
//! 3. receive snapshot into work_dir/dump.rdb                     │
//!        │                                                       │
//!        ├──> saver task: socket ──> <offset>.aof segments <─────┤
//!        ├──> ack task:   REPLCONF ACK <offset> every 100ms <────┘
//!        ▼
//! 4. decode the snapshot (blocking pool) ──> RESTORE entries
//!        │
//!        ▼
//! 5. follow the segments ──> live entries, checkpoint updates
//! ```
//!
//! A network failure in step 5 reconnects with `PSYNC <replid> <offset+1>`
//! from the last checkpoint; failures before that end the session.

pub mod aof;
pub mod checkpoint;
pub mod psync;

pub use checkpoint::Checkpoint;
pub use psync::{LiveCommand, LiveDecoder, PsyncReply};

use crate::connection::{
    CommandSink, ConnectionError, Credentials, RedisClient, ReplyReader, TlsOptions,
};
use crate::entry::Entry;
use crate::protocol::ParseError;
use crate::rdb::{Loader, LoaderConfig, LoaderSummary, RdbError, RdbResult};
use crate::status::{Phase, ReaderStatus};
use aof::{AofReader, AofWriter};
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("RDB error: {0}")]
    Rdb(#[from] RdbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("master rejected PSYNC: {0}")]
    Rejected(String),

    #[error("invalid PSYNC reply: {0}")]
    InvalidPsyncReply(String),

    #[error("expected {expected:?}, found byte {found:#04x}")]
    Framing { expected: char, found: u8 },

    #[error("invalid snapshot length: {0:?}")]
    InvalidSnapshotLength(String),

    #[error("invalid command in replication stream: {0}")]
    InvalidCommand(String),

    #[error("master answered +CONTINUE without a checkpoint")]
    UnexpectedContinue,

    #[error("entry channel closed")]
    ChannelClosed,

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl ReplicationError {
    /// Network failures that a fresh PSYNC may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::Connection(
                ConnectionError::IoError(_)
                    | ConnectionError::Closed
                    | ConnectionError::UnexpectedEof
                    | ConnectionError::Timeout(_)
            )
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub address: String,
    pub credentials: Credentials,
    pub tls: TlsOptions,
    pub work_dir: PathBuf,
    pub sync_rdb: bool,
    pub sync_aof: bool,
    pub listening_port: u16,
    pub ack_interval: Duration,
    pub aof_segment_size: u64,
    pub checkpoint_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub loader: LoaderConfig,
}

impl SessionConfig {
    pub fn new(address: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        let address = address.into();
        Self {
            name: format!("source_{}", address.replace(':', "_")),
            address,
            credentials: Credentials::default(),
            tls: TlsOptions::default(),
            work_dir: work_dir.into(),
            sync_rdb: true,
            sync_aof: true,
            listening_port: 10007,
            ack_interval: Duration::from_millis(100),
            aof_segment_size: aof::DEFAULT_SEGMENT_SIZE,
            checkpoint_interval: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
            loader: LoaderConfig::default(),
        }
    }
}

/// Aborts the task when dropped.
struct TaskGuard<T>(Option<JoinHandle<T>>);

impl<T> TaskGuard<T> {
    fn new(handle: JoinHandle<T>) -> Self {
        Self(Some(handle))
    }

    async fn join(mut self) -> Result<T, ReplicationError> {
        match self.0.take() {
            Some(handle) => handle
                .await
                .map_err(|e| ReplicationError::TaskFailed(e.to_string())),
            None => Err(ReplicationError::TaskFailed("already joined".to_string())),
        }
    }
}

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

pub struct ReplicationSession {
    config: SessionConfig,
    status: Arc<ReaderStatus>,
}

impl ReplicationSession {
    pub fn new(config: SessionConfig, status: Arc<ReaderStatus>) -> Self {
        Self { config, status }
    }

    /// Runs until the stream ends for good, reconnecting after live-phase
    /// network failures.
    pub async fn run(self, tx: mpsc::Sender<Entry>) -> Result<(), ReplicationError> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let mut progress = if self.config.sync_aof {
            Checkpoint::load(&self.config.work_dir).await?
        } else {
            None
        };
        if let Some(cp) = &progress {
            info!(name = %self.config.name, replid = %cp.replid, offset = cp.offset, "resuming from checkpoint");
        }

        let mut attempts = 0;
        loop {
            let before = progress.as_ref().map(|cp| cp.offset);
            let result = self.attempt(&mut progress, &tx).await;
            let error = match result {
                Ok(()) => {
                    self.status.set_phase(Phase::Done);
                    info!(name = %self.config.name, "replication finished");
                    return Ok(());
                }
                Err(e) => e,
            };

            if let Some(cp) = &progress {
                cp.store(&self.config.work_dir).await?;
            }
            if progress.as_ref().map(|cp| cp.offset) != before {
                attempts = 0;
            }
            let retry = error.is_transient()
                && progress.is_some()
                && attempts < self.config.max_reconnect_attempts;
            if !retry {
                return Err(error);
            }

            attempts += 1;
            warn!(
                name = %self.config.name,
                error = %error,
                attempt = attempts,
                "replication stream lost, reconnecting"
            );
            tokio::time::sleep(self.config.reconnect_backoff).await;
        }
    }

    async fn attempt(
        &self,
        progress: &mut Option<Checkpoint>,
        tx: &mpsc::Sender<Entry>,
    ) -> Result<(), ReplicationError> {
        let dir = self.config.work_dir.as_path();
        self.status.set_phase(Phase::Handshake);

        let client = RedisClient::connect(&self.config.address, &self.config.credentials, &self.config.tls)
            .await?;
        let (mut reader, mut sink) = client.into_split();
        let reply = psync::handshake(
            &mut reader,
            &mut sink,
            self.config.listening_port,
            progress.as_ref(),
        )
        .await?;

        let (replid, start_offset, start_db, ack, saver, done) = match reply {
            PsyncReply::FullResync { replid, offset } => {
                *progress = None;
                checkpoint::Checkpoint::remove(dir).await?;
                aof::clear_dir(dir).await?;
                self.status.aof_received_offset.store(offset, Ordering::Relaxed);
                self.status.aof_sent_offset.store(offset, Ordering::Relaxed);
                let ack = self.spawn_ack(sink);

                let rdb_path = self.receive_snapshot(&mut reader).await?;
                let writer = AofWriter::create(dir, offset, self.config.aof_segment_size).await?;
                let done = writer.done_flag();
                let saver = self.spawn_saver(reader, writer);

                let mut db = 0;
                if self.config.sync_rdb {
                    self.status.set_phase(Phase::SyncSnapshot);
                    let summary = load_rdb_file(
                        rdb_path.clone(),
                        self.config.loader.clone(),
                        Arc::clone(&self.status),
                        tx.clone(),
                    )
                    .await?;
                    db = summary.repl_stream_db.unwrap_or(0);
                    info!(name = %self.config.name, keys = summary.keys, repl_stream_db = db, "snapshot replayed");
                }
                tokio::fs::remove_file(&rdb_path).await?;
                (replid, offset, db, ack, saver, done)
            }
            PsyncReply::Continue { replid } => {
                let cp = progress.clone().ok_or(ReplicationError::UnexpectedContinue)?;
                let replid = replid.unwrap_or(cp.replid);
                aof::clear_dir(dir).await?;
                self.status.aof_received_offset.store(cp.offset, Ordering::Relaxed);
                self.status.aof_sent_offset.store(cp.offset, Ordering::Relaxed);
                let ack = self.spawn_ack(sink);
                let writer = AofWriter::create(dir, cp.offset, self.config.aof_segment_size).await?;
                let done = writer.done_flag();
                let saver = self.spawn_saver(reader, writer);
                (replid, cp.offset, cp.db, ack, saver, done)
            }
        };

        if !self.config.sync_aof {
            drop(saver);
            drop(ack);
            return Ok(());
        }

        self.status.set_phase(Phase::StreamLive);
        let result = self
            .stream_live(&replid, start_offset, start_db, done, progress, tx)
            .await;
        drop(ack);
        result?;

        // The segments ran out because the saver stopped; its error says why.
        saver.join().await??;
        Err(ConnectionError::Closed.into())
    }

    async fn receive_snapshot<R: AsyncRead + Unpin>(
        &self,
        reader: &mut ReplyReader<R>,
    ) -> Result<PathBuf, ReplicationError> {
        self.status.set_phase(Phase::WaitSnapshot);
        let started = Instant::now();
        let len = psync::read_snapshot_header(reader).await?;
        info!(
            name = %self.config.name,
            size = len,
            waited_ms = started.elapsed().as_millis() as u64,
            "master finished bgsave"
        );

        self.status.rdb_size.store(len, Ordering::Relaxed);
        self.status.set_phase(Phase::ReceiveSnapshot);
        let path = self.config.work_dir.join("dump.rdb");
        let mut file = tokio::fs::File::create(&path).await?;
        let status = Arc::clone(&self.status);
        psync::receive_snapshot(reader, len, &mut file, |n| {
            status.rdb_received.store(n, Ordering::Relaxed)
        })
        .await?;
        file.sync_all().await?;
        info!(
            name = %self.config.name,
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "snapshot received"
        );
        Ok(path)
    }

    fn spawn_ack<W>(&self, mut sink: CommandSink<W>) -> TaskGuard<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let status = Arc::clone(&self.status);
        let interval = self.config.ack_interval;
        TaskGuard::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let offset = status.aof_received_offset.load(Ordering::Relaxed);
                if offset == 0 {
                    continue;
                }
                let offset = offset.to_string();
                if let Err(e) = sink.send(&["REPLCONF", "ACK", offset.as_str()]).await {
                    debug!(name = %status.name, error = %e, "ack task stopped");
                    return;
                }
            }
        }))
    }

    fn spawn_saver<R>(
        &self,
        reader: ReplyReader<R>,
        writer: AofWriter,
    ) -> TaskGuard<Result<(), ReplicationError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        TaskGuard::new(tokio::spawn(save_stream(
            reader,
            writer,
            Arc::clone(&self.status),
        )))
    }

    async fn stream_live(
        &self,
        replid: &str,
        start_offset: u64,
        mut db: u32,
        done: Arc<AtomicBool>,
        progress: &mut Option<Checkpoint>,
        tx: &mpsc::Sender<Entry>,
    ) -> Result<(), ReplicationError> {
        let dir = self.config.work_dir.as_path();
        let mut aof = AofReader::open(dir, start_offset, done).await?;
        let mut decoder = LiveDecoder::new(start_offset);
        let mut chunk = BytesMut::new();
        let mut last_store = Instant::now();
        info!(name = %self.config.name, offset = start_offset, db, "streaming live commands");

        loop {
            while let Some((argv, offset)) = decoder.next_command()? {
                match psync::classify(argv)? {
                    LiveCommand::Select(n) => db = n,
                    LiveCommand::Control => {}
                    LiveCommand::Forward(argv) => {
                        tx.send(Entry::live(db, argv, offset))
                            .await
                            .map_err(|_| ReplicationError::ChannelClosed)?;
                    }
                }
                self.status.aof_sent_offset.store(offset, Ordering::Relaxed);
                let cp = Checkpoint::new(replid, offset, db);
                if last_store.elapsed() >= self.config.checkpoint_interval {
                    cp.store(dir).await?;
                    last_store = Instant::now();
                }
                *progress = Some(cp);
            }

            chunk.clear();
            if aof.read_chunk(&mut chunk).await? == 0 {
                return Ok(());
            }
            decoder.feed(&chunk);
        }
    }
}

/// Copies the live stream from the socket into AOF segments.
async fn save_stream<R>(
    mut reader: ReplyReader<R>,
    mut writer: AofWriter,
    status: Arc<ReaderStatus>,
) -> Result<(), ReplicationError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        buf.clear();
        if reader.read_chunk(&mut buf).await? == 0 {
            writer.finish().await?;
            return Err(ConnectionError::Closed.into());
        }
        writer.write(&buf).await?;
        status
            .aof_received_offset
            .store(writer.offset(), Ordering::Relaxed);
    }
}

/// Decodes an RDB file on the blocking pool, sending every entry to `tx`.
pub async fn load_rdb_file(
    path: PathBuf,
    config: LoaderConfig,
    status: Arc<ReaderStatus>,
    tx: mpsc::Sender<Entry>,
) -> Result<LoaderSummary, ReplicationError> {
    let size = tokio::fs::metadata(&path).await?.len();
    status.rdb_size.store(size, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || -> RdbResult<LoaderSummary> {
        let file = std::fs::File::open(&path)?;
        let reader = std::io::BufReader::with_capacity(1 << 20, file);
        let progress = Arc::clone(&status);
        Loader::new(config)
            .with_progress(move |n| progress.rdb_sent.store(n, Ordering::Relaxed))
            .load(reader, |entry| {
                tx.blocking_send(entry).map_err(|_| RdbError::SinkClosed)
            })
    })
    .await
    .map_err(|e| ReplicationError::TaskFailed(e.to_string()))?
    .map_err(|e| match e {
        RdbError::SinkClosed => ReplicationError::ChannelClosed,
        other => ReplicationError::Rdb(other),
    })
}

/// Replays a local RDB file instead of replicating.
pub async fn replay_rdb_file(
    path: &Path,
    config: LoaderConfig,
    status: Arc<ReaderStatus>,
    tx: mpsc::Sender<Entry>,
) -> Result<LoaderSummary, ReplicationError> {
    info!(path = %path.display(), "replaying RDB file");
    status.set_phase(Phase::SyncSnapshot);
    let summary = load_rdb_file(path.to_path_buf(), config, Arc::clone(&status), tx).await?;
    status.set_phase(Phase::Done);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdb::kind;
    use crate::rdb::testutil::{encode_string, RdbBuilder};
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_transient_errors() {
        assert!(ReplicationError::from(ConnectionError::Closed).is_transient());
        assert!(ReplicationError::from(ConnectionError::UnexpectedEof).is_transient());
        assert!(!ReplicationError::Rejected("no".into()).is_transient());
        assert!(!ReplicationError::from(RdbError::UnknownType(99)).is_transient());
    }

    #[tokio::test]
    async fn test_replay_rdb_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let rdb = RdbBuilder::new(9)
            .select_db(2)
            .key(kind::STRING, b"a", &encode_string(b"1"))
            .key(kind::STRING, b"b", &encode_string(b"2"))
            .finish();
        tokio::fs::write(&path, &rdb).await.unwrap();

        let status = Arc::new(ReaderStatus::new("file"));
        let (tx, mut rx) = mpsc::channel(16);
        let summary = replay_rdb_file(&path, LoaderConfig::default(), Arc::clone(&status), tx)
            .await
            .unwrap();
        assert_eq!(summary.keys, 2);
        assert_eq!(status.phase(), Phase::Done);
        assert_eq!(status.rdb_sent.load(Ordering::Relaxed), rdb.len() as u64);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.db, 2);
        assert_eq!(first.keys, vec![Bytes::from("a")]);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let rdb = RdbBuilder::new(9)
            .key(kind::STRING, b"a", &encode_string(b"1"))
            .finish();
        tokio::fs::write(&path, &rdb).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let status = Arc::new(ReaderStatus::new("file"));
        assert!(matches!(
            replay_rdb_file(&path, LoaderConfig::default(), status, tx).await,
            Err(ReplicationError::ChannelClosed)
        ));
    }

    /// A fake master: answers the handshake, sends a snapshot and a few
    /// live commands, then hangs up.
    async fn fake_master(listener: TcpListener, rdb: Vec<u8>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut reader = ReplyReader::new(&mut socket, "replica");
        // PING
        reader.read_reply().await.unwrap();
        drop(reader);
        socket.write_all(b"+PONG\r\n").await.unwrap();

        let mut reader = ReplyReader::new(&mut socket, "replica");
        reader.read_reply().await.unwrap(); // REPLCONF listening-port
        drop(reader);
        socket.write_all(b"+OK\r\n").await.unwrap();

        let mut reader = ReplyReader::new(&mut socket, "replica");
        reader.read_reply().await.unwrap(); // PSYNC ? -1
        drop(reader);

        let mut out = Vec::new();
        out.extend_from_slice(b"+FULLRESYNC 8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb 0\r\n\n");
        out.extend_from_slice(format!("${}\r\n", rdb.len()).as_bytes());
        out.extend_from_slice(&rdb);
        out.extend_from_slice(b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n");
        out.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        out.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
        socket.write_all(&out).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_full_sync_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let rdb = RdbBuilder::new(9)
            .aux("repl-stream-db", "0")
            .key(kind::STRING, b"snap", &encode_string(b"1"))
            .finish();
        let master = tokio::spawn(fake_master(listener, rdb));

        let dir = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::new(addr, dir.path());
        config.max_reconnect_attempts = 0;
        let status = Arc::new(ReaderStatus::new("source"));
        let (tx, mut rx) = mpsc::channel(16);
        let session = ReplicationSession::new(config, Arc::clone(&status));
        let handle = tokio::spawn(session.run(tx));

        let snap = rx.recv().await.unwrap();
        assert!(snap.is_base);
        assert_eq!(snap.cmd_name, "RESTORE");

        let live = rx.recv().await.unwrap();
        assert!(!live.is_base);
        assert_eq!(live.db, 3);
        assert_eq!(live.cmd_name, "SET");
        assert_eq!(live.offset, Some(23 + 14 + 27));

        master.await.unwrap();
        // the master hung up and retries are disabled
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(e) if e.is_transient()));

        let cp = Checkpoint::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(cp.offset, 23 + 14 + 27);
        assert_eq!(cp.db, 3);
        assert_eq!(status.aof_received_offset.load(Ordering::Relaxed), 64);
    }
}
