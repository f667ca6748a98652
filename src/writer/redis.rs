//! One pipelined connection to a target server.
//!
//! Commands are written without waiting for their replies. Every command
//! sent is queued for the reply-drain task, which reads replies in the same
//! order and releases the unanswered-byte budget.
//!
//! ```text
//! write(entry) ──> [SELECT n] ──> wait for budget ──> socket
//!                                       ▲               │
//!                         answered()    │               ▼
//!     pending queue ──> drain task ─────┘   <── replies
//! ```

use super::{BusyKeyPolicy, WriterConfig, WriterError};
use crate::connection::{CommandSink, RedisClient, RedisStream, ReplyReader};
use crate::entry::Entry;
use crate::protocol::RespValue;
use crate::status::WriterStatus;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const BUSY_KEY_REPLY: &str = "BUSYKEY Target key name already exists.";

const BUDGET_POLL: Duration = Duration::from_millis(1);

/// A command waiting for its reply.
#[derive(Debug)]
enum Pending {
    Select(u32),
    Entry(Entry),
}

pub struct RedisWriter<W: AsyncWrite = WriteHalf<RedisStream>> {
    sink: CommandSink<W>,
    db: u32,
    pending: Option<mpsc::Sender<Pending>>,
    retries: mpsc::UnboundedReceiver<Entry>,
    drain: Option<JoinHandle<Result<(), WriterError>>>,
    max_unanswered: u64,
    status: Arc<WriterStatus>,
}

impl RedisWriter {
    /// Connects to `address` and starts the reply-drain task.
    pub async fn connect(
        address: &str,
        config: &WriterConfig,
        status: Arc<WriterStatus>,
    ) -> Result<Self, WriterError> {
        let client = RedisClient::connect(address, &config.credentials, &config.tls).await?;
        let (reader, sink) = client.into_split();
        info!(name = %status.name, address = %address, "writer connected");
        Ok(Self::from_parts(reader, sink, config, status))
    }
}

impl<W: AsyncWrite + Unpin> RedisWriter<W> {
    pub fn from_parts<R>(
        reader: ReplyReader<R>,
        sink: CommandSink<W>,
        config: &WriterConfig,
        status: Arc<WriterStatus>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (pending_tx, pending_rx) = mpsc::channel(config.pipeline_count_limit.max(1));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_replies(
            reader,
            pending_rx,
            retry_tx,
            config.busy_key_policy,
            Arc::clone(&status),
        ));
        Self {
            sink,
            db: 0,
            pending: Some(pending_tx),
            retries: retry_rx,
            drain: Some(drain),
            max_unanswered: config.target_max_querybuf_len,
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.status.name
    }

    pub fn status(&self) -> &Arc<WriterStatus> {
        &self.status
    }

    /// Database the connection currently has selected.
    pub fn db(&self) -> u32 {
        self.db
    }

    /// Sends `entry`, selecting its database first if needed. Waits while
    /// the unanswered bytes would exceed the budget.
    pub async fn write(&mut self, entry: Entry) -> Result<(), WriterError> {
        self.resend_busy_keys().await?;
        self.send(entry).await
    }

    async fn send(&mut self, entry: Entry) -> Result<(), WriterError> {
        if entry.db != self.db {
            self.select(entry.db).await?;
        }

        self.wait_for_budget(entry.serialized_size as u64).await?;
        let bytes = entry.serialize();
        trace!(name = %self.status.name, cmd = %entry, "send");
        self.status.sent(entry.serialized_size);
        self.enqueue(Pending::Entry(entry)).await?;
        self.sink.send_raw(&bytes).await?;
        Ok(())
    }

    async fn select(&mut self, db: u32) -> Result<(), WriterError> {
        debug!(name = %self.status.name, db, "switching database");
        self.enqueue(Pending::Select(db)).await?;
        let db_arg = db.to_string();
        self.sink.send(&["SELECT", db_arg.as_str()]).await?;
        self.db = db;
        Ok(())
    }

    async fn enqueue(&mut self, pending: Pending) -> Result<(), WriterError> {
        let sender = self.pending.as_ref().ok_or(WriterError::Closed)?;
        if sender.send(pending).await.is_err() {
            return Err(self.drain_failure().await);
        }
        Ok(())
    }

    /// Blocks while sending `size` more bytes would push the unanswered
    /// total past the budget. A command larger than the whole budget is let
    /// through once nothing else is outstanding.
    async fn wait_for_budget(&mut self, size: u64) -> Result<(), WriterError> {
        loop {
            let unanswered = self.status.unanswered_bytes();
            if unanswered == 0 || unanswered + size <= self.max_unanswered {
                return Ok(());
            }
            if self.drain.as_ref().map_or(true, |h| h.is_finished()) {
                return Err(self.drain_failure().await);
            }
            tokio::time::sleep(BUDGET_POLL).await;
        }
    }

    /// Resends entries the target refused with BUSYKEY, now with REPLACE.
    async fn resend_busy_keys(&mut self) -> Result<(), WriterError> {
        while let Ok(mut entry) = self.retries.try_recv() {
            let mut argv = entry.argv.clone();
            argv.push(Bytes::from_static(b"REPLACE"));
            entry.set_argv(argv);
            info!(name = %self.status.name, cmd = %entry, "retrying with REPLACE");
            self.send(entry).await?;
        }
        Ok(())
    }

    async fn drain_failure(&mut self) -> WriterError {
        match self.drain.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => WriterError::Closed,
                Err(e) => WriterError::TaskFailed(e.to_string()),
            },
            None => WriterError::Closed,
        }
    }

    /// Waits for every reply, then stops the drain task.
    pub async fn close(mut self) -> Result<(), WriterError> {
        loop {
            self.resend_busy_keys().await?;
            if self.status.unanswered_entries() == 0 && self.retries.is_empty() {
                break;
            }
            if self.drain.as_ref().map_or(true, |h| h.is_finished()) {
                return Err(self.drain_failure().await);
            }
            tokio::time::sleep(BUDGET_POLL).await;
        }
        self.pending.take();
        match self.drain.take() {
            Some(handle) => handle
                .await
                .map_err(|e| WriterError::TaskFailed(e.to_string()))??,
            None => {}
        }
        info!(name = %self.status.name, sent = self.status.sent_entries.load(std::sync::atomic::Ordering::Relaxed), "writer closed");
        Ok(())
    }
}

impl<W: AsyncWrite> Drop for RedisWriter<W> {
    fn drop(&mut self) {
        if let Some(handle) = &self.drain {
            handle.abort();
        }
    }
}

/// Reads one reply per queued command, in order.
async fn drain_replies<R>(
    mut reader: ReplyReader<R>,
    mut pending: mpsc::Receiver<Pending>,
    retries: mpsc::UnboundedSender<Entry>,
    policy: BusyKeyPolicy,
    status: Arc<WriterStatus>,
) -> Result<(), WriterError>
where
    R: AsyncRead + Unpin,
{
    while let Some(item) = pending.recv().await {
        let reply = reader.read_reply().await?;
        let entry = match item {
            Pending::Select(db) => {
                if let RespValue::Error(error) = reply {
                    return Err(WriterError::Target {
                        command: format!("SELECT {}", db),
                        error,
                    });
                }
                continue;
            }
            Pending::Entry(entry) => entry,
        };

        trace!(name = %status.name, reply = %reply, cmd = %entry, "reply");
        match reply {
            RespValue::Null => warn!(name = %status.name, cmd = %entry, "nil reply"),
            RespValue::Error(error) if error == BUSY_KEY_REPLY => match policy {
                BusyKeyPolicy::Panic => {
                    return Err(WriterError::BusyKey {
                        command: entry.to_string(),
                    })
                }
                BusyKeyPolicy::Skip => {
                    debug!(name = %status.name, cmd = %entry, "target key exists, skipped");
                }
                BusyKeyPolicy::Rewrite => {
                    let size = entry.serialized_size;
                    // Queue the retry before releasing the budget so close()
                    // never sees both empty at once.
                    if retries.send(entry).is_err() {
                        return Err(WriterError::Closed);
                    }
                    status.answered(size);
                    continue;
                }
            },
            RespValue::Error(error) => {
                return Err(WriterError::Target {
                    command: entry.to_string(),
                    error,
                })
            }
            _ => {}
        }
        status.answered(entry.serialized_size);
    }
    Ok(())
}
