//! Writer Dispatch
//!
//! Replays entries into the target.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!   Entry ───────────> │          Dispatcher          │
//!                      └──────┬────────────────┬──────┘
//!                 Standalone  │                │  Cluster
//!                 round-robin ▼                ▼  SlotRouter[16384]
//!            ┌─────────────┐ ┌─────────────┐  ┌─────────────┐
//!            │ RedisWriter │ │ RedisWriter │  │ RedisWriter │ one per master
//!            └─────────────┘ └─────────────┘  └─────────────┘
//! ```
//!
//! Each [`RedisWriter`] owns one pipelined connection, inserts `SELECT`
//! when the entry's database changes, and blocks while its unanswered bytes
//! exceed `target_max_querybuf_len`.

pub mod cluster;
pub mod redis;
pub mod router;

pub use cluster::ClusterWriter;
pub use redis::RedisWriter;
pub use router::SlotRouter;

use crate::connection::{ConnectionError, Credentials, TlsOptions};
use crate::entry::Entry;
use crate::status::Status;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("CROSSSLOT keys in request don't hash to the same slot: {command} (slots {slots:?})")]
    CrossSlot { command: String, slots: Vec<u16> },

    #[error("target key already exists: {command}")]
    BusyKey { command: String },

    #[error("target rejected {command}: {error}")]
    Target { command: String, error: String },

    #[error("cluster slot {slot} is served by more than one master")]
    SlotConflict { slot: u16 },

    #[error("cluster slot {slot} is not served by any master")]
    SlotUncovered { slot: u16 },

    #[error("target cluster has no masters")]
    NoMasters,

    #[error("reply task stopped")]
    Closed,

    #[error("task failed: {0}")]
    TaskFailed(String),
}

/// What to do when RESTORE hits an existing key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyKeyPolicy {
    /// Stop the run.
    #[default]
    Panic,
    /// Log and move on.
    Skip,
    /// Send the same RESTORE again with REPLACE.
    Rewrite,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub address: String,
    pub credentials: Credentials,
    pub tls: TlsOptions,
    pub cluster: bool,
    /// Size of the standalone connection pool.
    pub connections: usize,
    /// Commands that may wait for a reply on one connection.
    pub pipeline_count_limit: usize,
    /// Unanswered bytes allowed on one connection.
    pub target_max_querybuf_len: u64,
    pub busy_key_policy: BusyKeyPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6380".to_string(),
            credentials: Credentials::default(),
            tls: TlsOptions::default(),
            cluster: false,
            connections: 1,
            pipeline_count_limit: 1024,
            target_max_querybuf_len: 1024 * 1024 * 1024,
            busy_key_policy: BusyKeyPolicy::Panic,
        }
    }
}

pub(crate) fn writer_name(address: &str) -> String {
    format!("writer_{}", address.replace(':', "_"))
}

pub enum Dispatcher {
    Standalone {
        writers: Vec<RedisWriter>,
        next: usize,
    },
    Cluster(ClusterWriter),
}

impl Dispatcher {
    pub async fn connect(config: &WriterConfig, status: &Status) -> Result<Self, WriterError> {
        if config.cluster {
            return Ok(Dispatcher::Cluster(ClusterWriter::connect(config, status).await?));
        }

        let count = config.connections.max(1);
        let mut writers = Vec::with_capacity(count);
        for i in 0..count {
            let mut name = writer_name(&config.address);
            if count > 1 {
                name = format!("{}_{}", name, i);
            }
            let writer_status = status.register_writer(name);
            writers.push(RedisWriter::connect(&config.address, config, writer_status).await?);
        }
        info!(address = %config.address, connections = count, "connected to target");
        Ok(Dispatcher::Standalone { writers, next: 0 })
    }

    pub async fn write(&mut self, entry: Entry) -> Result<(), WriterError> {
        match self {
            Dispatcher::Standalone { writers, next } => {
                let index = *next % writers.len();
                *next = next.wrapping_add(1);
                writers[index].write(entry).await
            }
            Dispatcher::Cluster(cluster) => cluster.write(entry).await,
        }
    }

    /// Waits until every writer has all its replies.
    pub async fn close(self) -> Result<(), WriterError> {
        match self {
            Dispatcher::Standalone { writers, .. } => {
                for writer in writers {
                    writer.close().await?;
                }
                Ok(())
            }
            Dispatcher::Cluster(cluster) => cluster.close().await,
        }
    }
}
