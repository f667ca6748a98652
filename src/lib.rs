//! # FlashSync - Redis Replication Ingestion
//!
//! FlashSync attaches to a Redis master as a replica, decodes the RDB
//! snapshot it receives, follows the live command stream, and replays
//! everything into another Redis deployment, standalone or cluster.
//!
//! ## Features
//!
//! - **RDB decoding**: every on-disk encoding up to RDB version 12, including
//!   ziplists, listpacks, intsets, quicklists, streams and module values
//! - **PSYNC replication**: full and partial resync, periodic ACKs, resume
//!   from a persisted checkpoint
//! - **Filtering**: allow/block lists on keys, databases, commands and
//!   command groups, plus key-prefix rewriting
//! - **Cluster aware**: slot-routed writes with CROSSSLOT detection
//! - **Backpressure**: pipelined writers bounded by unanswered bytes
//! - **TLS**: optional rustls transport on either side
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FlashSync                                  │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌──────────────┐   ┌────────────────────────┐  │
//! │  │ ReplicationSession│──>│   Pipeline   │──>│      Dispatcher        │  │
//! │  │ PSYNC + RDB +     │   │ filter,      │   │ ┌────────┐ ┌────────┐  │  │
//! │  │ live stream       │   │ transform    │   │ │Writer 0│ │Writer N│  │  │
//! │  └────────┬─────────┘   └──────────────┘   │ └────────┘ └────────┘  │  │
//! │           │                                 └────────────────────────┘  │
//! │           ▼                                                             │
//! │  ┌──────────────────┐   ┌──────────────────────────────────────────┐  │
//! │  │  work_dir/*.aof  │   │ Status (phases, offsets, unanswered bytes)│  │
//! │  │  checkpoint      │   │ logged by StatusReporter                   │  │
//! │  └──────────────────┘   └──────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashsync::config::Config;
//! use flashsync::pipeline::Pipeline;
//! use flashsync::replication::ReplicationSession;
//! use flashsync::status::Status;
//! use flashsync::writer::Dispatcher;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! let config = Config::default();
//! let status = Arc::new(Status::new());
//! let (tx, mut rx) = mpsc::channel(1024);
//!
//! let session = ReplicationSession::new(
//!     config.session_config(&config.source.address),
//!     status.register_reader("source"),
//! );
//! tokio::spawn(session.run(tx));
//!
//! let mut pipeline = Pipeline::new(config.filter.clone(), Arc::clone(&status.entries));
//! let mut dispatcher = Dispatcher::connect(&config.writer_config(), &status).await?;
//! while let Some(entry) = rx.recv().await {
//!     for entry in pipeline.process(entry) {
//!         dispatcher.write(entry).await?;
//!     }
//! }
//! dispatcher.close().await?;
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values, incremental parser, command encoding
//! - [`rdb`]: RDB decoding and the snapshot [`rdb::Loader`]
//! - [`replication`]: PSYNC session, AOF segment buffering, checkpoints
//! - [`commands`]: command key table and cluster slots
//! - [`entry`]: the [`Entry`] passed between stages
//! - [`pipeline`]: filtering and transforms
//! - [`writer`]: target connections and dispatch
//! - [`connection`]: client connections and cluster topology
//! - [`status`]: progress counters and the consistency flag
//! - [`config`]: TOML configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod entry;
pub mod pipeline;
pub mod protocol;
pub mod rdb;
pub mod replication;
pub mod status;
pub mod writer;

// Re-export commonly used types for convenience
pub use config::Config;
pub use entry::Entry;
pub use pipeline::Pipeline;
pub use protocol::{ParseError, RespParser, RespValue};
pub use replication::{ReplicationError, ReplicationSession};
pub use status::{Status, StatusReporter};
pub use writer::{Dispatcher, WriterError};

/// Version of FlashSync
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
