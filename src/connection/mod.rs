//! Client Connections
//!
//! Everything that talks to a Redis server goes through this module: the
//! replication session reading from the source, and the writers replaying
//! into the target.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RedisClient<S>                           │
//! │   connect ─> AUTH ─> PING ─> request / reply                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ into_split()
//!           ┌────────────┴────────────┐
//!           ▼                         ▼
//! ┌───────────────────┐     ┌───────────────────────┐
//! │  CommandSink<W>   │     │    ReplyReader<R>     │
//! │  dispatch task    │     │  reply-drain task or  │
//! │  or ACK task      │     │  PSYNC stream reader  │
//! └───────────────────┘     └───────────────────────┘
//! ```
//!
//! `tls` wraps the socket in rustls when a server requires it.
//!
//! `cluster` parses `CLUSTER NODES` into the masters and slot ranges that the
//! cluster writer and the cluster source both need.
//!
//! ## Example
//!
//! ```ignore
//! use flashsync::connection::{Credentials, RedisClient, TlsOptions};
//!
//! let tls = TlsOptions::default();
//! let mut client = RedisClient::connect("127.0.0.1:6379", &Credentials::default(), &tls).await?;
//! let info = client.request_string(&["INFO", "replication"]).await?;
//! ```

pub mod client;
pub mod cluster;
pub mod tls;

// Re-export commonly used types
pub use client::{CommandSink, ConnectionError, Credentials, RedisClient, ReplyReader};
pub use cluster::{discover_masters, parse_cluster_nodes, ClusterNode};
pub use tls::{RedisStream, TlsOptions};
