//! Cluster target: one [`RedisWriter`] per master, chosen by slot.

use super::{RedisWriter, SlotRouter, WriterConfig, WriterError};
use crate::connection::{discover_masters, RedisStream};
use crate::entry::Entry;
use crate::status::Status;
use tokio::io::AsyncWrite;
use tracing::info;

pub struct ClusterWriter<W: AsyncWrite = tokio::io::WriteHalf<RedisStream>> {
    writers: Vec<RedisWriter<W>>,
    router: SlotRouter,
}

impl ClusterWriter {
    /// Discovers the masters behind `config.address` and connects to each.
    pub async fn connect(config: &WriterConfig, status: &Status) -> Result<Self, WriterError> {
        let nodes = discover_masters(&config.address, &config.credentials, &config.tls).await?;
        let router = SlotRouter::new(&nodes)?;

        let mut writers = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let writer_status = status.register_writer(super::writer_name(&node.address));
            writers.push(RedisWriter::connect(&node.address, config, writer_status).await?);
        }
        info!(
            masters = ?nodes.iter().map(|n| n.address.as_str()).collect::<Vec<_>>(),
            "connected to target cluster"
        );
        Ok(Self { writers, router })
    }
}

impl<W: AsyncWrite + Unpin> ClusterWriter<W> {
    pub fn new(writers: Vec<RedisWriter<W>>, router: SlotRouter) -> Self {
        debug_assert_eq!(writers.len(), router.node_count());
        Self { writers, router }
    }

    /// Routes by slot. Keyless entries go to every master; entries whose
    /// keys hash to different slots are refused.
    pub async fn write(&mut self, entry: Entry) -> Result<(), WriterError> {
        match entry.single_slot() {
            Ok(Some(slot)) => {
                let index = self.router.route(slot);
                self.writers[index].write(entry).await
            }
            Ok(None) => {
                for writer in &mut self.writers {
                    writer.write(entry.clone()).await?;
                }
                Ok(())
            }
            Err(slots) => Err(WriterError::CrossSlot {
                command: entry.to_string(),
                slots,
            }),
        }
    }

    pub async fn close(self) -> Result<(), WriterError> {
        for writer in self.writers {
            writer.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::key_slot;
    use crate::connection::{ClusterNode, RedisClient};
    use crate::status::WriterStatus;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};

    fn argv(args: &[&str]) -> Vec<Bytes> {
        args.iter().map(|a| Bytes::from(a.to_string())).collect()
    }

    fn cluster() -> (ClusterWriter<WriteHalf<DuplexStream>>, Vec<DuplexStream>) {
        let nodes = vec![
            ClusterNode {
                id: "a".into(),
                address: "a:1".into(),
                slots: vec![(0, 8191)],
            },
            ClusterNode {
                id: "b".into(),
                address: "b:1".into(),
                slots: vec![(8192, 16383)],
            },
        ];
        let router = SlotRouter::new(&nodes).unwrap();
        let config = WriterConfig::default();
        let mut writers = Vec::new();
        let mut targets = Vec::new();
        for node in &nodes {
            let (ours, theirs) = duplex(1 << 16);
            let (reader, sink) = RedisClient::new(ours, node.address.clone()).into_split();
            let status = Arc::new(WriterStatus::new(node.address.clone()));
            writers.push(RedisWriter::from_parts(reader, sink, &config, status));
            targets.push(theirs);
        }
        (ClusterWriter::new(writers, router), targets)
    }

    async fn received(target: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = target.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_routes_by_slot() {
        let (mut cw, mut targets) = cluster();
        // slot 12182 belongs to the second node
        assert!(key_slot(b"foo") >= 8192);
        cw.write(Entry::new(0, argv(&["SET", "foo", "1"]))).await.unwrap();
        targets[1].write_all(b"+OK\r\n").await.unwrap();
        cw.close().await.unwrap();
        assert!(received(&mut targets[1]).await.contains("foo"));
    }

    #[tokio::test]
    async fn test_keyless_entries_are_broadcast() {
        let (mut cw, mut targets) = cluster();
        cw.write(Entry::new(0, argv(&["FLUSHALL"]))).await.unwrap();
        for target in &mut targets {
            target.write_all(b"+OK\r\n").await.unwrap();
        }
        cw.close().await.unwrap();
        for target in &mut targets {
            assert!(received(target).await.contains("FLUSHALL"));
        }
    }

    #[tokio::test]
    async fn test_cross_slot_is_refused() {
        let (mut cw, _targets) = cluster();
        let err = cw
            .write(Entry::new(0, argv(&["MSET", "foo", "1", "bar", "2"])))
            .await
            .unwrap_err();
        match err {
            WriterError::CrossSlot { slots, .. } => assert_eq!(slots, vec![5061, 12182]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hashtag_keys_share_a_slot() {
        let (mut cw, mut targets) = cluster();
        cw.write(Entry::new(0, argv(&["MSET", "{u}a", "1", "{u}b", "2"])))
            .await
            .unwrap();
        let index = if key_slot(b"u") < 8192 { 0 } else { 1 };
        targets[index].write_all(b"+OK\r\n").await.unwrap();
        cw.close().await.unwrap();
    }
}
