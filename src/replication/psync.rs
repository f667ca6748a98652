//! PSYNC handshake, snapshot framing and live-stream decoding.
//!
//! ```text
//! replica                               master
//!   REPLCONF listening-port <port>  ──>
//!                                   <──  +OK
//!   PSYNC <replid|?> <offset|-1>    ──>
//!                                   <──  \n\n+FULLRESYNC <replid> <offset>\r\n
//!                                   <──  \n\n$<len>\r\n<len raw bytes>     (no CRLF)
//!                                   <──  *3\r\n$3\r\nSET\r\n...           (forever)
//!        or
//!                                   <──  +CONTINUE [<replid>]\r\n
//!                                   <──  *3\r\n$3\r\nSET\r\n...
//! ```
//!
//! Bare `\n` bytes before `+` or `$` are keepalives sent while the master
//! prepares its reply.

use super::checkpoint::Checkpoint;
use super::ReplicationError;
use crate::connection::{CommandSink, ReplyReader};
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsyncReply {
    FullResync { replid: String, offset: u64 },
    Continue { replid: Option<String> },
}

/// Announces the listening port and sends `PSYNC`.
///
/// With a checkpoint the master is asked to continue from it.
pub async fn handshake<R, W>(
    reader: &mut ReplyReader<R>,
    sink: &mut CommandSink<W>,
    listening_port: u16,
    resume: Option<&Checkpoint>,
) -> Result<PsyncReply, ReplicationError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let port = listening_port.to_string();
    sink.send(&["REPLCONF", "listening-port", port.as_str()]).await?;
    match reader.read_reply().await? {
        RespValue::SimpleString(s) if s == "OK" => {}
        other => warn!(addr = %reader.addr(), reply = %other, "REPLCONF listening-port not accepted"),
    }

    let (replid, offset) = match resume {
        Some(cp) => cp.psync_args(),
        None => ("?".to_string(), "-1".to_string()),
    };
    info!(addr = %reader.addr(), replid = %replid, offset = %offset, "sending PSYNC");
    sink.send(&["PSYNC", replid.as_str(), offset.as_str()]).await?;

    match skip_keepalives(reader).await? {
        b'+' => {}
        b'-' => {
            let msg = reader.read_line().await?;
            return Err(ReplicationError::Rejected(msg));
        }
        other => return Err(ReplicationError::Framing { expected: '+', found: other }),
    }
    let line = reader.read_line().await?;
    let reply = parse_psync_reply(&line)?;
    info!(addr = %reader.addr(), reply = %line, "PSYNC accepted");
    Ok(reply)
}

pub fn parse_psync_reply(line: &str) -> Result<PsyncReply, ReplicationError> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("FULLRESYNC") => {
            let replid = words.next();
            let offset = words.next().and_then(|o| o.parse().ok());
            match (replid, offset) {
                (Some(replid), Some(offset)) => Ok(PsyncReply::FullResync {
                    replid: replid.to_string(),
                    offset,
                }),
                _ => Err(ReplicationError::InvalidPsyncReply(line.to_string())),
            }
        }
        Some("CONTINUE") => Ok(PsyncReply::Continue {
            replid: words.next().map(str::to_string),
        }),
        _ => Err(ReplicationError::InvalidPsyncReply(line.to_string())),
    }
}

async fn skip_keepalives<R: AsyncRead + Unpin>(
    reader: &mut ReplyReader<R>,
) -> Result<u8, ReplicationError> {
    loop {
        let b = reader.read_byte().await?;
        if b != b'\n' {
            return Ok(b);
        }
    }
}

/// Reads `$<len>\r\n`, skipping keepalives, and returns the snapshot length.
pub async fn read_snapshot_header<R: AsyncRead + Unpin>(
    reader: &mut ReplyReader<R>,
) -> Result<u64, ReplicationError> {
    match skip_keepalives(reader).await? {
        b'$' => {}
        other => return Err(ReplicationError::Framing { expected: '$', found: other }),
    }
    let line = reader.read_line().await?;
    line.trim()
        .parse()
        .map_err(|_| ReplicationError::InvalidSnapshotLength(line))
}

/// Copies the snapshot payload to `out`. Exactly `len` bytes are consumed;
/// there is no trailing CRLF.
pub async fn receive_snapshot<R, W, F>(
    reader: &mut ReplyReader<R>,
    len: u64,
    out: &mut W,
    progress: F,
) -> Result<(), ReplicationError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    reader.copy_exact(len, out, progress).await?;
    Ok(())
}

/// What the live decoder does with a command.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveCommand {
    /// Switch the current database.
    Select(u32),
    /// Keepalive or provider control traffic, consumed silently.
    Control,
    Forward(Vec<Bytes>),
}

pub fn classify(argv: Vec<Bytes>) -> Result<LiveCommand, ReplicationError> {
    let Some(name) = argv.first() else {
        return Err(ReplicationError::InvalidCommand("empty command".to_string()));
    };
    if name.eq_ignore_ascii_case(b"SELECT") {
        let db = argv
            .get(1)
            .and_then(|d| std::str::from_utf8(d).ok())
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| ReplicationError::InvalidCommand(format!("{:?}", argv)))?;
        return Ok(LiveCommand::Select(db));
    }
    let control = name.eq_ignore_ascii_case(b"PING")
        || name.eq_ignore_ascii_case(b"REPLCONF")
        || name.eq_ignore_ascii_case(b"OPINFO")
        || (name.eq_ignore_ascii_case(b"PUBLISH")
            && argv
                .get(1)
                .map(|c| c.eq_ignore_ascii_case(b"__sentinel__:hello"))
                .unwrap_or(false));
    if control {
        Ok(LiveCommand::Control)
    } else {
        Ok(LiveCommand::Forward(argv))
    }
}

/// Incremental decoder for the live command stream.
///
/// Bytes are fed in as they arrive; every decoded command comes out with the
/// replication offset just past it.
pub struct LiveDecoder {
    buffer: BytesMut,
    parser: RespParser,
    offset: u64,
}

impl LiveDecoder {
    pub fn new(offset: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            parser: RespParser::new(),
            offset,
        }
    }

    /// Offset just past the last decoded command.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes received but not yet part of a complete command.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_command(&mut self) -> Result<Option<(Vec<Bytes>, u64)>, ReplicationError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let Some((value, consumed)) = self.parser.parse(&self.buffer)? else {
            return Ok(None);
        };
        self.buffer.advance(consumed);
        self.offset += consumed as u64;
        match value.into_argv() {
            Some(argv) if !argv.is_empty() => Ok(Some((argv, self.offset))),
            _ => Err(ReplicationError::Parse(ParseError::ProtocolError(format!(
                "expected a command at offset {}",
                self.offset - consumed as u64
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn argv(args: &[&str]) -> Vec<Bytes> {
        args.iter().map(|a| Bytes::from(a.to_string())).collect()
    }

    #[tokio::test]
    async fn test_full_resync_then_snapshot_then_live() {
        let mock = Builder::new()
            .write(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .read(b"+OK\r\n")
            .write(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .read(b"\n\n+FULLRESYNC abc123 100\r\n")
            .read(b"\n$5\r\nAAAAA*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n*1\r\n$4\r\nPI")
            .read(b"NG\r\n")
            .build();
        let (rd, wr) = tokio::io::split(mock);
        let mut reader = ReplyReader::new(rd, "mock");
        let mut sink = CommandSink::new(wr);

        let reply = handshake(&mut reader, &mut sink, 6380, None).await.unwrap();
        assert_eq!(
            reply,
            PsyncReply::FullResync {
                replid: "abc123".to_string(),
                offset: 100
            }
        );

        let len = read_snapshot_header(&mut reader).await.unwrap();
        assert_eq!(len, 5);
        let mut snapshot = Vec::new();
        receive_snapshot(&mut reader, len, &mut snapshot, |_| {}).await.unwrap();
        assert_eq!(snapshot, b"AAAAA");

        // Everything after the payload belongs to the live stream.
        let mut decoder = LiveDecoder::new(100);
        let mut chunk = BytesMut::new();
        while decoder.pending() < 37 {
            reader.read_chunk(&mut chunk).await.unwrap();
            decoder.feed(&chunk);
            chunk.clear();
        }
        let (cmd, offset) = decoder.next_command().unwrap().unwrap();
        assert_eq!(cmd, argv(&["SELECT", "3"]));
        assert_eq!(offset, 100 + 23);
        assert_eq!(classify(cmd).unwrap(), LiveCommand::Select(3));

        let (cmd, offset) = decoder.next_command().unwrap().unwrap();
        assert_eq!(offset, 100 + 23 + 14);
        assert_eq!(classify(cmd).unwrap(), LiveCommand::Control);
        assert_eq!(decoder.next_command().unwrap(), None);
    }

    #[tokio::test]
    async fn test_continue_with_checkpoint() {
        let replid = "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb";
        let cp = Checkpoint::new(replid, 500, 0);
        let mock = Builder::new()
            .write(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .read(b"-ERR unknown\r\n")
            .write(
                format!("*3\r\n$5\r\nPSYNC\r\n$40\r\n{}\r\n$3\r\n501\r\n", replid).as_bytes(),
            )
            .read(b"+CONTINUE\r\n")
            .build();
        let (rd, wr) = tokio::io::split(mock);
        let mut reader = ReplyReader::new(rd, "mock");
        let mut sink = CommandSink::new(wr);
        let reply = handshake(&mut reader, &mut sink, 6380, Some(&cp)).await.unwrap();
        assert_eq!(reply, PsyncReply::Continue { replid: None });
    }

    #[tokio::test]
    async fn test_unexpected_framing_byte() {
        let mock = Builder::new().read(b"\n\nX").build();
        let mut reader = ReplyReader::new(mock, "mock");
        assert!(matches!(
            read_snapshot_header(&mut reader).await,
            Err(ReplicationError::Framing { expected: '$', found: b'X' })
        ));
    }

    #[test]
    fn test_parse_psync_reply() {
        assert_eq!(
            parse_psync_reply("CONTINUE 8371b4fb").unwrap(),
            PsyncReply::Continue {
                replid: Some("8371b4fb".to_string())
            }
        );
        assert!(parse_psync_reply("FULLRESYNC abc").is_err());
        assert!(parse_psync_reply("FULLRESYNC abc x").is_err());
        assert!(parse_psync_reply("NOMASTERLINK").is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(argv(&["publish", "__sentinel__:hello", "x"])).unwrap(),
            LiveCommand::Control
        );
        assert_eq!(classify(argv(&["REPLCONF", "GETACK", "*"])).unwrap(), LiveCommand::Control);
        assert_eq!(classify(argv(&["opinfo", "x"])).unwrap(), LiveCommand::Control);
        assert_eq!(
            classify(argv(&["PUBLISH", "news", "x"])).unwrap(),
            LiveCommand::Forward(argv(&["PUBLISH", "news", "x"]))
        );
        assert!(classify(argv(&["SELECT", "x"])).is_err());
    }

    #[test]
    fn test_decoder_rejects_non_commands() {
        let mut decoder = LiveDecoder::new(0);
        decoder.feed(b":1\r\n");
        assert!(decoder.next_command().is_err());
    }

    #[test]
    fn test_decoder_waits_for_complete_command() {
        let mut decoder = LiveDecoder::new(10);
        decoder.feed(b"*2\r\n$3\r\nDEL\r\n$1\r");
        assert_eq!(decoder.next_command().unwrap(), None);
        decoder.feed(b"\nk\r\n");
        let (cmd, offset) = decoder.next_command().unwrap().unwrap();
        assert_eq!(cmd, argv(&["DEL", "k"]));
        assert_eq!(offset, 10 + 20);
    }
}
