//! Redis Client Connection
//!
//! A thin client over any `AsyncRead + AsyncWrite` stream. It is split in
//! two halves so that sending and reading replies can run in different tasks:
//!
//! ```text
//!              RedisClient<S>
//!           ┌────────┴─────────┐
//!           ▼                  ▼
//!    CommandSink<W>      ReplyReader<R>
//!    encode + flush      BytesMut buffer ──> RespParser
//!                        raw reads (PSYNC snapshot, live stream bytes)
//! ```
//!
//! Replies come back as [`RespValue`] and callers match on them explicitly;
//! a reply of the wrong shape is a [`ConnectionError::UnexpectedReply`].
//!
//! ## Buffer Management
//!
//! The reader owns a BytesMut buffer that accumulates socket data. TCP is a
//! stream protocol, so a read may end halfway through a reply or carry
//! several. Raw reads (`read_byte`, `read_line`, `copy_exact`, `read_chunk`)
//! always drain what is buffered before touching the socket again, so
//! switching between RESP parsing and raw framing never loses bytes.

use crate::protocol::parser::{line_too_long, MAX_LINE_LENGTH};
use crate::protocol::{encode_command, ParseError, RespParser, RespValue};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use super::tls::{RedisStream, TlsOptions};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 16 * 1024;

/// Minimum free space kept in the buffer before a socket read
const READ_RESERVE: usize = 64 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur on a client connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// RESP parse error
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// The server answered with an error reply
    #[error("server error: {0}")]
    ServerError(String),

    /// The reply had a different shape than the command calls for
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    /// Connecting did not finish in time
    #[error("timed out connecting to {0}")]
    Timeout(String),

    /// The server closed the connection cleanly
    #[error("connection closed")]
    Closed,

    /// The server closed the connection in the middle of a reply
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("invalid CLUSTER NODES line: {0}")]
    InvalidClusterNodes(String),

    /// TLS setup failed before the handshake started
    #[error("TLS error: {0}")]
    Tls(String),
}

impl ConnectionError {
    pub(crate) fn unexpected(command: impl Into<String>, reply: &RespValue) -> Self {
        ConnectionError::UnexpectedReply {
            command: command.into(),
            reply: reply.to_string(),
        }
    }
}

/// Username/password pair sent with `AUTH`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Reads replies and raw bytes from one side of a connection.
pub struct ReplyReader<R> {
    inner: R,
    buffer: BytesMut,
    parser: RespParser,
    addr: String,
}

impl<R: AsyncRead + Unpin> ReplyReader<R> {
    pub fn new(inner: R, addr: impl Into<String>) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Bytes received but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Reads one RESP value and returns it with its encoded size.
    ///
    /// Error replies are returned as [`RespValue::Error`], not as `Err`.
    pub async fn read_value(&mut self) -> Result<(RespValue, usize), ConnectionError> {
        loop {
            if !self.buffer.is_empty() {
                if let Some((value, consumed)) = self.parser.parse(&self.buffer)? {
                    self.buffer.advance(consumed);
                    trace!(
                        addr = %self.addr,
                        consumed = consumed,
                        remaining = self.buffer.len(),
                        "Parsed reply"
                    );
                    return Ok((value, consumed));
                }
            }
            self.fill().await?;
        }
    }

    pub async fn read_reply(&mut self) -> Result<RespValue, ConnectionError> {
        Ok(self.read_value().await?.0)
    }

    pub async fn read_byte(&mut self) -> Result<u8, ConnectionError> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffer.get_u8())
    }

    /// Reads up to and including `\n`, returning the line without `\r\n`.
    /// Lines longer than [`MAX_LINE_LENGTH`] are a protocol error.
    pub async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buffer[scanned..].iter().position(|&b| b == b'\n') {
                if scanned + pos > MAX_LINE_LENGTH + 1 {
                    return Err(line_too_long().into());
                }
                let line = self.buffer.split_to(scanned + pos + 1);
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end_matches(['\r', '\n']).to_string());
            }
            if self.buffer.len() > MAX_LINE_LENGTH + 1 {
                return Err(line_too_long().into());
            }
            scanned = self.buffer.len();
            self.fill().await?;
        }
    }

    /// Copies exactly `len` raw bytes to `out`, calling `progress` with the
    /// running total after every write.
    pub async fn copy_exact<W, F>(
        &mut self,
        len: u64,
        out: &mut W,
        mut progress: F,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(u64),
    {
        let mut copied = 0u64;
        while copied < len {
            if self.buffer.is_empty() {
                self.fill().await?;
            }
            let take = (len - copied).min(self.buffer.len() as u64) as usize;
            out.write_all(&self.buffer[..take]).await?;
            self.buffer.advance(take);
            copied += take as u64;
            progress(copied);
        }
        out.flush().await?;
        Ok(())
    }

    /// Moves whatever is available into `out`: buffered bytes first, then a
    /// single socket read. Returns 0 at end of stream.
    pub async fn read_chunk(&mut self, out: &mut BytesMut) -> Result<usize, ConnectionError> {
        if !self.buffer.is_empty() {
            let n = self.buffer.len();
            out.extend_from_slice(&self.buffer);
            self.buffer.clear();
            return Ok(n);
        }
        out.reserve(READ_RESERVE);
        Ok(self.inner.read_buf(out).await?)
    }

    /// Reads more data from the stream into the buffer.
    async fn fill(&mut self) -> Result<usize, ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < READ_RESERVE / 4 {
            self.buffer.reserve(READ_RESERVE);
        }
        let n = self.inner.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(if self.buffer.is_empty() {
                ConnectionError::Closed
            } else {
                ConnectionError::UnexpectedEof
            });
        }
        trace!(addr = %self.addr, bytes = n, "Read data");
        Ok(n)
    }
}

/// Writes encoded commands to one side of a connection.
pub struct CommandSink<W: AsyncWrite> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> CommandSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    /// Encodes, writes and flushes one command. Returns the encoded size.
    pub async fn send<T: AsRef<[u8]>>(&mut self, args: &[T]) -> Result<usize, ConnectionError> {
        let bytes = encode_command(args);
        self.send_raw(&bytes).await?;
        Ok(bytes.len())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes without flushing; pair with [`flush`](Self::flush).
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// A request/reply client, used for handshakes and topology queries.
pub struct RedisClient<S: AsyncRead + AsyncWrite> {
    reader: ReplyReader<ReadHalf<S>>,
    sink: CommandSink<WriteHalf<S>>,
}

impl RedisClient<RedisStream> {
    /// Connects, runs the TLS handshake when enabled, authenticates when a
    /// password is set, and checks `PING`.
    pub async fn connect(
        addr: &str,
        credentials: &Credentials,
        tls: &TlsOptions,
    ) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let tcp = TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            RedisStream::wrap(tcp, addr, tls).await
        })
        .await
        .map_err(|_| ConnectionError::Timeout(addr.to_string()))??;

        let mut client = RedisClient::new(stream, addr);
        client.auth(credentials).await?;
        client.ping().await?;
        info!(addr = %addr, tls = tls.enabled, "Connected to redis");
        Ok(client)
    }
}

impl<S: AsyncRead + AsyncWrite> RedisClient<S> {
    pub fn new(stream: S, addr: impl Into<String>) -> Self {
        let (rd, wr) = split(stream);
        Self {
            reader: ReplyReader::new(rd, addr),
            sink: CommandSink::new(wr),
        }
    }

    pub fn addr(&self) -> &str {
        self.reader.addr()
    }

    pub fn reader(&mut self) -> &mut ReplyReader<ReadHalf<S>> {
        &mut self.reader
    }

    pub fn sink(&mut self) -> &mut CommandSink<WriteHalf<S>> {
        &mut self.sink
    }

    pub fn into_split(self) -> (ReplyReader<ReadHalf<S>>, CommandSink<WriteHalf<S>>) {
        (self.reader, self.sink)
    }

    /// Sends a command and reads its reply; error replies become `Err`.
    pub async fn request<T: AsRef<[u8]>>(&mut self, args: &[T]) -> Result<RespValue, ConnectionError> {
        self.sink.send(args).await?;
        match self.reader.read_reply().await? {
            RespValue::Error(msg) => Err(ConnectionError::ServerError(msg)),
            reply => Ok(reply),
        }
    }

    /// Sends a command that must answer with a string reply.
    pub async fn request_string<T: AsRef<[u8]>>(&mut self, args: &[T]) -> Result<String, ConnectionError> {
        let reply = self.request(args).await?;
        match reply.as_str() {
            Some(s) => Ok(s.to_string()),
            None => Err(ConnectionError::unexpected(command_text(args), &reply)),
        }
    }

    pub async fn auth(&mut self, credentials: &Credentials) -> Result<(), ConnectionError> {
        if credentials.password.is_empty() {
            return Ok(());
        }
        let reply = if credentials.username.is_empty() {
            self.request_string(&["AUTH", credentials.password.as_str()]).await?
        } else {
            self.request_string(&[
                "AUTH",
                credentials.username.as_str(),
                credentials.password.as_str(),
            ])
            .await?
        };
        if reply != "OK" {
            return Err(ConnectionError::UnexpectedReply {
                command: "AUTH".to_string(),
                reply,
            });
        }
        debug!(addr = %self.addr(), "authenticated");
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        let reply = self.request_string(&["PING"]).await?;
        if reply != "PONG" {
            return Err(ConnectionError::UnexpectedReply {
                command: "PING".to_string(),
                reply,
            });
        }
        Ok(())
    }
}

fn command_text<T: AsRef<[u8]>>(args: &[T]) -> String {
    args.iter()
        .map(|a| String::from_utf8_lossy(a.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_values_across_reads() {
        let mock = Builder::new()
            .read(b"+OK\r\n$5\r\nhel")
            .read(b"lo\r\n:42\r\n")
            .build();
        let mut rd = ReplyReader::new(mock, "mock");
        assert_eq!(rd.read_value().await.unwrap(), (RespValue::ok(), 5));
        assert_eq!(
            rd.read_reply().await.unwrap(),
            RespValue::bulk_string("hello")
        );
        assert_eq!(rd.read_reply().await.unwrap(), RespValue::integer(42));
        assert!(matches!(rd.read_reply().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_partial_reply_at_eof() {
        let mock = Builder::new().read(b"$10\r\nabc").build();
        let mut rd = ReplyReader::new(mock, "mock");
        assert!(matches!(
            rd.read_reply().await,
            Err(ConnectionError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_raw_reads_share_buffer() {
        let mock = Builder::new()
            .read(b"\n\n+FULLRESYNC abc 7\r\n$4\r\nRDB!*1\r\n$4\r\nPING\r\n")
            .build();
        let mut rd = ReplyReader::new(mock, "mock");
        assert_eq!(rd.read_byte().await.unwrap(), b'\n');
        assert_eq!(rd.read_byte().await.unwrap(), b'\n');
        assert_eq!(rd.read_byte().await.unwrap(), b'+');
        assert_eq!(rd.read_line().await.unwrap(), "FULLRESYNC abc 7");
        assert_eq!(rd.read_byte().await.unwrap(), b'$');
        assert_eq!(rd.read_line().await.unwrap(), "4");

        let mut out = Vec::new();
        let mut seen = 0;
        rd.copy_exact(4, &mut out, |n| seen = n).await.unwrap();
        assert_eq!(out, b"RDB!");
        assert_eq!(seen, 4);

        let (value, size) = rd.read_value().await.unwrap();
        assert_eq!(value, RespValue::command(["PING"]));
        assert_eq!(size, 14);
    }

    #[tokio::test]
    async fn test_read_line_is_bounded() {
        let garbage = vec![b'x'; MAX_LINE_LENGTH + 2];
        let mock = Builder::new().read(&garbage).build();
        let mut rd = ReplyReader::new(mock, "mock");
        assert!(matches!(
            rd.read_line().await,
            Err(ConnectionError::ParseError(ParseError::ProtocolError(_)))
        ));
    }

    #[tokio::test]
    async fn test_read_line_at_limit() {
        let mut line = vec![b'y'; MAX_LINE_LENGTH];
        line.extend_from_slice(b"\r\n");
        let mock = Builder::new().read(&line).build();
        let mut rd = ReplyReader::new(mock, "mock");
        assert_eq!(rd.read_line().await.unwrap().len(), MAX_LINE_LENGTH);
    }

    #[tokio::test]
    async fn test_read_chunk_drains_buffer_first() {
        let mock = Builder::new().read(b"+OK\r\nleft").read(b"over").build();
        let mut rd = ReplyReader::new(mock, "mock");
        rd.read_reply().await.unwrap();
        let mut out = BytesMut::new();
        assert_eq!(rd.read_chunk(&mut out).await.unwrap(), 4);
        assert_eq!(rd.read_chunk(&mut out).await.unwrap(), 4);
        assert_eq!(&out[..], b"leftover");
        assert_eq!(rd.read_chunk(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_request_and_auth() {
        let mock = Builder::new()
            .write(b"*3\r\n$4\r\nAUTH\r\n$4\r\nuser\r\n$4\r\npass\r\n")
            .read(b"+OK\r\n")
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"+PONG\r\n")
            .write(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .read(b"-ERR wrong kind\r\n")
            .build();
        let mut client = RedisClient::new(mock, "mock");
        client.auth(&Credentials::new("user", "pass")).await.unwrap();
        client.ping().await.unwrap();
        assert!(matches!(
            client.request(&["GET", "k"]).await,
            Err(ConnectionError::ServerError(msg)) if msg == "ERR wrong kind"
        ));
    }

    #[tokio::test]
    async fn test_auth_skipped_without_password() {
        let mock = Builder::new().build();
        let mut client = RedisClient::new(mock, "mock");
        client.auth(&Credentials::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_plain_handshake() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let ping = b"*1\r\n$4\r\nPING\r\n";
            let mut buf = vec![0u8; ping.len()];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf[..], &ping[..]);
            sock.write_all(b"+PONG\r\n").await.unwrap();
        });

        let client = RedisClient::connect(&addr, &Credentials::default(), &TlsOptions::default())
            .await
            .unwrap();
        assert_eq!(client.addr(), addr);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_reply_shape() {
        let mock = Builder::new()
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b":1\r\n")
            .build();
        let mut client = RedisClient::new(mock, "mock");
        assert!(matches!(
            client.ping().await,
            Err(ConnectionError::UnexpectedReply { .. })
        ));
    }
}
