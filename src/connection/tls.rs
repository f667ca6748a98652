//! Plain or TLS transport under [`RedisClient`](super::RedisClient).
//!
//! Certificates are checked against the webpki root set unless
//! `insecure_skip_verify` is set, which accepts any certificate the server
//! presents (self-signed test deployments, internal CAs).

use super::ConnectionError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Transport settings for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub enabled: bool,
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    pub fn new(enabled: bool, insecure_skip_verify: bool) -> Self {
        Self {
            enabled,
            insecure_skip_verify,
        }
    }
}

/// A connected socket, encrypted or not.
pub enum RedisStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl RedisStream {
    /// Runs the TLS handshake over `tcp` when `options.enabled` is set.
    pub async fn wrap(
        tcp: TcpStream,
        addr: &str,
        options: &TlsOptions,
    ) -> Result<Self, ConnectionError> {
        if !options.enabled {
            return Ok(RedisStream::Plain(tcp));
        }
        let connector = TlsConnector::from(client_config(options.insecure_skip_verify)?);
        let domain = server_name(addr)?;
        let stream = connector.connect(domain, tcp).await?;
        debug!(addr = %addr, "TLS handshake complete");
        Ok(RedisStream::Tls(Box::new(stream)))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, RedisStream::Tls(_))
    }
}

fn client_config(insecure_skip_verify: bool) -> Result<Arc<ClientConfig>, ConnectionError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;

    let config = if insecure_skip_verify {
        warn!("TLS certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Host part of `host:port` or `[v6]:port`.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    };
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// SNI name (or IP) the certificate must match.
pub fn server_name(addr: &str) -> Result<ServerName<'static>, ConnectionError> {
    let host = host_of(addr);
    ServerName::try_from(host.to_string())
        .map_err(|e| ConnectionError::Tls(format!("invalid server name {:?}: {}", host, e)))
}

/// Signatures are still checked so the handshake is well formed; only the
/// certificate chain and name are trusted blindly.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

impl AsyncRead for RedisStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RedisStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RedisStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RedisStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RedisStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RedisStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RedisStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RedisStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RedisStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RedisStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("redis.example.com:6380"), "redis.example.com");
        assert_eq!(host_of("10.0.0.1:6379"), "10.0.0.1");
        assert_eq!(host_of("[::1]:6379"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn test_server_name() {
        assert_eq!(
            server_name("redis.example.com:6380").unwrap(),
            ServerName::try_from("redis.example.com").unwrap()
        );
        assert_eq!(
            server_name("10.0.0.1:6379").unwrap(),
            ServerName::IpAddress(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)).into())
        );
        assert_eq!(
            server_name("[::1]:6379").unwrap(),
            ServerName::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST).into())
        );
        assert!(matches!(
            server_name("bad host!:6379"),
            Err(ConnectionError::Tls(_))
        ));
    }

    #[test]
    fn test_client_configs_build() {
        assert!(client_config(false).is_ok());
        assert!(client_config(true).is_ok());
    }

    #[test]
    fn test_accept_any_certificate() {
        let verifier = AcceptAnyCertificate(Arc::new(ring::default_provider()));
        let name = ServerName::try_from("redis.internal").unwrap();
        assert!(verifier
            .verify_server_cert(
                &CertificateDer::from(vec![0u8; 4]),
                &[],
                &name,
                &[],
                UnixTime::now(),
            )
            .is_ok());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[tokio::test]
    async fn test_plain_stream_passthrough() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let tcp = TcpStream::connect(&addr).await.unwrap();
        let mut stream = RedisStream::wrap(tcp, &addr, &TlsOptions::default())
            .await
            .unwrap();
        assert!(!stream.is_tls());
        stream.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_handshake_failure_is_an_error() {
        // The peer speaks plain RESP, not TLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = sock.write_all(b"-ERR not tls\r\n").await;
        });

        let tcp = TcpStream::connect(&addr).await.unwrap();
        let result = RedisStream::wrap(tcp, &addr, &TlsOptions::new(true, true)).await;
        assert!(result.is_err());
        server.await.unwrap();
    }
}
