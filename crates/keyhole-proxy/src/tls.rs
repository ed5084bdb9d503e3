use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::client_hello::ClientHelloSummary;
use crate::connection::TlsSnapshot;

const TLS12_WIRE: u16 = 0x0303;
const TLS13_WIRE: u16 = 0x0304;

/// Upstream TLS config mirroring what the client offered: same SNI is applied
/// at connect time, min/max of the offered versions, the offered cipher
/// suites intersected with the provider, ALPN pinned to http/1.1 so the
/// HTTP/1 engine stays in charge.
pub(crate) fn mirrored_client_config(
    hello: &ClientHelloSummary,
    insecure_skip_verify: bool,
) -> Result<ClientConfig, rustls::Error> {
    let mut provider = aws_lc_rs::default_provider();
    let offered = &hello.cipher_suites;
    let mirrored: Vec<_> = provider
        .cipher_suites
        .iter()
        .copied()
        .filter(|suite| offered.contains(&u16::from(suite.suite())))
        .collect();
    // An empty intersection would make the config unbuildable; fall back to
    // the provider defaults and let the origin pick.
    if !mirrored.is_empty() {
        provider.cipher_suites = mirrored;
    }

    let versions = mirrored_versions(&hello.effective_versions());
    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)?;

    let mut config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerify))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.key_log = keyhole_ca::process_key_log();
    Ok(config)
}

/// Plain upstream TLS config for dials that did not originate from a peeked
/// ClientHello (absolute-form https requests on the plaintext listener).
pub(crate) fn default_client_config(insecure_skip_verify: bool) -> ClientConfig {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerify))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.key_log = keyhole_ca::process_key_log();
    config
}

fn mirrored_versions(offered: &[u16]) -> Vec<&'static SupportedProtocolVersion> {
    let min = offered.iter().copied().min().unwrap_or(TLS12_WIRE);
    let max = offered.iter().copied().max().unwrap_or(TLS13_WIRE);

    let mut versions = Vec::new();
    if max >= TLS13_WIRE {
        versions.push(&rustls::version::TLS13);
    }
    if min <= TLS12_WIRE {
        versions.push(&rustls::version::TLS12);
    }
    if versions.is_empty() {
        versions = vec![&rustls::version::TLS13, &rustls::version::TLS12];
    }
    versions
}

/// TLS-connect to the origin with the mirrored parameters. The client-facing
/// handshake must not start before this resolves, so a failed origin
/// handshake surfaces as a TLS failure to the client instead of a forged
/// certificate for a dead origin.
pub(crate) async fn handshake_origin(
    tcp: TcpStream,
    sni: &str,
    hello: &ClientHelloSummary,
    insecure_skip_verify: bool,
    timeout: Duration,
) -> io::Result<client::TlsStream<TcpStream>> {
    let config = mirrored_client_config(hello, insecure_skip_verify)
        .map_err(|error| io::Error::other(format!("upstream TLS config: {error}")))?;
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid SNI for origin TLS"))?;
    let connector = TlsConnector::from(Arc::new(config));

    tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"))?
}

pub(crate) fn origin_snapshot(stream: &client::TlsStream<TcpStream>, sni: &str) -> TlsSnapshot {
    let (_, session) = stream.get_ref();
    TlsSnapshot {
        sni: sni.to_string(),
        version: session
            .protocol_version()
            .map(|version| format!("{version:?}")),
        cipher_suite: session
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite())),
        alpn: session
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned()),
    }
}

/// TLS-accept the client over the peeked prefix plus the live socket.
pub(crate) async fn accept_client(
    stream: ReplayStream<TcpStream>,
    config: Arc<ServerConfig>,
    timeout: Duration,
) -> io::Result<server::TlsStream<ReplayStream<TcpStream>>> {
    let acceptor = TlsAcceptor::from(config);
    tokio::time::timeout(timeout, acceptor.accept(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"))?
}

/// A socket whose first reads replay bytes that were already peeked off the
/// wire; writes pass straight through.
pub(crate) struct ReplayStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let take = (this.prefix.len() - this.offset).min(buf.remaining());
            buf.put_slice(&this.prefix[this.offset..this.offset + take]);
            this.offset += take;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Debug)]
struct InsecureSkipVerify;

impl ServerCertVerifier for InsecureSkipVerify {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
