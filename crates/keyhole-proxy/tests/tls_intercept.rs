use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keyhole_proxy::{
    Addon, CertificateAuthority, Flow, HookFuture, MemLoader, Options, Proxy,
};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::parse_x509_certificate;

fn scrub_proxy_env() {
    for name in [
        "HTTP_PROXY",
        "http_proxy",
        "HTTPS_PROXY",
        "https_proxy",
        "NO_PROXY",
        "no_proxy",
    ] {
        std::env::remove_var(name);
    }
}

fn origin_server_config() -> Arc<ServerConfig> {
    let key = KeyPair::generate().expect("origin key");
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("origin params");
    params
        .subject_alt_names
        .push(SanType::IpAddress("127.0.0.1".parse().expect("ip")));
    let cert = params.self_signed(&key).expect("origin cert");

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .expect("origin server config");
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

async fn start_proxy(
    addons: Vec<Box<dyn Addon>>,
) -> (SocketAddr, Arc<CertificateAuthority>, JoinHandle<()>) {
    scrub_proxy_env();
    let loader = MemLoader::new();
    let ca = CertificateAuthority::new(&loader).expect("generate ca");
    let options = Options {
        insecure_skip_verify_tls: true,
        ..Options::default()
    };
    let proxy = Proxy::new(options, ca, addons).expect("build proxy");
    let ca = proxy.ca();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let task = tokio::spawn(async move {
        let _ = proxy.run_with_listener(listener).await;
    });
    (addr, ca, task)
}

fn client_config_trusting(ca: &CertificateAuthority) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(ca.root_cert_der().clone())
        .expect("trust proxy root");
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head");
        if read == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

#[derive(Default)]
struct StatusRecorder {
    responseheaders_status: AtomicUsize,
}

struct StatusAddon(Arc<StatusRecorder>);

impl Addon for StatusAddon {
    fn responseheaders<'a>(&'a self, flow: &'a mut Flow) -> HookFuture<'a, ()> {
        if let Some(response) = flow.response.as_ref() {
            self.0
                .responseheaders_status
                .store(response.status as usize, Ordering::SeqCst);
        }
        Box::pin(async {})
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn https_interception_presents_a_leaf_chained_to_the_root() {
    let recorder = Arc::new(StatusRecorder::default());
    let (proxy_addr, ca, proxy_task) =
        start_proxy(vec![Box::new(StatusAddon(Arc::clone(&recorder)))]).await;

    let origin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin_listener.local_addr().expect("origin addr");
    let origin_task = tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(origin_server_config());
        let (tcp, _) = origin_listener.accept().await.expect("accept origin");
        let mut tls = acceptor.accept(tcp).await.expect("origin TLS accept");

        let head = read_head(&mut tls).await;
        assert!(head.starts_with("GET /v1/ping HTTP/1.1"), "{head}");
        tls.write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
            .await
            .expect("origin response");
        tls.shutdown().await.expect("origin shutdown");
    });

    let mut tcp = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_addr.port()
    );
    tcp.write_all(connect.as_bytes()).await.expect("send CONNECT");
    let connect_response = read_head(&mut tcp).await;
    assert!(
        connect_response.starts_with("HTTP/1.1 200 Connection Established"),
        "{connect_response}"
    );

    let connector = TlsConnector::from(client_config_trusting(&ca));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS connect through proxy");

    // The certificate the client sees is a proxy-issued leaf for the CONNECT
    // authority, chained to the configured root.
    {
        let (_, session) = tls.get_ref();
        let presented = session
            .peer_certificates()
            .expect("peer certificates")
            .first()
            .expect("leaf certificate")
            .clone();
        let (_, leaf) = parse_x509_certificate(presented.as_ref()).expect("parse leaf");
        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .expect("leaf cn")
            .as_str()
            .expect("leaf cn utf8");
        assert_eq!(cn, "127.0.0.1");
        let issuer_cn = leaf
            .issuer()
            .iter_common_name()
            .next()
            .expect("issuer cn")
            .as_str()
            .expect("issuer cn utf8");
        assert_eq!(issuer_cn, "keyhole proxy CA");
    }

    tls.write_all(b"GET /v1/ping HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .expect("send request");
    tls.flush().await.expect("flush request");

    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 204"), "{response}");

    origin_task.await.expect("origin task");
    assert_eq!(recorder.responseheaders_status.load(Ordering::SeqCst), 204);
    proxy_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_origin_session_carries_sequential_intercepted_flows() {
    let (proxy_addr, ca, proxy_task) = start_proxy(Vec::new()).await;

    let origin_accepts = Arc::new(AtomicUsize::new(0));
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin_listener.local_addr().expect("origin addr");
    let origin_task = {
        let origin_accepts = Arc::clone(&origin_accepts);
        tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(origin_server_config());
            let (tcp, _) = origin_listener.accept().await.expect("accept origin");
            origin_accepts.fetch_add(1, Ordering::SeqCst);
            let mut tls = acceptor.accept(tcp).await.expect("origin TLS accept");
            for _ in 0..2 {
                let _ = read_head(&mut tls).await;
                tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .await
                    .expect("origin response");
            }
        })
    };

    let mut tcp = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_addr.port()
    );
    tcp.write_all(connect.as_bytes()).await.expect("send CONNECT");
    let connect_response = read_head(&mut tcp).await;
    assert!(connect_response.starts_with("HTTP/1.1 200"), "{connect_response}");

    let connector = TlsConnector::from(client_config_trusting(&ca));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS connect through proxy");

    for _ in 0..2 {
        tls.write_all(b"GET /seq HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .expect("send request");
        tls.flush().await.expect("flush request");

        let mut collected = Vec::new();
        let mut chunk = [0_u8; 512];
        while !collected.ends_with(b"ok") {
            let read = tls.read(&mut chunk).await.expect("read response");
            assert!(read > 0, "proxy closed the intercepted session early");
            collected.extend_from_slice(&chunk[..read]);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    }

    drop(tls);
    origin_task.await.expect("origin task");
    assert_eq!(origin_accepts.load(Ordering::SeqCst), 1);
    proxy_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_origin_handshake_aborts_the_client_handshake() {
    let (proxy_addr, ca, proxy_task) = start_proxy(Vec::new()).await;

    // An origin that speaks no TLS at all: the proxy's origin handshake
    // fails, so the client must see its own handshake die rather than a
    // forged certificate.
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin_listener.local_addr().expect("origin addr");
    tokio::spawn(async move {
        let (mut tcp, _) = origin_listener.accept().await.expect("accept origin");
        let mut sink = [0_u8; 1024];
        let _ = tcp.read(&mut sink).await;
        // Slam the door without answering the handshake.
    });

    let mut tcp = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_addr.port()
    );
    tcp.write_all(connect.as_bytes()).await.expect("send CONNECT");
    let connect_response = read_head(&mut tcp).await;
    assert!(connect_response.starts_with("HTTP/1.1 200"), "{connect_response}");

    let connector = TlsConnector::from(client_config_trusting(&ca));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    let result = tokio::time::timeout(
        Duration::from_secs(15),
        connector.connect(server_name, tcp),
    )
    .await
    .expect("client handshake must resolve");
    assert!(result.is_err(), "client handshake unexpectedly succeeded");

    proxy_task.abort();
}
