use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use keyhole_proxy::{
    Addon, CertificateAuthority, Flow, HookAction, HookFuture, InterceptDecision, InterceptHub,
    MemLoader, Options, Proxy,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

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

async fn start_proxy(
    addons: Vec<Box<dyn Addon>>,
) -> (SocketAddr, Arc<InterceptHub>, JoinHandle<()>) {
    scrub_proxy_env();
    let loader = MemLoader::new();
    let ca = CertificateAuthority::new(&loader).expect("generate ca");
    let proxy = Proxy::new(Options::default(), ca, addons).expect("build proxy");
    let hub = proxy.intercept_hub();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let task = tokio::spawn(async move {
        let _ = proxy.run_with_listener(listener).await;
    });
    (addr, hub, task)
}

async fn spawn_origin(response: &'static [u8]) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept origin");
        let head = read_head(&mut stream).await;
        stream.write_all(response).await.expect("origin response");
        stream.shutdown().await.expect("origin shutdown");
        head
    });
    (addr, task)
}

async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("origin read");
        if read == 0 {
            break;
        }
        head.push(byte[0]);
    }
    head
}

async fn read_to_end(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.expect("read response");
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Default)]
struct HookRecorder {
    events: Mutex<Vec<&'static str>>,
    last_status: AtomicUsize,
    last_content_len: AtomicUsize,
}

impl HookRecorder {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().expect("events lock").clone()
    }

    fn push(&self, event: &'static str) {
        self.events.lock().expect("events lock").push(event);
    }
}

struct RecordingAddon(Arc<HookRecorder>);

impl Addon for RecordingAddon {
    fn client_connected(&self, _client: &keyhole_proxy::ClientConn) {
        self.0.push("client_connected");
    }

    fn client_disconnected(&self, _client: &keyhole_proxy::ClientConn) {
        self.0.push("client_disconnected");
    }

    fn server_connected(&self, _ctx: &keyhole_proxy::ConnContext) {
        self.0.push("server_connected");
    }

    fn server_disconnected(&self, _ctx: &keyhole_proxy::ConnContext) {
        self.0.push("server_disconnected");
    }

    fn requestheaders<'a>(&'a self, _flow: &'a mut Flow) -> HookFuture<'a, ()> {
        self.0.push("requestheaders");
        Box::pin(async {})
    }

    fn request<'a>(&'a self, _flow: &'a mut Flow) -> HookFuture<'a, HookAction> {
        self.0.push("request");
        Box::pin(async { HookAction::Continue })
    }

    fn responseheaders<'a>(&'a self, flow: &'a mut Flow) -> HookFuture<'a, ()> {
        self.0.push("responseheaders");
        if let Some(response) = flow.response.as_ref() {
            self.0.last_status.store(response.status as usize, Ordering::SeqCst);
        }
        Box::pin(async {})
    }

    fn response<'a>(&'a self, flow: &'a mut Flow) -> HookFuture<'a, HookAction> {
        self.0.push("response");
        if let Some(response) = flow.response.as_ref() {
            self.0.last_status.store(response.status as usize, Ordering::SeqCst);
            self.0.last_content_len.store(
                response.body.as_ref().map(Bytes::len).unwrap_or(0),
                Ordering::SeqCst,
            );
        }
        Box::pin(async { HookAction::Continue })
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_http_passthrough_with_full_hook_schedule() {
    let recorder = Arc::new(HookRecorder::default());
    let (proxy_addr, _hub, proxy_task) =
        start_proxy(vec![Box::new(RecordingAddon(Arc::clone(&recorder)))]).await;
    let (origin_addr, origin_task) =
        spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("hello"), "{response}");

    origin_task.await.expect("origin task");
    wait_until(|| {
        let events = recorder.events();
        events.contains(&"client_disconnected") && events.contains(&"server_disconnected")
    })
    .await;
    proxy_task.abort();

    let events = recorder.events();
    let flow_events: Vec<_> = events
        .iter()
        .copied()
        .filter(|event| {
            matches!(
                *event,
                "requestheaders" | "request" | "responseheaders" | "response"
            )
        })
        .collect();
    assert_eq!(
        flow_events,
        vec!["requestheaders", "request", "responseheaders", "response"]
    );
    assert_eq!(recorder.last_status.load(Ordering::SeqCst), 200);
    assert_eq!(recorder.last_content_len.load(Ordering::SeqCst), 5);

    let count = |name: &str| events.iter().filter(|event| **event == name).count();
    assert_eq!(count("client_connected"), 1);
    assert_eq!(count("client_disconnected"), 1);
    assert_eq!(count("server_connected"), 1);
    assert_eq!(count("server_disconnected"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_proxy_request_is_answered_400() {
    let (proxy_addr, _hub, proxy_task) = start_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .expect("send request");

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("proxy"), "{response}");
    proxy_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_to_unreachable_origin_returns_502() {
    let (proxy_addr, _hub, proxy_task) = start_proxy(Vec::new()).await;

    // Grab a port that nothing listens on.
    let unused = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let dead_addr = unused.local_addr().expect("probe addr");
    drop(unused);

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!("CONNECT {dead_addr} HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n");
    client.write_all(request.as_bytes()).await.expect("send CONNECT");

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    proxy_task.abort();
}

struct HeaderInjector;

impl Addon for HeaderInjector {
    fn request<'a>(&'a self, flow: &'a mut Flow) -> HookFuture<'a, HookAction> {
        flow.request.headers.insert(
            http::header::HeaderName::from_static("x-proxy"),
            http::header::HeaderValue::from_static("mitm"),
        );
        Box::pin(async { HookAction::Continue })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_rewrite_addon_header_reaches_the_origin() {
    let (proxy_addr, _hub, proxy_task) = start_proxy(vec![Box::new(HeaderInjector)]).await;
    let (origin_addr, origin_task) =
        spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://{origin_addr}/echo HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    let origin_head = origin_task.await.expect("origin task");
    let origin_head = String::from_utf8_lossy(&origin_head).into_owned();
    assert!(origin_head.contains("x-proxy: mitm"), "{origin_head}");
    proxy_task.abort();
}

struct TitleRewriter;

impl Addon for TitleRewriter {
    fn response<'a>(&'a self, flow: &'a mut Flow) -> HookFuture<'a, HookAction> {
        Box::pin(async move {
            if let Some(response) = flow.response.as_mut() {
                response.replace_to_decoded_body().expect("decode body");
                if let Some(body) = response.body.take() {
                    let rewritten = String::from_utf8_lossy(&body)
                        .replace("<title>X</title>", "<title>X - proxied</title>");
                    response.body = Some(Bytes::from(rewritten.into_bytes()));
                }
            }
            HookAction::Continue
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gzip_response_is_decoded_rewritten_and_reframed() {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(b"<html><title>X</title></html>")
        .expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");

    let mut origin_response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    origin_response.extend_from_slice(&compressed);
    let origin_response: &'static [u8] = origin_response.leak();

    let (proxy_addr, _hub, proxy_task) = start_proxy(vec![Box::new(TitleRewriter)]).await;
    let (origin_addr, origin_task) = spawn_origin(origin_response).await;

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!(
        "GET http://{origin_addr}/page HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let response = read_to_end(&mut client).await;
    let expected_body = "<html><title>X - proxied</title></html>";
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(!response.to_ascii_lowercase().contains("content-encoding"), "{response}");
    assert!(
        response.contains(&format!("content-length: {}", expected_body.len())),
        "{response}"
    );
    assert!(response.ends_with(expected_body), "{response}");

    origin_task.await.expect("origin task");
    proxy_task.abort();
}

struct LoginInterceptor;

impl Addon for LoginInterceptor {
    fn request<'a>(&'a self, flow: &'a mut Flow) -> HookFuture<'a, HookAction> {
        let intercept = flow.request.method.eq_ignore_ascii_case("POST")
            && flow.request.url.to_string().contains("/login");
        Box::pin(async move {
            if intercept {
                HookAction::Intercept
            } else {
                HookAction::Continue
            }
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_interception_returns_502_without_touching_the_origin() {
    let (proxy_addr, hub, proxy_task) = start_proxy(vec![Box::new(LoginInterceptor)]).await;

    let origin_touched = Arc::new(AtomicBool::new(false));
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin_listener.local_addr().expect("origin addr");
    {
        let origin_touched = Arc::clone(&origin_touched);
        tokio::spawn(async move {
            let _ = origin_listener.accept().await;
            origin_touched.store(true, Ordering::SeqCst);
        });
    }

    let resolver = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            for _ in 0..400 {
                if let Some(flow_id) = hub.pending_flows().first().copied() {
                    assert!(hub.resolve(flow_id, InterceptDecision::DropRequest));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("no flow was parked for interception");
        })
    };

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let request = format!(
        "POST http://{origin_addr}/login HTTP/1.1\r\nHost: {origin_addr}\r\nContent-Length: 9\r\nConnection: close\r\n\r\nuser=test"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let response = read_to_end(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");

    resolver.await.expect("resolver task");
    assert!(!origin_touched.load(Ordering::SeqCst), "origin was dialed");
    proxy_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keepalive_serves_sequential_flows_on_one_connection() {
    let (proxy_addr, _hub, proxy_task) = start_proxy(Vec::new()).await;

    let origin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin_listener.local_addr().expect("origin addr");
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin_listener.accept().await.expect("accept origin");
        for _ in 0..2 {
            let _ = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .expect("origin response");
        }
    });

    let mut client = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    for _ in 0..2 {
        let request = format!(
            "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.expect("send request");

        let mut response = vec![0_u8; 1024];
        let mut total = 0;
        while !response[..total].ends_with(b"ok") {
            let read = client
                .read(&mut response[total..])
                .await
                .expect("read response");
            assert!(read > 0, "proxy closed a keepalive connection");
            total += read;
        }
        let text = String::from_utf8_lossy(&response[..total]);
        assert!(text.starts_with("HTTP/1.1 200 OK"), "{text}");
    }

    drop(client);
    origin_task.await.expect("origin task");
    proxy_task.abort();
}
