use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use poolx::prelude::{Client, Error, RetryPolicy};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    declared_length: Option<usize>,
    drop_connection_after: bool,
}

impl MockResponse {
    fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
            declared_length: None,
            drop_connection_after: false,
        }
    }

    fn drop_connection_after(mut self) -> Self {
        self.drop_connection_after = true;
        self
    }

    fn declared_length(mut self, length: usize) -> Self {
        self.declared_length = Some(length);
        self
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
}

struct MockServer {
    base_url: String,
    connections: Arc<AtomicUsize>,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let connections = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let connections_clone = Arc::clone(&connections);
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut remaining: VecDeque<MockResponse> = responses.into();

            while !remaining.is_empty() && Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        connections_clone.fetch_add(1, Ordering::SeqCst);
                        let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));

                        loop {
                            if remaining.is_empty() {
                                break;
                            }
                            match read_request(&mut stream) {
                                Ok(request) => {
                                    captured_clone
                                        .lock()
                                        .expect("lock captured requests")
                                        .push(request);
                                    let Some(response) = remaining.pop_front() else {
                                        break;
                                    };
                                    served_clone.fetch_add(1, Ordering::SeqCst);
                                    if write_response(&mut stream, &response).is_err() {
                                        break;
                                    }
                                    if response.drop_connection_after {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            connections,
            served,
            captured,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    let mut raw = Vec::new();
    let mut chunk = [0_u8; 4096];

    let header_end = loop {
        if let Some(position) = find_header_end(&raw) {
            break position;
        }
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        raw.extend_from_slice(&chunk[..read]);
    };

    let head_text = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let mut lines = head_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut request_parts = request_line.split(' ');
    let method = request_parts.next().unwrap_or_default().to_owned();
    let path = request_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body: Vec<u8> = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Ok(CapturedRequest {
        method,
        path,
        headers,
    })
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        302 => "Found",
        303 => "See Other",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        status_text(response.status)
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    let length = response.declared_length.unwrap_or(response.body.len());
    head.push_str(&format!("content-length: {length}\r\n\r\n"));
    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

#[test]
fn sequential_requests_reuse_one_tcp_connection() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![("content-type", "text/plain")], "first"),
        MockResponse::new(200, vec![("content-type", "text/plain")], "second"),
    ]);
    let client = Client::builder().build();

    let first = client
        .get(server.url("/one"))
        .send()
        .expect("first request should succeed");
    assert_eq!(first.text_lossy(), "first");

    let second = client
        .get(server.url("/two"))
        .send()
        .expect("second request should succeed");
    assert_eq!(second.text_lossy(), "second");

    assert_eq!(server.served_count(), 2);
    assert_eq!(
        server.connection_count(),
        1,
        "keep-alive responses must share one pooled connection"
    );

    let requests = server.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/one");
    assert_eq!(requests[1].path, "/two");
    assert_eq!(
        requests[0].headers.get("user-agent").map(String::as_str),
        Some("poolx")
    );
}

#[test]
fn silently_closed_idle_connection_is_replaced_on_next_acquire() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![("content-type", "text/plain")], "first").drop_connection_after(),
        MockResponse::new(200, vec![("content-type", "text/plain")], "second"),
    ]);
    let client = Client::builder().build();

    let first = client
        .get(server.url("/one"))
        .send()
        .expect("first request should succeed");
    assert_eq!(first.text_lossy(), "first");

    // Give the peer's FIN time to arrive while the connection sits idle.
    thread::sleep(Duration::from_millis(100));

    let second = client
        .get(server.url("/two"))
        .send()
        .expect("second request should succeed on a fresh connection");
    assert_eq!(second.text_lossy(), "second");
    assert_eq!(
        server.connection_count(),
        2,
        "the dead idle connection must be discarded, not reused"
    );
}

#[test]
fn connection_close_header_prevents_pooling() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![("connection", "close")], "first").drop_connection_after(),
        MockResponse::new(200, Vec::<(String, String)>::new(), "second"),
    ]);
    let client = Client::builder().build();

    client
        .get(server.url("/one"))
        .send()
        .expect("first request should succeed");
    client
        .get(server.url("/two"))
        .send()
        .expect("second request should succeed");

    assert_eq!(
        server.connection_count(),
        2,
        "a connection: close response must not be returned to the pool"
    );
}

#[test]
fn truncated_response_is_retried_on_a_fresh_connection() {
    let server = MockServer::start(vec![
        MockResponse::new(200, Vec::<(String, String)>::new(), "partial")
            .declared_length(64)
            .drop_connection_after(),
        MockResponse::new(200, Vec::<(String, String)>::new(), "recovered"),
    ]);
    let client = Client::builder()
        .retry_policy(RetryPolicy::standard().total(Some(2)))
        .build();

    let response = client
        .get(server.url("/flaky"))
        .send()
        .expect("truncated GET should be retried to success");
    assert_eq!(response.text_lossy(), "recovered");
    assert_eq!(server.connection_count(), 2);
    assert_eq!(server.served_count(), 2);
}

#[test]
fn truncated_response_on_post_is_not_retried() {
    let server = MockServer::start(vec![
        MockResponse::new(200, Vec::<(String, String)>::new(), "partial")
            .declared_length(64)
            .drop_connection_after(),
    ]);
    let client = Client::builder()
        .retry_policy(RetryPolicy::standard().total(Some(5)))
        .build();

    let error = client
        .post(server.url("/submit"))
        .body("payload")
        .send()
        .expect_err("a POST cut off mid-response must not be replayed");
    assert!(error.is_read_class(), "unexpected error: {error}");
    assert_eq!(server.served_count(), 1);
}

#[test]
fn pool_exhaustion_is_distinguishable() {
    // No server needed: acquisition happens before any connect.
    let manager = poolx::PoolManager::new(
        4,
        poolx::PoolOptions::default().maxsize(1).block(true),
        poolx::ConnectionConfig::default(),
    );
    let uri: http::Uri = "http://unreachable.test/".parse().expect("uri should parse");
    let pool = manager.pool_for_uri(&uri).expect("pool should be created");

    let held = pool.acquire(None).expect("first slot should be free");
    let error = pool
        .acquire(Some(Duration::from_millis(20)))
        .expect_err("second acquire must time out");
    assert!(matches!(error, Error::PoolExhausted { .. }));
    pool.release(held);
    assert!(pool.acquire(Some(Duration::from_millis(20))).is_ok());
}
