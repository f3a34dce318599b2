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
    delay: Duration,
    raw: Option<Vec<u8>>,
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
            delay: Duration::ZERO,
            raw: None,
        }
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Raw bytes written verbatim instead of the framed status/headers/body.
    fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
            raw: Some(bytes.into()),
        }
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

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut remaining: VecDeque<MockResponse> = responses.into();

            while !remaining.is_empty() && Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
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
                                    if !response.delay.is_zero() {
                                        thread::sleep(response.delay);
                                    }
                                    if write_response(&mut stream, &response).is_err() {
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
            served,
            captured,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
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
        302 => "Found",
        303 => "See Other",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    if let Some(raw) = &response.raw {
        stream.write_all(raw)?;
        return stream.flush();
    }

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        status_text(response.status)
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("content-length: {}\r\n\r\n", response.body.len()));
    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

#[test]
fn retries_503_until_success_and_honors_retry_after_zero() {
    let server = MockServer::start(vec![
        MockResponse::new(503, vec![("retry-after", "0")], "busy"),
        MockResponse::new(503, vec![("retry-after", "0")], "busy"),
        MockResponse::new(200, Vec::<(String, String)>::new(), "finally"),
    ]);
    let client = Client::builder()
        .retry_policy(
            RetryPolicy::standard()
                .total(Some(3))
                .status_forcelist([503]),
        )
        .build();

    let started = Instant::now();
    let response = client
        .get(server.url("/busy"))
        .send()
        .expect("two 503s then 200 should succeed");
    assert_eq!(response.text_lossy(), "finally");
    assert_eq!(server.served_count(), 3);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "retry-after: 0 must not introduce real sleeps"
    );
}

#[test]
fn status_retries_exhaust_into_max_retries_error() {
    let server = MockServer::start(vec![
        MockResponse::new(503, Vec::<(String, String)>::new(), "busy"),
        MockResponse::new(503, Vec::<(String, String)>::new(), "busy"),
        MockResponse::new(503, Vec::<(String, String)>::new(), "busy"),
    ]);
    let client = Client::builder()
        .retry_policy(
            RetryPolicy::standard()
                .total(Some(2))
                .status_forcelist([503]),
        )
        .build();

    let error = client
        .get(server.url("/busy"))
        .send()
        .expect_err("three 503s with total=2 must exhaust the budget");
    match error {
        Error::MaxRetriesExceeded { history, .. } => {
            assert_eq!(history.len(), 3);
            assert!(history.iter().all(|attempt| attempt.status == Some(503)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn follows_relative_redirect_on_the_same_origin() {
    let server = MockServer::start(vec![
        MockResponse::new(302, vec![("location", "/next")], ""),
        MockResponse::new(200, Vec::<(String, String)>::new(), "done"),
    ]);
    let client = Client::builder().build();

    let response = client
        .get(server.url("/start"))
        .send()
        .expect("redirected request should succeed");
    assert_eq!(response.text_lossy(), "done");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path, "/start");
    assert_eq!(requests[1].path, "/next");
}

#[test]
fn see_other_downgrades_post_to_get() {
    let server = MockServer::start(vec![
        MockResponse::new(303, vec![("location", "/result")], ""),
        MockResponse::new(200, Vec::<(String, String)>::new(), "created"),
    ]);
    let client = Client::builder().build();

    let response = client
        .post(server.url("/submit"))
        .body("name=demo")
        .send()
        .expect("303 flow should succeed");
    assert_eq!(response.text_lossy(), "created");

    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].path, "/result");
    assert!(
        !requests[1].headers.contains_key("content-length")
            || requests[1].headers.get("content-length").map(String::as_str) == Some("0"),
        "rewritten GET must not carry the POST body"
    );
}

#[test]
fn redirect_capped_by_policy_returns_response_when_lenient() {
    let server = MockServer::start(vec![MockResponse::new(
        302,
        vec![("location", "/elsewhere")],
        "",
    )]);
    let client = Client::builder()
        .retry_policy(
            RetryPolicy::standard()
                .redirect(Some(0))
                .raise_on_redirect(false),
        )
        .build();

    let response = client
        .get(server.url("/start"))
        .send()
        .expect("lenient policy returns the redirect response itself");
    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(response.redirect_location().as_deref(), Some("/elsewhere"));
    assert_eq!(server.served_count(), 1);
}

#[test]
fn read_timeout_surfaces_after_budget_exhaustion() {
    let server = MockServer::start(vec![
        MockResponse::new(200, Vec::<(String, String)>::new(), "late")
            .delay(Duration::from_millis(800)),
    ]);
    let client = Client::builder()
        .read_timeout(Duration::from_millis(100))
        .retry_policy(RetryPolicy::disabled())
        .build();

    let error = client
        .get(server.url("/slow"))
        .send()
        .expect_err("slow response must time out");
    match error {
        Error::MaxRetriesExceeded { history, .. } => {
            assert_eq!(history.len(), 1);
            assert!(
                history[0]
                    .error
                    .as_deref()
                    .is_some_and(|text| text.contains("timeout")),
                "history should record the read timeout: {:?}",
                history[0].error
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn chunked_response_bodies_are_decoded() {
    let server = MockServer::start(vec![MockResponse::raw(
        "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )]);
    let client = Client::builder().build();

    let response = client
        .get(server.url("/chunked"))
        .send()
        .expect("chunked response should parse");
    assert_eq!(response.text_lossy(), "hello world");
}

#[test]
fn unreachable_port_yields_connect_class_error() {
    // Bind-then-drop a listener to find a port nothing is listening on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
        listener
            .local_addr()
            .expect("read probe address")
            .port()
    };
    let client = Client::builder()
        .connect_timeout(Duration::from_millis(200))
        .retry_policy(RetryPolicy::standard().total(Some(1)).backoff_factor(0.0))
        .build();

    let error = client
        .get(format!("http://127.0.0.1:{port}/"))
        .send()
        .expect_err("nothing is listening on the probed port");
    match error {
        Error::MaxRetriesExceeded { history, .. } => {
            assert_eq!(history.len(), 2, "one attempt plus one retry");
        }
        other => panic!("unexpected error: {other}"),
    }
}
