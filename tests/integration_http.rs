use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqpipe::prelude::{
    ApiContext, Client, ClientConfig, Error, ErrorCode, LoggingNavigator, MemoryTokenStore,
    Payload, RequestConfig,
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
}

impl MockResponse {
    fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into().into_bytes(),
            delay,
        }
    }

    fn json(status: u16, body: Value) -> Self {
        Self::new(
            status,
            vec![("Content-Type", "application/json")],
            body.to_string(),
            Duration::ZERO,
        )
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
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
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;

                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }

                        let _ = write_response(&mut stream, response);
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

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

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
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        401 => "Unauthorized",
        422 => "Unprocessable Entity",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn context(base_url: &str) -> ApiContext {
    let config = ClientConfig::new(base_url)
        .with_timeout(Duration::from_millis(500))
        .with_default_header("x-client", "integration");
    ApiContext::new(
        &config,
        Arc::new(MemoryTokenStore::new()),
        Arc::new(LoggingNavigator::new()),
    )
    .expect("context should build")
}

#[derive(Debug, Deserialize, PartialEq)]
struct Health {
    status: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_check_round_trips_over_http() {
    let server = MockServer::start(vec![MockResponse::json(200, json!({ "status": "ok" }))]);
    let context = context(&server.base_url);
    context.auth.set_auth_token("token-1");

    let health = context
        .client
        .get::<Health>("/health", None)
        .await
        .expect("health check should succeed");

    assert_eq!(health.data().status, "ok");
    assert_eq!(health.status().as_u16(), 200);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/health");
    assert_eq!(
        requests[0].headers.get("authorization").map(String::as_str),
        Some("Bearer token-1")
    );
    assert_eq!(
        requests[0].headers.get("x-client").map(String::as_str),
        Some("integration")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_get_after_service_unavailable() {
    let server = MockServer::start(vec![
        MockResponse::new(503, Vec::<(String, String)>::new(), "busy", Duration::ZERO),
        MockResponse::json(200, json!({ "status": "ok" })),
    ]);
    let context = context(&server.base_url);
    context.retry.configure(|policy| {
        policy
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter(Duration::ZERO)
    });

    let health = context
        .client
        .get::<Health>("/health", Some(RequestConfig::new().retry(true)))
        .await
        .expect("second attempt should succeed");

    assert_eq!(health.data().status, "ok");
    assert_eq!(server.served_count(), 2);
    assert_eq!(context.client.metrics_snapshot().retries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_sends_json_and_form_payloads() {
    let server = MockServer::start(vec![
        MockResponse::json(201, json!({ "id": "item-1" })),
        MockResponse::json(200, json!({})),
    ]);
    let client = Client::builder(server.base_url.clone())
        .request_timeout(Duration::from_millis(500))
        .try_build()
        .expect("client should build");

    let created = client
        .post::<Value>(
            "/v1/items",
            Some(Payload::json(&json!({ "name": "demo" })).expect("serialize payload")),
            None,
        )
        .await
        .expect("create should succeed");
    assert_eq!(created.data()["id"], "item-1");

    client
        .put::<Value>(
            "/v1/items/item-1",
            Some(Payload::form([("name", "renamed"), ("tag", "a b")])),
            None,
        )
        .await
        .expect("update should succeed");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(
        serde_json::from_slice::<Value>(&requests[0].body).expect("json body"),
        json!({ "name": "demo" })
    );
    assert_eq!(requests[1].method, "PUT");
    assert_eq!(
        requests[1].headers.get("content-type").map(String::as_str),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(requests[1].body, b"name=renamed&tag=a+b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_response_times_out() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "application/json")],
        r#"{"status":"ok"}"#,
        Duration::from_millis(150),
    )]);
    let client = Client::builder(server.base_url.clone())
        .request_timeout(Duration::from_millis(20))
        .try_build()
        .expect("client should build");

    let error = client
        .get::<Health>("/slow", None)
        .await
        .expect_err("slow response should time out");

    assert!(matches!(error, Error::Timeout { .. }), "unexpected error: {error}");
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert_eq!(client.metrics_snapshot().timeouts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cacheable_get_is_served_once() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![
            ("Content-Type", "application/json"),
            ("Cache-Control", "public, max-age=60"),
        ],
        r#"{"status":"ok"}"#,
        Duration::ZERO,
    )]);
    let client = Client::builder(server.base_url.clone())
        .request_timeout(Duration::from_millis(500))
        .try_build()
        .expect("client should build");

    let first = client
        .execute(RequestConfig::new().url("/health"))
        .await
        .expect("first request should succeed");
    let second = client
        .execute(RequestConfig::new().url("/health"))
        .await
        .expect("second request should hit the cache");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(server.served_count(), 1);
    assert_eq!(client.metrics_snapshot().cache_hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_parameters_are_encoded_on_the_wire() {
    let server = MockServer::start(vec![MockResponse::json(200, json!([]))]);
    let client = Client::builder(server.base_url.clone())
        .request_timeout(Duration::from_millis(500))
        .try_build()
        .expect("client should build");

    client
        .get::<Value>(
            "/v1/items",
            Some(
                RequestConfig::new()
                    .query(&json!({ "page": 2, "tags": ["a", "b"], "cursor": null }))
                    .expect("query should serialize"),
            ),
        )
        .await
        .expect("request should succeed");

    assert_eq!(server.requests()[0].path, "/v1/items?page=2&tags=a&tags=b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_body_enriches_status_error() {
    let server = MockServer::start(vec![MockResponse::json(
        422,
        json!({ "message": "name is required", "code": "VALIDATION" }),
    )]);
    let client = Client::builder(server.base_url.clone())
        .request_timeout(Duration::from_millis(500))
        .try_build()
        .expect("client should build");

    let error = client
        .post::<Value>("/v1/items", Some(Payload::json(&json!({})).expect("payload")), None)
        .await
        .expect_err("422 should fail");

    let api = error.as_api().expect("status errors are api errors");
    assert_eq!(api.status(), Some(422));
    assert_eq!(api.code(), Some("VALIDATION"));
    assert!(api.message().contains("name is required"));
    assert_eq!(api.data().and_then(|data| data.get("code")), Some(&json!("VALIDATION")));
    assert_eq!(error.code(), ErrorCode::HttpStatus);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_response_resets_session() {
    let server = MockServer::start(vec![MockResponse::json(
        401,
        json!({ "message": "token expired" }),
    )]);
    let navigator = Arc::new(LoggingNavigator::new());
    let config = ClientConfig::new(server.base_url.clone()).with_timeout(Duration::from_millis(500));
    let context = ApiContext::new(&config, Arc::new(MemoryTokenStore::new()), navigator.clone())
        .expect("context should build");
    context.auth.set_auth_token("stale");

    let error = context
        .client
        .get::<Value>("/v1/me", None)
        .await
        .expect_err("401 should fail");

    assert_eq!(error.status(), Some(401));
    assert_eq!(context.auth.get_auth_token(), None);
    assert_eq!(navigator.last_location().as_deref(), Some("/login"));
}
