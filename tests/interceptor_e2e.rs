//! End-to-end scenarios: a scripted host dispatcher drives the six
//! lifecycle callbacks against an in-process collector server, and the
//! tests assert which POSTs the collector actually saw.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use traffic_mirror::hash::StreamingHasher;
use traffic_mirror::{
    DispatchController, DispatchHandler, DispatchOptions, InterceptedDispatch,
    TrafficInterceptor, TrafficInterceptorOptions, UpgradeStream,
};

const BODY_PATH: &str = "/traffic/body";
const META_PATH: &str = "/traffic/meta";

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

type Records = Arc<Mutex<Vec<Recorded>>>;

/// In-process collector: records every POST it receives and answers 200.
async fn spawn_collector() -> (String, Records) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let records: Records = Arc::new(Mutex::new(Vec::new()));

    let accept_records = records.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let conn_records = accept_records.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let records = conn_records.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        // An aborted mirror POST arrives truncated; record
                        // only fully delivered requests.
                        if let Ok(collected) = body.collect().await {
                            records.lock().unwrap().push(Recorded {
                                path: parts.uri.path().to_string(),
                                headers: parts.headers,
                                body: collected.to_bytes(),
                            });
                        }
                        Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                            Bytes::from_static(b"ok"),
                        )))
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (format!("http://{}", addr), records)
}

async fn wait_for_records(records: &Records, expected: usize) -> Vec<Recorded> {
    for _ in 0..200 {
        {
            let seen = records.lock().unwrap();
            if seen.len() >= expected {
                return seen.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let seen = records.lock().unwrap();
    panic!(
        "collector received {} request(s), expected {}",
        seen.len(),
        expected
    );
}

async fn assert_record_count_settles_at(records: &Records, expected: usize) {
    tokio::time::sleep(Duration::from_millis(250)).await;
    let seen = records.lock().unwrap();
    let paths: Vec<&str> = seen.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(seen.len(), expected, "unexpected collector traffic: {:?}", paths);
}

/// Scripted host-side handler: records which callbacks reached the host.
#[derive(Default)]
struct RecordingHandler {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    fn with_events() -> (Self, Arc<Mutex<Vec<String>>>) {
        let handler = Self::default();
        let events = handler.events.clone();
        (handler, events)
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

#[async_trait]
impl DispatchHandler for RecordingHandler {
    async fn on_request_start(&mut self, _controller: &mut DispatchController) {
        self.push("request_start");
    }

    async fn on_request_upgrade(
        &mut self,
        _controller: &mut DispatchController,
        _status: u16,
        _headers: &HeaderMap,
        _socket: UpgradeStream,
    ) {
        self.push("request_upgrade");
    }

    async fn on_response_start(
        &mut self,
        _controller: &mut DispatchController,
        status: u16,
        _headers: &HeaderMap,
        _status_message: Option<&str>,
    ) {
        self.push(format!("response_start:{}", status));
    }

    async fn on_response_data(&mut self, _controller: &mut DispatchController, chunk: Bytes) {
        self.push(format!("response_data:{}", chunk.len()));
    }

    async fn on_response_end(
        &mut self,
        _controller: &mut DispatchController,
        _trailers: Option<&HeaderMap>,
    ) {
        self.push("response_end");
    }

    async fn on_response_error(
        &mut self,
        _controller: &mut DispatchController,
        _error: &anyhow::Error,
    ) {
        self.push("response_error");
    }
}

fn get_dispatch(origin: &str, path: &str) -> DispatchOptions {
    DispatchOptions {
        method: "GET".to_string(),
        origin: origin.to_string(),
        path: path.to_string(),
        headers: HeaderMap::new(),
    }
}

fn text_response_headers(content_length: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "content-length",
        HeaderValue::from_str(content_length).unwrap(),
    );
    headers
}

/// Drive a full successful transaction through the six-callback order.
async fn run_transaction(
    interceptor: &TrafficInterceptor,
    dispatch: DispatchOptions,
    status: u16,
    response_headers: HeaderMap,
    chunks: &[&'static [u8]],
) -> InterceptedDispatch<RecordingHandler> {
    let mut handler = interceptor.wrap(RecordingHandler::default(), dispatch);
    let mut controller = DispatchController::new();
    handler.on_request_start(&mut controller).await;
    handler
        .on_response_start(&mut controller, status, &response_headers, None)
        .await;
    for chunk in chunks {
        handler
            .on_response_data(&mut controller, Bytes::from_static(chunk))
            .await;
    }
    handler.on_response_end(&mut controller, None).await;
    handler
}

#[tokio::test]
async fn happy_path_mirrors_body_and_meta() {
    let (base, records) = spawn_collector().await;
    let mut options = TrafficInterceptorOptions::new(&base);
    options
        .labels
        .insert("app".to_string(), "checkout".to_string());
    let interceptor = TrafficInterceptor::new(options).unwrap();

    let mut dispatch = get_dispatch("http://app", "/dummy");
    dispatch
        .headers
        .insert("user-agent", HeaderValue::from_static("test-user-agent"));
    dispatch
        .headers
        .insert("content-type", HeaderValue::from_static("application/json"));

    run_transaction(
        &interceptor,
        dispatch,
        200,
        text_response_headers("17"),
        &[b"[/dummy response]"],
    )
    .await;

    let recorded = wait_for_records(&records, 2).await;

    let body_post = recorded.iter().find(|r| r.path == BODY_PATH).unwrap();
    assert_eq!(&body_post.body[..], b"[/dummy response]");
    assert_eq!(
        body_post.headers.get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
    assert_eq!(body_post.headers.get("content-length").unwrap(), "17");

    let labels: serde_json::Value =
        serde_json::from_str(body_post.headers.get("x-labels").unwrap().to_str().unwrap())
            .unwrap();
    assert_eq!(labels["app"], "checkout");

    let request_data: serde_json::Value = serde_json::from_str(
        body_post
            .headers
            .get("x-request-data")
            .unwrap()
            .to_str()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(request_data["url"], "http://app/dummy");
    assert_eq!(request_data["headers"]["user-agent"], "test-user-agent");

    let response_data: serde_json::Value = serde_json::from_str(
        body_post
            .headers
            .get("x-response-data")
            .unwrap()
            .to_str()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(response_data["headers"]["content-length"], "17");

    let meta_post = recorded.iter().find(|r| r.path == META_PATH).unwrap();
    assert_eq!(
        meta_post.headers.get("content-type").unwrap(),
        "application/json"
    );
    let meta: serde_json::Value = serde_json::from_slice(&meta_post.body).unwrap();
    assert_eq!(meta["request"]["url"], "http://app/dummy");
    assert_eq!(meta["response"]["code"], 200);
    assert_eq!(meta["response"]["bodySize"], 17);

    let mut hasher = StreamingHasher::new();
    hasher.update(b"[/dummy response]");
    assert_eq!(meta["response"]["bodyHash"], hasher.digest().to_string());
    assert!(meta["timestamp"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn auth_header_skips_both_posts() {
    let (base, records) = spawn_collector().await;
    let interceptor =
        TrafficInterceptor::new(TrafficInterceptorOptions::new(&base)).unwrap();

    let mut dispatch = get_dispatch("http://app", "/dummy");
    dispatch
        .headers
        .insert("authorization", HeaderValue::from_static("anything"));

    let handler = run_transaction(
        &interceptor,
        dispatch,
        200,
        text_response_headers("17"),
        &[b"[/dummy response]"],
    )
    .await;

    assert_eq!(handler.context().intercept_request, Some(false));
    assert_eq!(handler.context().send_meta, Some(false));
    assert_eq!(handler.context().send_body, Some(false));
    assert_record_count_settles_at(&records, 0).await;
}

#[tokio::test]
async fn bloom_filter_dedupes_body_but_not_meta() {
    let (base, records) = spawn_collector().await;
    let interceptor =
        TrafficInterceptor::new(TrafficInterceptorOptions::new(&base)).unwrap();

    run_transaction(
        &interceptor,
        get_dispatch("http://app", "/api/test"),
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;
    wait_for_records(&records, 2).await;

    let second = run_transaction(
        &interceptor,
        get_dispatch("http://app", "/api/test"),
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;
    assert_eq!(second.context().send_meta, Some(true));
    assert_eq!(second.context().send_body, Some(false));
    let recorded = wait_for_records(&records, 3).await;
    assert_eq!(recorded[2].path, META_PATH);

    let meta: serde_json::Value = serde_json::from_slice(&recorded[2].body).unwrap();
    let mut hasher = StreamingHasher::new();
    hasher.update(b"hello");
    assert_eq!(meta["response"]["bodyHash"], hasher.digest().to_string());

    // Identity is query-insensitive: a differing query string still
    // dedupes against the same origin+path.
    let third = run_transaction(
        &interceptor,
        get_dispatch("http://app", "/api/test?page=2"),
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;
    assert_eq!(third.context().send_body, Some(false));
    let recorded = wait_for_records(&records, 4).await;
    assert_eq!(recorded[3].path, META_PATH);

    assert_record_count_settles_at(&records, 4).await;
    let bodies = records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.path == BODY_PATH)
        .count();
    assert_eq!(bodies, 1, "identical URLs must mirror at most one body");
}

#[tokio::test]
async fn non_2xx_status_skips_both_posts() {
    let (base, records) = spawn_collector().await;
    let interceptor =
        TrafficInterceptor::new(TrafficInterceptorOptions::new(&base)).unwrap();

    let handler = run_transaction(
        &interceptor,
        get_dispatch("http://app", "/failing"),
        500,
        text_response_headers("5"),
        &[b"oops!"],
    )
    .await;

    assert_eq!(handler.context().intercept_response, Some(false));
    assert_record_count_settles_at(&records, 0).await;
}

#[tokio::test]
async fn oversized_content_length_skips_both_posts() {
    let (base, records) = spawn_collector().await;
    let mut options = TrafficInterceptorOptions::new(&base);
    options.max_response_size = 10;
    let interceptor = TrafficInterceptor::new(options).unwrap();

    let handler = run_transaction(
        &interceptor,
        get_dispatch("http://app", "/big"),
        200,
        text_response_headers("30"),
        &[b"012345678901234567890123456789"],
    )
    .await;

    assert_eq!(handler.context().intercept_response, Some(false));
    assert_eq!(handler.context().send_body, Some(false));
    assert_record_count_settles_at(&records, 0).await;
}

#[tokio::test]
async fn abort_mid_stream_tears_down_without_meta() {
    let (base, records) = spawn_collector().await;
    let interceptor =
        TrafficInterceptor::new(TrafficInterceptorOptions::new(&base)).unwrap();

    let (inner, events) = RecordingHandler::with_events();
    let mut handler = interceptor.wrap(inner, get_dispatch("http://app", "/slow"));
    let mut controller = DispatchController::new();

    handler.on_request_start(&mut controller).await;
    handler
        .on_response_start(&mut controller, 200, &text_response_headers("100"), None)
        .await;
    handler
        .on_response_data(&mut controller, Bytes::from_static(b"partial..."))
        .await;

    controller.abort("client canceled");
    let error = anyhow::anyhow!("stream destroyed");
    handler.on_response_error(&mut controller, &error).await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    let metas = records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.path == META_PATH)
        .count();
    assert_eq!(metas, 0, "no meta POST may follow an abort");
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e == "response_error"));
}

#[tokio::test]
async fn matching_domain_suffix_admits_transaction() {
    let (base, records) = spawn_collector().await;
    let mut options = TrafficInterceptorOptions::new(&base);
    options.matching_domains = Some(vec![".sub.plt".to_string(), ".plt.local".to_string()]);
    let interceptor = TrafficInterceptor::new(options).unwrap();

    let mut dispatch = get_dispatch("http://app", "/dummy");
    dispatch.headers.insert(
        "origin",
        HeaderValue::from_static("https://sub1.sub2.plt.local:3001"),
    );

    run_transaction(
        &interceptor,
        dispatch,
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;

    let recorded = wait_for_records(&records, 2).await;
    let body_post = recorded.iter().find(|r| r.path == BODY_PATH).unwrap();
    let request_data: serde_json::Value = serde_json::from_str(
        body_post
            .headers
            .get("x-request-data")
            .unwrap()
            .to_str()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        request_data["url"],
        "https://sub1.sub2.plt.local:3001/dummy"
    );
}

#[tokio::test]
async fn unmatched_domain_skips_both_posts() {
    let (base, records) = spawn_collector().await;
    let mut options = TrafficInterceptorOptions::new(&base);
    options.matching_domains = Some(vec![".plt.local".to_string()]);
    let interceptor = TrafficInterceptor::new(options).unwrap();

    let handler = run_transaction(
        &interceptor,
        get_dispatch("http://elsewhere.example.com", "/dummy"),
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;

    assert_eq!(handler.context().intercept_request, Some(false));
    assert_record_count_settles_at(&records, 0).await;
}

#[tokio::test]
async fn non_get_method_skips_both_posts() {
    let (base, records) = spawn_collector().await;
    let interceptor =
        TrafficInterceptor::new(TrafficInterceptorOptions::new(&base)).unwrap();

    let mut dispatch = get_dispatch("http://app", "/dummy");
    dispatch.method = "POST".to_string();

    let handler = run_transaction(
        &interceptor,
        dispatch,
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;

    assert_eq!(handler.context().intercept_request, Some(false));
    assert_record_count_settles_at(&records, 0).await;
}

#[tokio::test]
async fn host_handler_sees_every_callback_when_skipped() {
    let (base, records) = spawn_collector().await;
    let interceptor =
        TrafficInterceptor::new(TrafficInterceptorOptions::new(&base)).unwrap();

    let mut dispatch = get_dispatch("http://app", "/dummy");
    dispatch
        .headers
        .insert("authorization", HeaderValue::from_static("secret"));

    let (inner, events) = RecordingHandler::with_events();
    let mut handler = interceptor.wrap(inner, dispatch);
    let mut controller = DispatchController::new();
    handler.on_request_start(&mut controller).await;
    handler
        .on_response_start(&mut controller, 200, &text_response_headers("5"), None)
        .await;
    handler
        .on_response_data(&mut controller, Bytes::from_static(b"hello"))
        .await;
    handler.on_response_end(&mut controller, None).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "request_start".to_string(),
            "response_start:200".to_string(),
            "response_data:5".to_string(),
            "response_end".to_string(),
        ]
    );
    assert_record_count_settles_at(&records, 0).await;
}

#[tokio::test]
async fn custom_request_predicate_replaces_builtin_rules() {
    let (base, records) = spawn_collector().await;
    let mut options = TrafficInterceptorOptions::new(&base);
    options.intercept_request = Some(std::sync::Arc::new(|ctx| {
        !ctx.request.url.contains("/private")
    }));
    let interceptor = TrafficInterceptor::new(options).unwrap();

    let rejected = run_transaction(
        &interceptor,
        get_dispatch("http://app", "/private/secrets"),
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;
    assert_eq!(rejected.context().intercept_request, Some(false));
    assert_record_count_settles_at(&records, 0).await;

    // The override is authoritative: a POST passes even though the
    // built-in rules only admit GET.
    let mut dispatch = get_dispatch("http://app", "/public");
    dispatch.method = "POST".to_string();
    run_transaction(
        &interceptor,
        dispatch,
        200,
        text_response_headers("5"),
        &[b"hello"],
    )
    .await;
    wait_for_records(&records, 2).await;
}

#[tokio::test]
async fn chunked_body_is_reassembled_and_hashed() {
    let (base, records) = spawn_collector().await;
    let interceptor =
        TrafficInterceptor::new(TrafficInterceptorOptions::new(&base)).unwrap();

    run_transaction(
        &interceptor,
        get_dispatch("http://app", "/chunked"),
        200,
        text_response_headers("11"),
        &[b"hello", b" ", b"world"],
    )
    .await;

    let recorded = wait_for_records(&records, 2).await;
    let body_post = recorded.iter().find(|r| r.path == BODY_PATH).unwrap();
    assert_eq!(&body_post.body[..], b"hello world");

    let meta_post = recorded.iter().find(|r| r.path == META_PATH).unwrap();
    let meta: serde_json::Value = serde_json::from_slice(&meta_post.body).unwrap();
    let mut hasher = StreamingHasher::new();
    hasher.update(b"hello world");
    assert_eq!(meta["response"]["bodyHash"], hasher.digest().to_string());
}
