use super::context::{headers_to_json, InterceptorContext};
use super::{filter, url, Shared};
use crate::dispatch::{DispatchController, DispatchHandler, DispatchOptions, UpgradeStream};
use crate::hash;
use crate::mirror::channel_body;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Capacity of the in-memory pipe between the response stream and the
/// mirror body POST. A full pipe is the backpressure signal: the tee
/// awaits drain, never buffers the body.
const MIRROR_PIPE_DEPTH: usize = 16;

static X_LABELS: HeaderName = HeaderName::from_static("x-labels");
static X_REQUEST_DATA: HeaderName = HeaderName::from_static("x-request-data");
static X_RESPONSE_DATA: HeaderName = HeaderName::from_static("x-response-data");

/// The per-transaction mirror stream. Owned by the context's state
/// machine; the abort hook is the only other path that touches it, which
/// is why it sits behind a mutex.
#[derive(Default)]
struct MirrorStream {
    writer: Option<mpsc::Sender<Bytes>>,
    task: Option<JoinHandle<()>>,
}

/// A host dispatch handler composed with the interception state machine.
///
/// Drives one transaction through its lifecycle: admission at
/// `on_request_start`, dedup gating via the shared Bloom filter, response
/// admission at `on_response_start`, tee-and-hash during
/// `on_response_data`, and body/meta delivery at `on_response_end`.
/// Every callback forwards to the wrapped handler; mirror failures are
/// logged and never surface to the host.
pub struct InterceptedDispatch<H> {
    inner: H,
    dispatch: DispatchOptions,
    ctx: InterceptorContext,
    shared: Arc<Shared>,
    mirror: Arc<Mutex<MirrorStream>>,
    torn_down: Arc<AtomicBool>,
}

impl<H> InterceptedDispatch<H> {
    pub(crate) fn new(inner: H, dispatch: DispatchOptions, shared: Arc<Shared>) -> Self {
        Self {
            inner,
            dispatch,
            ctx: InterceptorContext::new(shared.options.clone()),
            shared,
            mirror: Arc::new(Mutex::new(MirrorStream::default())),
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn context(&self) -> &InterceptorContext {
        &self.ctx
    }

    fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Open the streaming body POST towards the collector. The writer end
    /// of the pipe stays with this transaction; the reader end feeds the
    /// in-flight request.
    fn open_mirror_stream(&mut self) {
        let (writer, rx) = mpsc::channel::<Bytes>(MIRROR_PIPE_DEPTH);
        let body = channel_body(rx);
        let headers = self.mirror_body_headers();
        let body_url = self.ctx.request.url.clone();
        let shared = self.shared.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = shared.mirror.post_body(headers, body).await {
                error!(
                    "intercept: mirror body delivery failed, url={}, error={}",
                    body_url, e
                );
                metrics::counter!("interceptor_mirror_failures_total", "endpoint" => "body")
                    .increment(1);
            }
        });

        {
            let mut stream = lock_unpoisoned(&self.mirror);
            stream.writer = Some(writer);
            stream.task = Some(task);
        }

        // An abort may have landed while the POST was being set up.
        if self.torn_down() {
            teardown_mirror(&self.mirror);
        }
    }

    /// Headers on the body POST: `content-type` and `content-length`
    /// mirrored from the origin response, labels, and the request and
    /// response descriptors.
    fn mirror_body_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let content_type = self
            .ctx
            .response
            .headers
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
        headers.insert(CONTENT_TYPE, content_type);

        let content_length = self
            .ctx
            .response
            .headers
            .get(CONTENT_LENGTH)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("0"));
        headers.insert(CONTENT_LENGTH, content_length);

        headers.insert(X_LABELS.clone(), self.shared.options.labels_header.clone());

        let request_data = RequestDescriptor {
            url: &self.ctx.request.url,
            headers: headers_to_json(&self.ctx.request.headers),
        };
        if let Some(value) = json_header_value(&request_data) {
            headers.insert(X_REQUEST_DATA.clone(), value);
        }

        let response_data = ResponseDescriptor {
            headers: headers_to_json(&self.ctx.response.headers),
        };
        if let Some(value) = json_header_value(&response_data) {
            headers.insert(X_RESPONSE_DATA.clone(), value);
        }

        headers
    }

    /// Fire-and-forget meta POST. Detached so `on_response_end` never
    /// gates the host stream on the collector's meta endpoint.
    fn send_meta_report(&self, digest: u64) {
        let mut buf = itoa::Buffer::new();
        let report = MetaReport {
            timestamp: self.ctx.request.timestamp,
            request: RequestDescriptor {
                url: &self.ctx.request.url,
                headers: headers_to_json(&self.ctx.request.headers),
            },
            response: MetaResponse {
                code: self.ctx.response.status,
                headers: headers_to_json(&self.ctx.response.headers),
                body_hash: buf.format(digest).to_string(),
                body_size: filter::content_length(&self.ctx).unwrap_or(0),
            },
        };
        let payload = match serde_json::to_vec(&report) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "intercept: meta payload not serializable, url={}, error={}",
                    self.ctx.request.url, e
                );
                return;
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(X_LABELS.clone(), self.shared.options.labels_header.clone());

        let meta_url = self.ctx.request.url.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.mirror.post_meta(headers, payload).await {
                error!(
                    "intercept: meta delivery failed, url={}, error={}",
                    meta_url, e
                );
                metrics::counter!("interceptor_mirror_failures_total", "endpoint" => "meta")
                    .increment(1);
            }
        });
    }
}

#[async_trait]
impl<H: DispatchHandler> DispatchHandler for InterceptedDispatch<H> {
    async fn on_request_start(&mut self, controller: &mut DispatchController) {
        let mirror = self.mirror.clone();
        let torn_down = self.torn_down.clone();
        controller.on_abort(move |reason| {
            debug!("intercept: transaction aborted, reason={}", reason);
            torn_down.store(true, Ordering::SeqCst);
            teardown_mirror(&mirror);
        });

        {
            let request = &mut self.ctx.request;
            request.method = self.dispatch.method.clone();
            request.headers = self.dispatch.headers.clone();
            request.origin = url::extract_origin(&self.dispatch.origin, &self.dispatch.headers);
            if self.shared.options.matching_domains.is_some() {
                request.domain = url::extract_domain(&request.origin);
            }
            let path = bare_path(&self.dispatch.path);
            request.url = format!("{}{}", request.origin, path);
        }

        let admitted = match &self.shared.options.raw.intercept_request {
            Some(predicate) => predicate(&self.ctx),
            None => filter::admit_request(&self.ctx),
        };
        self.ctx.intercept_request = Some(admitted);

        if !admitted {
            self.ctx.send_meta = Some(false);
            self.ctx.send_body = Some(false);
            debug!("intercept: skip by request, url={}", self.ctx.request.url);
            metrics::counter!("interceptor_transactions_total", "decision" => "skip_request")
                .increment(1);
            self.inner.on_request_start(controller).await;
            return;
        }

        let identity = hash::identity_hash(&self.ctx.request.url);
        self.ctx.request.hash = Some(identity);

        // has-then-add in one critical section: two concurrent identical
        // requests must not both win body mirroring.
        let already_seen = {
            let mut bloom = lock_unpoisoned(&self.shared.bloom);
            bloom.check_and_add(identity)
        };
        self.ctx.send_meta = Some(true);
        self.ctx.send_body = Some(!already_seen);

        if already_seen {
            debug!(
                "intercept: skip by bloom filter, url={}",
                self.ctx.request.url
            );
            metrics::counter!("interceptor_transactions_total", "decision" => "meta_only")
                .increment(1);
        } else {
            metrics::counter!("interceptor_transactions_total", "decision" => "mirror")
                .increment(1);
        }

        self.inner.on_request_start(controller).await;
    }

    async fn on_request_upgrade(
        &mut self,
        controller: &mut DispatchController,
        status: u16,
        headers: &HeaderMap,
        socket: UpgradeStream,
    ) {
        // Upgraded connections are never mirrored.
        self.inner
            .on_request_upgrade(controller, status, headers, socket)
            .await;
    }

    async fn on_response_start(
        &mut self,
        controller: &mut DispatchController,
        status: u16,
        headers: &HeaderMap,
        status_message: Option<&str>,
    ) {
        self.ctx.response.status = status;
        self.ctx.response.headers = headers.clone();

        if self.ctx.intercept_request == Some(false) || self.torn_down() {
            self.inner
                .on_response_start(controller, status, headers, status_message)
                .await;
            return;
        }

        let admitted = match &self.shared.options.raw.intercept_response {
            Some(predicate) => predicate(&self.ctx),
            None => filter::admit_response(&self.ctx),
        };
        self.ctx.intercept_response = Some(admitted);

        if !admitted {
            self.ctx.send_meta = Some(false);
            self.ctx.send_body = Some(false);
            debug!(
                "intercept: skip by response, url={}, status={}",
                self.ctx.request.url, status
            );
            metrics::counter!("interceptor_transactions_total", "decision" => "skip_response")
                .increment(1);
            self.inner
                .on_response_start(controller, status, headers, status_message)
                .await;
            return;
        }

        if self.ctx.send_meta == Some(true) {
            self.ctx.hasher.reset();
        }
        if self.ctx.send_body == Some(true) {
            self.open_mirror_stream();
        }

        self.inner
            .on_response_start(controller, status, headers, status_message)
            .await;
    }

    async fn on_response_data(&mut self, controller: &mut DispatchController, chunk: Bytes) {
        if self.ctx.dropped() || self.torn_down() {
            self.inner.on_response_data(controller, chunk).await;
            return;
        }

        // Host delivery first: the tee below may suspend on pipe
        // backpressure, and the host stream must never wait for that.
        self.inner
            .on_response_data(controller, chunk.clone())
            .await;

        if self.ctx.send_meta == Some(true) {
            self.ctx.hasher.update(&chunk);
        }

        if self.ctx.send_body == Some(true) {
            let writer = lock_unpoisoned(&self.mirror).writer.clone();
            if let Some(writer) = writer {
                if writer.send(chunk).await.is_err() {
                    debug!(
                        "intercept: mirror writer closed mid-stream, url={}",
                        self.ctx.request.url
                    );
                    lock_unpoisoned(&self.mirror).writer = None;
                }
            }
        }
    }

    async fn on_response_end(
        &mut self,
        controller: &mut DispatchController,
        trailers: Option<&HeaderMap>,
    ) {
        if self.ctx.dropped() || self.torn_down() {
            self.inner.on_response_end(controller, trailers).await;
            return;
        }

        if self.ctx.send_body == Some(true) {
            let (writer, task) = {
                let mut stream = lock_unpoisoned(&self.mirror);
                (stream.writer.take(), stream.task.take())
            };
            // Dropping the writer ends the chunked body.
            drop(writer);
            if let Some(task) = task {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        error!(
                            "intercept: mirror body task failed, url={}, error={}",
                            self.ctx.request.url, e
                        );
                    }
                }
            }
        }

        if self.ctx.send_meta == Some(true) {
            let digest = self.ctx.hasher.digest();
            self.ctx.response.hash = Some(digest);
            self.send_meta_report(digest);
        }

        self.inner.on_response_end(controller, trailers).await;
    }

    async fn on_response_error(
        &mut self,
        controller: &mut DispatchController,
        error: &anyhow::Error,
    ) {
        let first_teardown = !self.torn_down.swap(true, Ordering::SeqCst);
        if first_teardown && self.ctx.send_meta == Some(true) {
            error!(
                "intercept: transaction failed, url={}, error={}",
                self.ctx.request.url, error
            );
        }
        teardown_mirror(&self.mirror);

        self.inner.on_response_error(controller, error).await;
    }
}

/// Drop the writer (ends the body) and abort the in-flight POST.
fn teardown_mirror(mirror: &Mutex<MirrorStream>) {
    let (writer, task) = {
        let mut stream = lock_unpoisoned(mirror);
        (stream.writer.take(), stream.task.take())
    };
    drop(writer);
    if let Some(task) = task {
        task.abort();
    }
}

/// The mirror state stays valid after a panic elsewhere (it is only ever
/// appended to or torn down), so a poisoned lock is recovered, not
/// propagated.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Path with query string and fragment stripped; empty paths normalize
/// to `/`. Identity hashing is query-insensitive.
fn bare_path(path: &str) -> &str {
    let bare = path
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or("");
    if bare.is_empty() {
        "/"
    } else {
        bare
    }
}

fn json_header_value<T: Serialize>(value: &T) -> Option<HeaderValue> {
    let json = serde_json::to_string(value).ok()?;
    match HeaderValue::from_str(&json) {
        Ok(v) => Some(v),
        Err(_) => {
            debug!("intercept: descriptor header not representable, skipped");
            None
        }
    }
}

#[derive(Serialize)]
struct RequestDescriptor<'a> {
    url: &'a str,
    headers: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct ResponseDescriptor {
    headers: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct MetaReport<'a> {
    timestamp: u64,
    request: RequestDescriptor<'a>,
    response: MetaResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaResponse {
    code: u16,
    headers: serde_json::Map<String, serde_json::Value>,
    body_hash: String,
    body_size: u64,
}
