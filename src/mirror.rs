use crate::config::TrafficInspectorConfig;
use crate::error::InterceptorError;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::Request;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::sync::mpsc;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Chunked request body fed from a bounded channel. The sender side is the
/// mirror writer; dropping it ends the body.
pub fn channel_body(rx: mpsc::Receiver<Bytes>) -> BoxBody {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, hyper::Error>(Frame::data(chunk)), rx))
    });
    BodyExt::boxed(StreamBody::new(stream))
}

/// Connection-pooled client bound to the collector. Shared across all
/// transactions of one interceptor; requests are independent and never
/// retried.
#[derive(Clone)]
pub struct MirrorClient {
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    body_uri: Uri,
    meta_uri: Uri,
}

impl MirrorClient {
    pub fn new(config: &TrafficInspectorConfig) -> Result<Self, InterceptorError> {
        let parse = |path: &str| -> Result<Uri, InterceptorError> {
            let endpoint = format!("{}{}", config.url, path);
            endpoint.parse::<Uri>().map_err(|_| {
                InterceptorError::Config(format!(
                    "traffic inspector endpoint is not a valid url: {}",
                    endpoint
                ))
            })
        };

        Ok(Self {
            client: build_mirror_http_client(config),
            body_uri: parse(&config.path_send_body)?,
            meta_uri: parse(&config.path_send_meta)?,
        })
    }

    /// Streaming POST of raw response bytes to the body endpoint. Resolves
    /// once the collector has answered; any 2xx is success.
    pub async fn post_body(
        &self,
        headers: HeaderMap,
        body: BoxBody,
    ) -> Result<(), InterceptorError> {
        self.post(self.body_uri.clone(), headers, body).await
    }

    /// Buffered POST of the metadata payload to the meta endpoint.
    pub async fn post_meta(
        &self,
        headers: HeaderMap,
        payload: Vec<u8>,
    ) -> Result<(), InterceptorError> {
        self.post(self.meta_uri.clone(), headers, full_body(payload))
            .await
    }

    async fn post(
        &self,
        uri: Uri,
        headers: HeaderMap,
        body: BoxBody,
    ) -> Result<(), InterceptorError> {
        let mut req = Request::new(body);
        *req.method_mut() = Method::POST;
        *req.uri_mut() = uri;
        req.headers_mut().extend(headers);

        let resp = self
            .client
            .request(req)
            .await
            .map_err(InterceptorError::Http)?;
        let status = resp.status();

        // Drain the (small) collector reply so the connection returns to
        // the pool.
        let _ = resp.into_body().collect().await;

        if !status.is_success() {
            return Err(InterceptorError::Collector(status.as_u16()));
        }
        Ok(())
    }
}

/// Pooled hyper client for the collector: plain `http://` goes through the
/// inner connector, `https://` is terminated with rustls (webpki roots),
/// HTTP/2 negotiated via ALPN.
fn build_mirror_http_client(
    config: &TrafficInspectorConfig,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(config.keepalive_pool.idle_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs_f64(config.connect_timeout)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(config.keepalive_pool.idle_timeout))
        .pool_max_idle_per_host(config.keepalive_pool.size)
        .build(https)
}
