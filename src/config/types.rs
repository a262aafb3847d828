use crate::intercept::InterceptorContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Predicate over a response status code, replacing the built-in 2xx check.
pub type StatusPredicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Predicate over the transaction context, replacing a built-in admission
/// predicate wholesale.
pub type ContextPredicate = Arc<dyn Fn(&InterceptorContext) -> bool + Send + Sync>;

/// Options for one interceptor instance. Deep-cloned and compiled at
/// construction; immutable afterwards.
#[derive(Clone, Serialize, Deserialize)]
pub struct TrafficInterceptorOptions {
    /// Labels attached to every mirrored transaction (`x-labels` header
    /// and the meta payload).
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// The collector receiving mirrored bodies and metadata.
    pub traffic_inspector: TrafficInspectorConfig,

    /// Sizing for the request-identity Bloom filter.
    #[serde(default)]
    pub bloom_filter: BloomFilterConfig,

    /// Responses with a `Content-Length` strictly greater than this are
    /// not mirrored.
    #[serde(default = "default_max_response_size")]
    pub max_response_size: u64,

    /// Dot-prefixed lowercase domain suffixes, e.g. `.plt.local`. When
    /// absent, all domains match; when present, non-matching domains are
    /// dropped.
    #[serde(default)]
    pub matching_domains: Option<Vec<String>>,

    /// Lowercase request header names whose presence drops the request.
    #[serde(default = "default_skipping_request_headers")]
    pub skipping_request_headers: Vec<String>,

    /// Lowercase response header names whose presence drops the response.
    #[serde(default = "default_skipping_response_headers")]
    pub skipping_response_headers: Vec<String>,

    /// Lowercase cookie names indicating auth/session state; a request or
    /// response carrying one is dropped.
    #[serde(default = "default_skipping_cookie_session_ids")]
    pub skipping_cookie_session_ids: Vec<String>,

    /// Override for the response status gate (default: `200 ≤ code < 300`).
    #[serde(skip)]
    pub intercept_response_status_codes: Option<StatusPredicate>,

    /// Override replacing the built-in request admission predicate.
    #[serde(skip)]
    pub intercept_request: Option<ContextPredicate>,

    /// Override replacing the built-in response admission predicate.
    #[serde(skip)]
    pub intercept_response: Option<ContextPredicate>,
}

impl std::fmt::Debug for TrafficInterceptorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficInterceptorOptions")
            .field("labels", &self.labels)
            .field("traffic_inspector", &self.traffic_inspector)
            .field("bloom_filter", &self.bloom_filter)
            .field("max_response_size", &self.max_response_size)
            .field("matching_domains", &self.matching_domains)
            .field("skipping_request_headers", &self.skipping_request_headers)
            .field("skipping_response_headers", &self.skipping_response_headers)
            .field(
                "skipping_cookie_session_ids",
                &self.skipping_cookie_session_ids,
            )
            .field(
                "intercept_response_status_codes",
                &self.intercept_response_status_codes.as_ref().map(|_| "<fn>"),
            )
            .field(
                "intercept_request",
                &self.intercept_request.as_ref().map(|_| "<fn>"),
            )
            .field(
                "intercept_response",
                &self.intercept_response.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl TrafficInterceptorOptions {
    /// Options pointed at `url` with every other knob at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            labels: HashMap::new(),
            traffic_inspector: TrafficInspectorConfig {
                url: url.into(),
                ..TrafficInspectorConfig::default()
            },
            bloom_filter: BloomFilterConfig::default(),
            max_response_size: default_max_response_size(),
            matching_domains: None,
            skipping_request_headers: default_skipping_request_headers(),
            skipping_response_headers: default_skipping_response_headers(),
            skipping_cookie_session_ids: default_skipping_cookie_session_ids(),
            intercept_response_status_codes: None,
            intercept_request: None,
            intercept_response: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficInspectorConfig {
    /// Collector base URL, e.g. `http://inspector.plt.local:9876`.
    #[serde(default)]
    pub url: String,

    /// Path receiving mirrored response bodies.
    #[serde(default = "default_path_send_body")]
    pub path_send_body: String,

    /// Path receiving transaction metadata.
    #[serde(default = "default_path_send_meta")]
    pub path_send_meta: String,

    /// Connect timeout towards the collector (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,

    /// Connection pool towards the collector.
    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,
}

impl Default for TrafficInspectorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            path_send_body: default_path_send_body(),
            path_send_meta: default_path_send_meta(),
            connect_timeout: default_connect_timeout(),
            keepalive_pool: KeepalivePoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    /// Idle connection timeout (seconds).
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout: u64,

    /// Max idle connections kept per collector host.
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_pool_idle_timeout(),
            size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilterConfig {
    /// Expected number of distinct request identities.
    #[serde(default = "default_bloom_size")]
    pub size: usize,

    /// Target false-positive rate, in (0, 1).
    #[serde(default = "default_bloom_error_rate")]
    pub error_rate: f64,
}

impl Default for BloomFilterConfig {
    fn default() -> Self {
        Self {
            size: default_bloom_size(),
            error_rate: default_bloom_error_rate(),
        }
    }
}

fn default_max_response_size() -> u64 {
    5 * 1024 * 1024
}

fn default_path_send_body() -> String {
    "/traffic/body".to_string()
}

fn default_path_send_meta() -> String {
    "/traffic/meta".to_string()
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_pool_idle_timeout() -> u64 {
    30
}

fn default_pool_size() -> usize {
    32
}

fn default_bloom_size() -> usize {
    10_000
}

fn default_bloom_error_rate() -> f64 {
    0.01
}

fn default_skipping_request_headers() -> Vec<String> {
    [
        "cache-control",
        "pragma",
        "if-none-match",
        "if-modified-since",
        "authorization",
        "proxy-authorization",
    ]
    .map(str::to_string)
    .to_vec()
}

fn default_skipping_response_headers() -> Vec<String> {
    [
        "etag",
        "last-modified",
        "expires",
        "cache-control",
        "authorization",
        "proxy-authenticate",
        "www-authenticate",
        "set-cookie",
    ]
    .map(str::to_string)
    .to_vec()
}

fn default_skipping_cookie_session_ids() -> Vec<String> {
    [
        "jsessionid",
        "phpsessid",
        "asp.net_sessionid",
        "connect.sid",
        "sid",
        "ssid",
        "auth_token",
        "access_token",
        "csrf_token",
        "xsrf-token",
        "x-csrf-token",
        "session",
        "refreshtoken",
        "token",
        "sessionid",
        "csrftoken",
        "authtoken",
        "accesstoken",
    ]
    .map(str::to_string)
    .to_vec()
}
