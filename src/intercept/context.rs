use crate::config::CompiledOptions;
use crate::hash::StreamingHasher;
use http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Request-side descriptor, populated at `on_request_start`.
#[derive(Default)]
pub struct RequestState {
    pub method: String,
    pub headers: HeaderMap,
    /// Epoch milliseconds at context creation.
    pub timestamp: u64,
    /// `origin + path`, query and fragment stripped. Hashed for identity.
    pub url: String,
    pub origin: String,
    /// Dot-prefixed lowercase domain, only computed when domain filtering
    /// is configured.
    pub domain: Option<String>,
    /// 64-bit identity hash of `url`, the Bloom key.
    pub hash: Option<u64>,
}

/// Response-side descriptor, populated at `on_response_start`.
#[derive(Default)]
pub struct ResponseState {
    pub status: u16,
    pub headers: HeaderMap,
    /// Digest of the full response body, finalized at `on_response_end`.
    pub hash: Option<u64>,
}

/// Per-transaction state carried across the six lifecycle callbacks.
/// Owned exclusively by its state machine; callbacks for one transaction
/// are serialized, so no field needs a lock.
pub struct InterceptorContext {
    pub(crate) options: Arc<CompiledOptions>,
    pub hasher: StreamingHasher,
    pub request: RequestState,
    pub response: ResponseState,
    pub labels: HashMap<String, String>,
    /// None until the request predicate ran.
    pub intercept_request: Option<bool>,
    /// None until the response predicate ran.
    pub intercept_response: Option<bool>,
    pub send_meta: Option<bool>,
    pub send_body: Option<bool>,
}

impl InterceptorContext {
    pub(crate) fn new(options: Arc<CompiledOptions>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            labels: options.raw.labels.clone(),
            options,
            hasher: StreamingHasher::new(),
            request: RequestState {
                timestamp,
                ..RequestState::default()
            },
            response: ResponseState::default(),
            intercept_request: None,
            intercept_response: None,
            send_meta: None,
            send_body: None,
        }
    }

    /// True once either predicate rejected the transaction.
    pub(crate) fn dropped(&self) -> bool {
        self.intercept_request == Some(false) || self.intercept_response == Some(false)
    }
}

/// Flatten a header map into a JSON object, joining repeated headers with
/// `", "`. Values that are not valid UTF-8 are skipped.
pub(crate) fn headers_to_json(headers: &HeaderMap) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for key in headers.keys() {
        let joined = headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(key.as_str().to_string(), serde_json::Value::String(joined));
    }
    map
}
