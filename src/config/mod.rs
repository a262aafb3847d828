pub mod types;


pub use types::*;

use crate::error::InterceptorError;
use http::{HeaderValue, Uri};
use std::collections::HashSet;

impl TrafficInterceptorOptions {
    pub fn validate(&self) -> Result<(), InterceptorError> {
        if self.bloom_filter.size == 0 {
            return Err(InterceptorError::Config(
                "bloom filter size must be at least 1".to_string(),
            ));
        }
        if !(self.bloom_filter.error_rate > 0.0 && self.bloom_filter.error_rate < 1.0) {
            return Err(InterceptorError::Config(format!(
                "bloom filter error rate must be in (0, 1), got {}",
                self.bloom_filter.error_rate
            )));
        }
        if self.max_response_size == 0 {
            return Err(InterceptorError::Config(
                "max response size must be positive".to_string(),
            ));
        }
        if self.traffic_inspector.url.is_empty() {
            return Err(InterceptorError::Config(
                "traffic inspector url must not be empty".to_string(),
            ));
        }
        for path in [
            &self.traffic_inspector.path_send_body,
            &self.traffic_inspector.path_send_meta,
        ] {
            let endpoint = format!("{}{}", self.traffic_inspector.url, path);
            if endpoint.parse::<Uri>().is_err() {
                return Err(InterceptorError::Config(format!(
                    "traffic inspector endpoint is not a valid url: {}",
                    endpoint
                )));
            }
        }
        if let Some(ref domains) = self.matching_domains {
            if domains.is_empty() {
                return Err(InterceptorError::Config(
                    "matching domains must not be an empty list".to_string(),
                ));
            }
            if domains.iter().any(|d| d.is_empty()) {
                return Err(InterceptorError::Config(
                    "matching domains must not contain empty entries".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Validate and turn the serde-facing options into the immutable
    /// runtime form: skip lists become lowercase hash sets and the labels
    /// header is pre-rendered once.
    pub(crate) fn compile(self) -> Result<CompiledOptions, InterceptorError> {
        self.validate()?;

        let lower_set = |names: &[String]| -> HashSet<String> {
            names.iter().map(|n| n.to_ascii_lowercase()).collect()
        };

        let skip_request_headers = lower_set(&self.skipping_request_headers);
        let skip_response_headers = lower_set(&self.skipping_response_headers);
        let skip_cookie_ids = lower_set(&self.skipping_cookie_session_ids);
        let matching_domains = self
            .matching_domains
            .as_ref()
            .map(|ds| ds.iter().map(|d| d.to_ascii_lowercase()).collect());

        let labels_json =
            serde_json::to_string(&self.labels).map_err(|e| {
                InterceptorError::Config(format!("labels are not json-encodable: {}", e))
            })?;
        let labels_header = HeaderValue::from_str(&labels_json).map_err(|_| {
            InterceptorError::Config(
                "labels contain bytes not representable in a header value".to_string(),
            )
        })?;

        Ok(CompiledOptions {
            skip_request_headers,
            skip_response_headers,
            skip_cookie_ids,
            matching_domains,
            labels_json,
            labels_header,
            raw: self,
        })
    }
}

/// Runtime form of the options: validated, normalized, shared behind an
/// `Arc` across every transaction of one interceptor.
pub(crate) struct CompiledOptions {
    pub raw: TrafficInterceptorOptions,
    pub skip_request_headers: HashSet<String>,
    pub skip_response_headers: HashSet<String>,
    pub skip_cookie_ids: HashSet<String>,
    /// Lowercased copy of `raw.matching_domains`.
    pub matching_domains: Option<Vec<String>>,
    pub labels_json: String,
    pub labels_header: HeaderValue,
}
