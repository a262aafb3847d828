use http::header::ORIGIN;
use http::HeaderMap;

/// The transaction origin: an explicit `Origin` header wins over the
/// dispatcher-provided origin.
pub(crate) fn extract_origin(dispatch_origin: &str, headers: &HeaderMap) -> String {
    headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(dispatch_origin)
        .to_string()
}

/// Bare domain for suffix matching: accepts `scheme://host[:port]`,
/// `host:port`, or `host`; strips the scheme and port, lowercases, and
/// prepends a dot so `.plt.local` matches `sub.plt.local` but not
/// `notplt.local`. Empty input yields `None`.
pub(crate) fn extract_domain(origin_or_host: &str) -> Option<String> {
    let host = origin_or_host
        .strip_prefix("http://")
        .or_else(|| origin_or_host.strip_prefix("https://"))
        .unwrap_or(origin_or_host);
    let host = host.split(':').next().unwrap_or("");
    if host.is_empty() {
        return None;
    }

    let mut domain = String::with_capacity(host.len() + 1);
    domain.push('.');
    domain.push_str(&host.to_ascii_lowercase());
    Some(domain)
}
