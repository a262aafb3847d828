use super::context::InterceptorContext;
use http::header::{CONTENT_LENGTH, COOKIE, SET_COOKIE};

/// Request admission: GET only, matching domain, no skip-listed header,
/// no session cookie. Short-circuits on the first disqualifier.
pub(crate) fn admit_request(ctx: &InterceptorContext) -> bool {
    let opts = &ctx.options;

    if ctx.request.method != "GET" {
        return false;
    }

    if !matches_domain(
        ctx.request.domain.as_deref(),
        opts.matching_domains.as_deref(),
    ) {
        return false;
    }

    for name in ctx.request.headers.keys() {
        // HeaderName is always lowercase, as are the compiled skip sets.
        if opts.skip_request_headers.contains(name.as_str()) {
            return false;
        }
    }

    for cookie in ctx.request.headers.get_all(COOKIE) {
        if let Ok(raw) = cookie.to_str() {
            for name in cookie_names(raw) {
                if opts.skip_cookie_ids.contains(&name) {
                    return false;
                }
            }
        }
    }

    true
}

/// Response admission: status gate, no skip-listed header, no session
/// cookie in `Set-Cookie`, and `Content-Length` within bounds. A response
/// without `Content-Length` is admitted; size filtering is best-effort at
/// stream start.
pub(crate) fn admit_response(ctx: &InterceptorContext) -> bool {
    let opts = &ctx.options;

    let status_ok = match &opts.raw.intercept_response_status_codes {
        Some(predicate) => predicate(ctx.response.status),
        None => (200..300).contains(&ctx.response.status),
    };
    if !status_ok {
        return false;
    }

    for name in ctx.response.headers.keys() {
        if opts.skip_response_headers.contains(name.as_str()) {
            return false;
        }
    }

    for set_cookie in ctx.response.headers.get_all(SET_COOKIE) {
        if let Ok(raw) = set_cookie.to_str() {
            if let Some(name) = set_cookie_name(raw) {
                if opts.skip_cookie_ids.contains(&name) {
                    return false;
                }
            }
        }
    }

    if let Some(length) = content_length(ctx) {
        if length > opts.raw.max_response_size {
            return false;
        }
    }

    true
}

/// Suffix match against dot-prefixed domain configuration. No configured
/// suffixes means everything matches; an unknown domain never does.
pub(crate) fn matches_domain(domain: Option<&str>, suffixes: Option<&[String]>) -> bool {
    let suffixes = match suffixes {
        Some(s) if !s.is_empty() => s,
        _ => return true,
    };
    let domain = match domain {
        Some(d) => d,
        None => return false,
    };
    suffixes.iter().any(|suffix| domain.ends_with(suffix.as_str()))
}

pub(crate) fn content_length(ctx: &InterceptorContext) -> Option<u64> {
    ctx.response
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// All `name=value` pair names in a `Cookie` header value, lowercased.
fn cookie_names(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, _)| name.trim().to_ascii_lowercase())
}

/// The cookie name of a `Set-Cookie` value: the first segment only, since
/// the rest are attributes (`Path`, `HttpOnly`, ...), not cookie names.
fn set_cookie_name(raw: &str) -> Option<String> {
    raw.split(';')
        .next()
        .and_then(|pair| pair.split_once('='))
        .map(|(name, _)| name.trim().to_ascii_lowercase())
}
